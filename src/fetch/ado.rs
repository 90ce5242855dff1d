/// REST client for the tracker.
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::rate_limit::{RateLimiter, DEFAULT_SPACING};
use super::revisions::{snapshots_to_records, RevisionBatch};
use super::transport::Transport;
use super::ChangeFeed;
use crate::aggregate::FetchFailure;
use crate::cache::{CacheKey, CacheStats, Clock, ResultCache, SystemClock};
use crate::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_DURATION};
use crate::error::FetchError;
use crate::model::{fields, ChangeRecord, ListResponse, WorkItem};
use crate::reconcile::CancelFlag;
use crate::timefmt::{format_wiql_instant, parse_state_change_date};
use crate::wiql::{build_project_query, ProjectRule};
use crate::window::AnalysisWindow;

const API_VERSION: &str = "7.0";

/// Maximum ids per work item details request.
pub const WORK_ITEM_BATCH: usize = 200;

/// Page size of the updates endpoint.
const UPDATES_PAGE: usize = 200;

/// Upper bound on update pages fetched for one item.
const MAX_UPDATE_PAGES: usize = 50;

/// Tuning knobs for [`AdoClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub rate_limit: Duration,
    pub cache_duration: Duration,
    pub cache_capacity: usize,
    /// Upper bound on continuation pages per (project, day) revision scan
    pub max_revision_pages: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            rate_limit: DEFAULT_SPACING,
            cache_duration: DEFAULT_CACHE_DURATION,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_revision_pages: 100,
        }
    }
}

/// Result of the per-project WIQL discovery.
#[derive(Debug, Clone, Default)]
pub struct WiqlOutcome {
    /// Matching ids, first-seen order, no duplicates
    pub ids: Vec<u32>,
    /// Executed queries, one per project
    pub queries: Vec<String>,
    pub failures: Vec<FetchFailure>,
}

/// Result of the bulk revisions scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Union of ids seen in any (project, day), ascending
    pub ids: Vec<u32>,
    /// State changes derived from the snapshots
    pub records: Vec<ChangeRecord>,
    pub failures: Vec<FetchFailure>,
}

/// Result of a batched work item details fetch.
#[derive(Debug, Clone, Default)]
pub struct WorkItemsOutcome {
    pub items: Vec<WorkItem>,
    pub failures: Vec<FetchFailure>,
}

#[derive(Debug, Deserialize)]
struct WiqlResponse {
    #[serde(default, rename = "workItems")]
    work_items: Vec<WorkItemRef>,
}

#[derive(Debug, Deserialize)]
struct WorkItemRef {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    name: String,
}

fn new_cache<V: Clone>(settings: &ClientSettings, clock: &Arc<dyn Clock>) -> ResultCache<V> {
    ResultCache::with_settings(
        settings.cache_duration,
        settings.cache_capacity,
        Arc::clone(clock),
    )
}

/// Client for one organization.
pub struct AdoClient {
    base: Url,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    request_timeout: Duration,
    max_revision_pages: usize,
    items: ResultCache<Vec<WorkItem>>,
    updates: ResultCache<Vec<ChangeRecord>>,
    revisions: ResultCache<Vec<WorkItem>>,
}

impl AdoClient {
    pub fn new(base: Url, transport: Arc<dyn Transport>, settings: &ClientSettings) -> Self {
        Self::with_clock(base, transport, settings, Arc::new(SystemClock))
    }

    /// Same as [`AdoClient::new`] with an explicit cache clock.
    pub fn with_clock(
        base: Url,
        transport: Arc<dyn Transport>,
        settings: &ClientSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base,
            transport,
            limiter: Arc::new(RateLimiter::new(settings.rate_limit)),
            request_timeout: settings.request_timeout,
            max_revision_pages: settings.max_revision_pages.max(1),
            items: new_cache(settings, &clock),
            updates: new_cache(settings, &clock),
            revisions: new_cache(settings, &clock),
        }
    }

    pub fn organization_url(&self) -> &Url {
        &self.base
    }

    /// Cache counters: (work items, updates, revisions).
    pub fn cache_stats(&self) -> (CacheStats, CacheStats, CacheStats) {
        (
            self.items.stats(),
            self.updates.stats(),
            self.revisions.stats(),
        )
    }

    fn endpoint(&self, project: Option<&str>, path: &[&str], query: &[(&str, String)]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            if let Some(project) = project {
                segments.push(project);
            }
            segments.extend(path);
        }
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
            pairs.append_pair("api-version", API_VERSION);
        }
        url.to_string()
    }

    /// Rate-limited, time-bounded call on the blocking pool.
    async fn call(&self, url: &str, body: Option<Value>) -> Result<Value, FetchError> {
        self.limiter.acquire().await;

        let transport = Arc::clone(&self.transport);
        let worker_url = url.to_string();
        let task = tokio::task::spawn_blocking(move || match body {
            Some(body) => transport.post_json(&worker_url, &body),
            None => transport.get_json(&worker_url),
        });

        match tokio::time::timeout(self.request_timeout, task).await {
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                after: self.request_timeout,
            }),
            Ok(Err(join_error)) => Err(FetchError::Worker {
                url: url.to_string(),
                message: join_error.to_string(),
            }),
            Ok(Ok(result)) => result,
        }
    }

    async fn call_decoded<T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<Value>,
    ) -> Result<T, FetchError> {
        let value = self.call(url, body).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Names of all team projects in the organization.
    pub async fn team_projects(&self) -> Result<Vec<String>, FetchError> {
        let url = self.endpoint(None, &["_apis", "projects"], &[]);
        let response: ListResponse<ProjectRef> = self.call_decoded(&url, None).await?;
        Ok(response.value.into_iter().map(|p| p.name).collect())
    }

    /// Probe the projects endpoint and return the reported project count.
    pub async fn health_check(&self) -> Result<u64, FetchError> {
        let url = self.endpoint(None, &["_apis", "projects"], &[]);
        let response: ListResponse<ProjectRef> = self.call_decoded(&url, None).await?;
        Ok(response
            .count
            .unwrap_or(response.value.len() as u64))
    }

    /// Execute an arbitrary WIQL query and return the matching ids.
    pub async fn run_raw_wiql(&self, query: &str) -> Result<Vec<u32>, FetchError> {
        let url = self.endpoint(
            None,
            &["_apis", "wit", "wiql"],
            &[("timePrecision", "true".to_string())],
        );
        let response: WiqlResponse = self
            .call_decoded(&url, Some(json!({ "query": query })))
            .await?;
        Ok(response.work_items.into_iter().map(|w| w.id).collect())
    }

    /// One WIQL query per project for items whose state changed inside `window`.
    ///
    /// A failing project is logged and recorded; the others still run.
    pub async fn run_wiql(
        &self,
        projects: &[String],
        work_item_types: &[String],
        window: &AnalysisWindow,
        rules: &BTreeMap<String, ProjectRule>,
    ) -> WiqlOutcome {
        let mut outcome = WiqlOutcome::default();
        let mut seen = HashSet::new();

        for project in projects {
            let query = build_project_query(project, work_item_types, window, rules.get(project));
            tracing::debug!("Executing query for {}:\n{}", project, query);

            match self.run_raw_wiql(&query).await {
                Ok(ids) => {
                    tracing::info!("WIQL for {} matched {} item(s)", project, ids.len());
                    outcome
                        .ids
                        .extend(ids.into_iter().filter(|id| seen.insert(*id)));
                }
                Err(e) => {
                    tracing::warn!("Error executing query for {}: {}", project, e);
                    outcome
                        .failures
                        .push(FetchFailure::new(format!("project {}", project), &e));
                }
            }
            outcome.queries.push(query);
        }

        outcome
    }

    /// Work item details, fetched in batches of [`WORK_ITEM_BATCH`] ids.
    ///
    /// Repeated ids are fetched once. A failing batch is logged and skipped.
    /// Ids the server no longer knows are omitted.
    pub async fn work_items(&self, ids: &[u32]) -> WorkItemsOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<u32> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let mut outcome = WorkItemsOutcome::default();

        for batch in unique.chunks(WORK_ITEM_BATCH) {
            let key = CacheKey::WorkItems(batch.to_vec());
            if let Some(cached) = self.items.get(&key) {
                outcome.items.extend(cached);
                continue;
            }

            let id_list = batch
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let url = self.endpoint(
                None,
                &["_apis", "wit", "workitems"],
                &[("ids", id_list), ("errorPolicy", "omit".to_string())],
            );

            match self
                .call_decoded::<ListResponse<Option<WorkItem>>>(&url, None)
                .await
            {
                Ok(response) => {
                    let items: Vec<WorkItem> = response.value.into_iter().flatten().collect();
                    self.items.put(key, items.clone());
                    outcome.items.extend(items);
                }
                Err(e) => {
                    let first = batch.first().copied().unwrap_or_default();
                    let last = batch.last().copied().unwrap_or_default();
                    tracing::warn!("Error fetching work items {}..{}: {}", first, last, e);
                    outcome.failures.push(FetchFailure::new(
                        format!("work items {}..{} ({} ids)", first, last, batch.len()),
                        &e,
                    ));
                }
            }
        }

        outcome
    }

    /// Full update history of one work item, oldest first.
    pub async fn work_item_updates(&self, id: u32) -> Result<Vec<ChangeRecord>, FetchError> {
        let key = CacheKey::Updates(id);
        if let Some(cached) = self.updates.get(&key) {
            return Ok(cached);
        }

        let id_segment = id.to_string();
        let mut updates = Vec::new();
        for page in 0..MAX_UPDATE_PAGES {
            let url = self.endpoint(
                None,
                &["_apis", "wit", "workitems", &id_segment, "updates"],
                &[
                    ("$top", UPDATES_PAGE.to_string()),
                    ("$skip", (page * UPDATES_PAGE).to_string()),
                ],
            );
            let response: ListResponse<ChangeRecord> = self.call_decoded(&url, None).await?;
            let page_len = response.value.len();
            updates.extend(response.value);
            if page_len < UPDATES_PAGE {
                break;
            }
        }

        self.updates.put(key, updates.clone());
        Ok(updates)
    }

    /// Scan reporting revisions for every (project, UTC day) pair of the window.
    ///
    /// Returns the union of item ids and the state changes derived from the
    /// snapshots. A failing (project, day) is logged and skipped. Once `cancel`
    /// is set no further (project, day) is requested.
    pub async fn scan_revisions(
        &self,
        projects: &[String],
        work_item_types: &[String],
        window: &AnalysisWindow,
        cancel: &CancelFlag,
    ) -> ScanOutcome {
        let mut snapshots = Vec::new();
        let mut failures = Vec::new();
        let slices = window.daily_slices();

        'projects: for project in projects {
            for slice in &slices {
                if cancel.is_cancelled() {
                    tracing::info!("Revision scan cancelled before {}", project);
                    break 'projects;
                }
                let day = slice.start().date_naive();
                match self.scan_slice(project, work_item_types, slice).await {
                    Ok(revisions) => {
                        tracing::debug!(
                            "Revisions for {} on {}: {} in range",
                            project,
                            day,
                            revisions.len()
                        );
                        snapshots.extend(revisions);
                    }
                    Err(e) => {
                        tracing::warn!("Error scanning revisions for {} on {}: {}", project, day, e);
                        failures.push(FetchFailure::new(
                            format!("project {} ({})", project, day),
                            &e,
                        ));
                    }
                }
            }
        }

        let ids: BTreeSet<u32> = snapshots.iter().map(|s| s.id).collect();
        let records = snapshots_to_records(snapshots);
        tracing::info!(
            "Revision scan found {} unique item(s), {} state change(s)",
            ids.len(),
            records.len()
        );

        ScanOutcome {
            ids: ids.into_iter().collect(),
            records,
            failures,
        }
    }

    /// Revisions of one project whose changed date falls inside `slice`.
    async fn scan_slice(
        &self,
        project: &str,
        work_item_types: &[String],
        slice: &AnalysisWindow,
    ) -> Result<Vec<WorkItem>, FetchError> {
        let key = CacheKey::Revisions {
            project: project.to_string(),
            start: slice.start().timestamp(),
            end: slice.end().timestamp(),
            types: work_item_types.iter().cloned().collect(),
        };
        if let Some(cached) = self.revisions.get(&key) {
            return Ok(cached);
        }

        let body = json!({
            "fields": fields::REVISION_FIELDS,
            "types": work_item_types,
            "includeLatestOnly": false,
        });
        let mut continuation: Option<String> = None;
        let mut kept = Vec::new();

        for page in 1..=self.max_revision_pages {
            let mut query = vec![("startDateTime", format_wiql_instant(slice.start()))];
            if let Some(token) = &continuation {
                query.push(("continuationToken", token.clone()));
            }
            let url = self.endpoint(
                Some(project),
                &["_apis", "wit", "reporting", "workitemrevisions"],
                &query,
            );
            let batch: RevisionBatch = self.call_decoded(&url, Some(body.clone())).await?;

            // Revisions come back in change order; a page entirely past the
            // slice means the rest is too.
            let mut past_slice = !batch.values.is_empty();
            for revision in batch.values {
                let changed = revision
                    .field_text(fields::CHANGED_DATE)
                    .and_then(|raw| parse_state_change_date(&raw).ok());
                match changed {
                    Some(ts) if slice.contains(ts) => {
                        past_slice = false;
                        kept.push(revision);
                    }
                    Some(ts) if ts > slice.end() => {}
                    _ => past_slice = false,
                }
            }

            if batch.is_last_batch || past_slice {
                break;
            }
            match batch.continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
            if page == self.max_revision_pages {
                tracing::warn!(
                    "Stopped revision scan for {} after {} pages",
                    project,
                    page
                );
            }
        }

        self.revisions.put(key, kept.clone());
        Ok(kept)
    }
}

impl ChangeFeed for AdoClient {
    async fn records_for(&self, id: u32) -> Result<Vec<ChangeRecord>, FetchError> {
        self.work_item_updates(id).await
    }
}
