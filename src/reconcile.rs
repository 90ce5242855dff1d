/// State-change reconciliation.
///
/// Scans change records, keeps the transitions into selected states whose
/// `StateChangeDate` falls inside the window (both bounds inclusive),
/// deduplicates them on (work item id, new state, raw timestamp) and
/// accumulates per-state counts and detail records.
///
/// Fetching may overlap on a bounded number of in-flight requests, but
/// results are consumed in input order on a single task, so the aggregate
/// does not depend on completion order.
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aggregate::{Aggregate, FetchFailure, TransitionRecord};
use crate::error::ReconcileError;
use crate::fetch::{enrich, ChangeFeed};
use crate::model::{fields, ChangeRecord, ItemDetails, WorkItem};
use crate::timefmt::parse_state_change_date;
use crate::window::AnalysisWindow;

/// Default number of history fetches kept in flight.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Author shown when a change carries no identity.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Called with (items done, items total) after each fetched item.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Input to a reconciliation run.
#[derive(Debug, Clone)]
pub enum ChangeSource {
    /// Items whose update history is fetched and enriched with the item's details
    Items(Vec<WorkItem>),
    /// Bare ids whose update history is fetched
    Ids(Vec<u32>),
    /// Records that are already materialized (e.g. derived from revision snapshots)
    Records(Vec<ChangeRecord>),
}

/// Cooperative cancellation shared between the caller and a running reconciliation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters describing what happened to the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub items_fetched: usize,
    pub items_failed: usize,
    pub records_seen: usize,
    pub not_selected: usize,
    pub missing_timestamp: usize,
    pub malformed: usize,
    pub out_of_window: usize,
    pub duplicates: usize,
    pub counted: usize,
}

/// Aggregate plus the signal needed to tell "nothing happened" from "nothing reachable".
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub aggregate: Aggregate,
    pub failures: Vec<FetchFailure>,
    pub stats: ReconcileStats,
}

impl ReconcileOutcome {
    /// True when every history fetch failed and no record was available at all.
    pub fn all_sources_failed(&self) -> bool {
        self.stats.items_failed > 0 && self.stats.items_fetched == 0 && self.stats.records_seen == 0
    }
}

/// Folds records into an aggregate. Owned by the consuming task only.
struct Accumulator<'w> {
    aggregate: Aggregate,
    selected: HashSet<String>,
    window: &'w AnalysisWindow,
    seen: HashSet<(u32, String, String)>,
    stats: ReconcileStats,
}

impl<'w> Accumulator<'w> {
    fn new(selected_states: &[String], window: &'w AnalysisWindow) -> Self {
        Self {
            aggregate: Aggregate::for_states(selected_states),
            selected: selected_states.iter().cloned().collect(),
            window,
            seen: HashSet::new(),
            stats: ReconcileStats::default(),
        }
    }

    fn consume(&mut self, record: &ChangeRecord) {
        self.stats.records_seen += 1;

        let Some(new_state) = record.new_state() else {
            return;
        };
        if !self.selected.contains(&new_state) {
            self.stats.not_selected += 1;
            return;
        }

        // A transition without a timestamp cannot be windowed.
        let Some(raw_date) = record.state_change_date() else {
            self.stats.missing_timestamp += 1;
            return;
        };

        let changed_at = match parse_state_change_date(&raw_date) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(
                    "Skipping revision {} of work item {}: {}",
                    record.rev,
                    record.work_item_id,
                    e
                );
                self.stats.malformed += 1;
                return;
            }
        };

        if !self.window.contains(changed_at) {
            self.stats.out_of_window += 1;
            return;
        }

        let key = (record.work_item_id, new_state.clone(), raw_date.clone());
        if !self.seen.insert(key) {
            self.stats.duplicates += 1;
            return;
        }

        let item = TransitionRecord {
            id: record.work_item_id,
            title: record.detail_text(fields::TITLE),
            date: raw_date,
            project: record.detail_text(fields::TEAM_PROJECT),
            work_item_type: record.detail_text(fields::WORK_ITEM_TYPE),
            area_path: record.detail_text(fields::AREA_PATH),
            tags: record.detail_text(fields::TAGS).unwrap_or_default(),
            old_state: record.old_state(),
            changed_by: record
                .changed_by()
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        };
        if self.aggregate.record(&new_state, item) {
            self.stats.counted += 1;
        }
    }
}

/// Runs reconciliation against a change feed.
pub struct Reconciler<'f, F: ChangeFeed> {
    feed: &'f F,
    concurrency: usize,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
}

impl<'f, F: ChangeFeed> Reconciler<'f, F> {
    pub fn new(feed: &'f F) -> Self {
        Self {
            feed,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancelFlag::new(),
            progress: None,
        }
    }

    /// Number of history fetches kept in flight (at least one).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Reconcile `sources` against `selected_states` and `window`.
    ///
    /// Fails only on an empty state selection, an inverted window, or
    /// cancellation (in which case nothing accumulated so far is returned).
    /// Fetch failures and malformed records are logged and skipped.
    pub async fn reconcile(
        &self,
        sources: Vec<ChangeSource>,
        selected_states: &[String],
        window: &AnalysisWindow,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if selected_states.is_empty() {
            return Err(ReconcileError::NoStatesSelected);
        }
        if window.end() < window.start() {
            return Err(ReconcileError::InvertedWindow {
                start: window.start(),
                end: window.end(),
            });
        }

        let mut acc = Accumulator::new(selected_states, window);
        let mut failures = Vec::new();

        let total: usize = sources
            .iter()
            .map(|source| match source {
                ChangeSource::Items(items) => items.len(),
                ChangeSource::Ids(ids) => ids.len(),
                ChangeSource::Records(_) => 0,
            })
            .sum();
        let mut done = 0;

        for source in sources {
            let units: Vec<(u32, Option<ItemDetails>)> = match source {
                ChangeSource::Records(records) => {
                    for record in &records {
                        self.check_cancelled()?;
                        acc.consume(record);
                    }
                    continue;
                }
                ChangeSource::Items(items) => items
                    .iter()
                    .map(|item| (item.id, Some(item.details())))
                    .collect(),
                ChangeSource::Ids(ids) => ids.into_iter().map(|id| (id, None)).collect(),
            };

            self.check_cancelled()?;
            let feed = self.feed;
            let mut fetched = stream::iter(units)
                .map(move |(id, details)| async move { (id, details, feed.records_for(id).await) })
                .buffered(self.concurrency);

            while let Some((id, details, result)) = fetched.next().await {
                self.check_cancelled()?;

                match result {
                    Ok(mut records) => {
                        acc.stats.items_fetched += 1;
                        if let Some(details) = &details {
                            enrich(&mut records, details);
                        }
                        for record in &records {
                            acc.consume(record);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Error fetching history for work item {}: {}", id, e);
                        acc.stats.items_failed += 1;
                        failures.push(FetchFailure::new(format!("work item {}", id), &e));
                    }
                }

                done += 1;
                if let Some(progress) = &self.progress {
                    progress(done, total);
                }
            }
        }

        tracing::info!(
            "Reconciled {} record(s): {} counted, {} duplicate(s), {} outside window, {} malformed, {} fetch failure(s)",
            acc.stats.records_seen,
            acc.stats.counted,
            acc.stats.duplicates,
            acc.stats.out_of_window,
            acc.stats.malformed,
            failures.len()
        );

        Ok(ReconcileOutcome {
            aggregate: acc.aggregate,
            failures,
            stats: acc.stats,
        })
    }

    fn check_cancelled(&self) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Reconcile with default settings.
pub async fn reconcile<F: ChangeFeed>(
    feed: &F,
    sources: Vec<ChangeSource>,
    selected_states: &[String],
    window: &AnalysisWindow,
) -> Result<ReconcileOutcome, ReconcileError> {
    Reconciler::new(feed)
        .reconcile(sources, selected_states, window)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFeed;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn states(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn january() -> AnalysisWindow {
        AnalysisWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        )
        .unwrap()
    }

    fn transition(id: u32, rev: u32, old: Option<&str>, new: &str, at: &str) -> ChangeRecord {
        ChangeRecord::new(id, rev)
            .with_change(fields::STATE, old, Some(new))
            .with_change(fields::STATE_CHANGE_DATE, None, Some(at))
    }

    fn item(id: u32, title: &str, project: &str) -> WorkItem {
        WorkItem::new(id)
            .with_field(fields::TITLE, title)
            .with_field(fields::TEAM_PROJECT, project)
            .with_field(fields::WORK_ITEM_TYPE, "Bug")
            .with_field(fields::AREA_PATH, project)
    }

    async fn run(
        feed: &MemoryFeed,
        sources: Vec<ChangeSource>,
        selected: &[&str],
    ) -> ReconcileOutcome {
        reconcile(feed, sources, &states(selected), &january())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn single_transition_is_counted() {
        let feed = MemoryFeed::new().with_record(transition(
            101,
            2,
            Some("New"),
            "Active",
            "2024-01-15T10:00:00.000Z",
        ));
        let outcome = run(
            &feed,
            vec![ChangeSource::Items(vec![item(101, "Fix login", "EDW")])],
            &["Active", "Resolved"],
        )
        .await;

        assert_eq!(outcome.aggregate.count("Active"), 1);
        assert_eq!(outcome.aggregate.count("Resolved"), 0);

        let record = &outcome.aggregate.get("Active").unwrap().items[0];
        assert_eq!(record.id, 101);
        assert_eq!(record.title.as_deref(), Some("Fix login"));
        assert_eq!(record.project.as_deref(), Some("EDW"));
        assert_eq!(record.work_item_type.as_deref(), Some("Bug"));
        assert_eq!(record.date, "2024-01-15T10:00:00.000Z");
        assert_eq!(record.old_state.as_deref(), Some("New"));
        assert_eq!(record.changed_by, UNKNOWN_AUTHOR);
        assert_eq!(record.tags, "");
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let feed = MemoryFeed::new()
            .with_record(transition(1, 1, None, "Active", "2024-01-01T00:00:00Z"))
            .with_record(transition(2, 1, None, "Active", "2024-01-31T23:59:59Z"))
            .with_record(transition(3, 1, None, "Active", "2023-12-31T23:59:59Z"))
            .with_record(transition(4, 1, None, "Active", "2024-02-01T00:00:00Z"));
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![1, 2, 3, 4])], &["Active"]).await;

        let ids: Vec<u32> = outcome.aggregate.get("Active").unwrap().items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(outcome.stats.out_of_window, 2);
    }

    #[tokio::test]
    async fn fractional_second_at_end_bound_is_included() {
        let feed = MemoryFeed::new().with_record(transition(
            1,
            1,
            None,
            "Active",
            "2024-01-31T23:59:59.987Z",
        ));
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![1])], &["Active"]).await;
        assert_eq!(outcome.aggregate.count("Active"), 1);
    }

    #[tokio::test]
    async fn duplicate_across_sources_counts_once() {
        let record = transition(101, 3, Some("New"), "Active", "2024-01-15T10:00:00.000Z");
        let feed = MemoryFeed::new().with_record(record.clone());
        let outcome = run(
            &feed,
            vec![
                ChangeSource::Records(vec![record.clone()]),
                ChangeSource::Ids(vec![101]),
                ChangeSource::Ids(vec![101]),
            ],
            &["Active"],
        )
        .await;

        assert_eq!(outcome.aggregate.count("Active"), 1);
        assert_eq!(outcome.stats.duplicates, 2);
    }

    #[tokio::test]
    async fn same_state_at_different_times_counts_twice() {
        let feed = MemoryFeed::new()
            .with_record(transition(5, 2, Some("New"), "Active", "2024-01-03T10:00:00Z"))
            .with_record(transition(5, 4, Some("Resolved"), "Active", "2024-01-09T10:00:00Z"));
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![5])], &["Active"]).await;
        assert_eq!(outcome.aggregate.count("Active"), 2);
    }

    #[tokio::test]
    async fn unselected_states_never_appear() {
        let feed = MemoryFeed::new()
            .with_record(transition(202, 1, Some("Resolved"), "Closed", "2024-01-10T00:00:00Z"));
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![202])], &["Active", "Resolved"]).await;

        assert!(outcome.aggregate.is_empty());
        assert!(outcome.aggregate.get("Closed").is_none());
        assert_eq!(outcome.aggregate.states().collect::<Vec<_>>(), vec!["Active", "Resolved"]);
        assert_eq!(outcome.stats.not_selected, 1);
    }

    #[tokio::test]
    async fn unobserved_states_stay_zeroed_in_caller_order() {
        let feed = MemoryFeed::new();
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![])], &["Resolved", "Active", "Closed"]).await;

        let keys: Vec<&str> = outcome.aggregate.states().collect();
        assert_eq!(keys, vec!["Resolved", "Active", "Closed"]);
        for (_, summary) in outcome.aggregate.iter() {
            assert_eq!(summary.count, 0);
            assert!(summary.items.is_empty());
        }
    }

    #[tokio::test]
    async fn missing_and_malformed_timestamps_are_skipped() {
        let feed = MemoryFeed::new()
            .with_record(ChangeRecord::new(1, 1).with_change(fields::STATE, None, Some("Active")))
            .with_record(transition(2, 1, None, "Active", "not a date"))
            .with_record(transition(3, 1, None, "Active", "2024-01-20T08:00:00Z"))
            .with_record(ChangeRecord::new(4, 1).with_change(fields::TITLE, None, Some("renamed")));
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![1, 2, 3, 4])], &["Active"]).await;

        assert_eq!(outcome.aggregate.count("Active"), 1);
        assert_eq!(outcome.stats.missing_timestamp, 1);
        assert_eq!(outcome.stats.malformed, 1);
        assert_eq!(outcome.stats.records_seen, 4);
    }

    #[tokio::test]
    async fn failed_item_is_omitted_and_reported() {
        let feed = MemoryFeed::new()
            .with_record(transition(1, 1, None, "Active", "2024-01-05T00:00:00Z"))
            .with_record(transition(2, 1, None, "Active", "2024-01-06T00:00:00Z"))
            .with_record(transition(3, 1, None, "Active", "2024-01-07T00:00:00Z"))
            .failing(2);
        let outcome = run(&feed, vec![ChangeSource::Ids(vec![1, 2, 3])], &["Active"]).await;

        let ids: Vec<u32> = outcome.aggregate.get("Active").unwrap().items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].subject, "work item 2");
        assert!(!outcome.all_sources_failed());
    }

    #[tokio::test]
    async fn total_failure_is_distinguishable_from_zero_result() {
        let feed = MemoryFeed::new().failing(1).failing(2);
        let failed = run(&feed, vec![ChangeSource::Ids(vec![1, 2])], &["Active"]).await;
        assert!(failed.aggregate.is_empty());
        assert!(failed.all_sources_failed());

        let quiet = MemoryFeed::new();
        let empty = run(&quiet, vec![ChangeSource::Ids(vec![1, 2])], &["Active"]).await;
        assert!(empty.aggregate.is_empty());
        assert!(!empty.all_sources_failed());
    }

    #[tokio::test]
    async fn details_come_from_delta_then_item() {
        let record = transition(7, 2, Some("New"), "Active", "2024-01-10T00:00:00Z")
            .with_change(fields::TITLE, Some("Old title"), Some("New title"))
            .with_change(fields::TAGS, None, Some("DataOps"))
            .with_revised_by("Ana");
        let feed = MemoryFeed::new().with_record(record);
        let outcome = run(
            &feed,
            vec![ChangeSource::Items(vec![item(7, "Current title", "COE Operations")])],
            &["Active"],
        )
        .await;

        let entry = &outcome.aggregate.get("Active").unwrap().items[0];
        assert_eq!(entry.title.as_deref(), Some("New title"));
        assert_eq!(entry.project.as_deref(), Some("COE Operations"));
        assert_eq!(entry.tags, "DataOps");
        assert_eq!(entry.changed_by, "Ana");
    }

    #[tokio::test]
    async fn order_is_independent_of_concurrency() {
        let mut feed = MemoryFeed::new();
        for id in 1..=20 {
            feed = feed.with_record(transition(id, 1, None, "Active", "2024-01-10T00:00:00Z"));
        }
        let ids: Vec<u32> = (1..=20).rev().collect();

        let sequential = Reconciler::new(&feed)
            .concurrency(1)
            .reconcile(vec![ChangeSource::Ids(ids.clone())], &states(&["Active"]), &january())
            .await
            .unwrap();
        let parallel = Reconciler::new(&feed)
            .concurrency(8)
            .reconcile(vec![ChangeSource::Ids(ids)], &states(&["Active"]), &january())
            .await
            .unwrap();

        assert_eq!(sequential.aggregate, parallel.aggregate);
        let first = &parallel.aggregate.get("Active").unwrap().items[0];
        assert_eq!(first.id, 20);
    }

    #[tokio::test]
    async fn empty_state_selection_is_rejected() {
        let feed = MemoryFeed::new();
        let err = reconcile(&feed, vec![], &[], &january()).await.unwrap_err();
        assert_eq!(err, ReconcileError::NoStatesSelected);
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let feed = MemoryFeed::new();
        let inverted: AnalysisWindow = serde_json::from_value(serde_json::json!({
            "start_utc": "2024-02-01T00:00:00Z",
            "end_utc": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        let err = reconcile(&feed, vec![], &states(&["Active"]), &inverted)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvertedWindow { .. }));
    }

    #[tokio::test]
    async fn cancellation_discards_partial_results() {
        let mut feed = MemoryFeed::new();
        for id in 1..=10 {
            feed = feed.with_record(transition(id, 1, None, "Active", "2024-01-10T00:00:00Z"));
        }
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let result = Reconciler::new(&feed)
            .concurrency(1)
            .cancel_flag(cancel)
            .on_progress(Box::new(move |done, _| {
                if done == 3 {
                    trigger.cancel();
                }
            }))
            .reconcile(
                vec![ChangeSource::Ids((1..=10).collect())],
                &states(&["Active"]),
                &january(),
            )
            .await;

        assert_eq!(result.unwrap_err(), ReconcileError::Cancelled);
        assert!(feed.requests().len() < 10);
    }

    #[tokio::test]
    async fn progress_reports_every_item() {
        let feed = MemoryFeed::new().failing(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        Reconciler::new(&feed)
            .on_progress(Box::new(move |done, total| {
                assert_eq!(total, 3);
                assert!(done <= total);
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .reconcile(vec![ChangeSource::Ids(vec![1, 2, 3])], &states(&["Active"]), &january())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn identical_input_gives_identical_aggregate() {
        let feed = MemoryFeed::new()
            .with_record(transition(1, 1, None, "Active", "2024-01-05T00:00:00Z"))
            .with_record(transition(1, 2, Some("Active"), "Resolved", "2024-01-06T00:00:00Z"));
        let sources = || vec![ChangeSource::Items(vec![item(1, "A", "EDW")])];
        let first = run(&feed, sources(), &["Active", "Resolved"]).await;
        let second = run(&feed, sources(), &["Active", "Resolved"]).await;
        assert_eq!(
            serde_json::to_string(&first.aggregate).unwrap(),
            serde_json::to_string(&second.aggregate).unwrap()
        );
    }
}
