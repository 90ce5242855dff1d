/// The `analyze` command: discover, fetch, reconcile, present.
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::aggregate::{AnalysisReport, DateRange, FetchFailure, REPORT_SCHEMA_VERSION};
use crate::config::{resolve_connection, AnalyzerConfig};
use crate::crosstab::ProjectMatrix;
use crate::error::{ConfigError, ReconcileError};
use crate::fetch::AdoClient;
use crate::progress::{format_failure, AnalysisProgress};
use crate::reconcile::{CancelFlag, ChangeSource, ReconcileStats, Reconciler};
use crate::renderer;
use crate::secrets::CredentialsStore;
use crate::selector::Selector;
use crate::wiql::ProjectRule;
use crate::window::{parse_date, parse_window_key, AnalysisWindow, Zone};

pub const NO_CHANGES_MESSAGE: &str = "No state changes found for the selected criteria.";
pub const UNREACHABLE_MESSAGE: &str = "Could not reach the data source";

/// How candidate work items are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Mode {
    /// Bulk reporting revisions, one request chain per project and day
    #[default]
    Revisions,
    /// One WIQL query per project on the state change date
    Wiql,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Revisions => write!(f, "revisions"),
            Mode::Wiql => write!(f, "wiql"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Md,
    Json,
}

/// Command-line inputs of `wits analyze`.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeArgs {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Window key (`2025`, `2025-03`, `2025-W12`, `2025-03-15`); overrides start/end
    pub window: Option<String>,
    pub timezone: Option<String>,
    pub projects: Vec<String>,
    pub states: Vec<String>,
    pub work_item_types: Vec<String>,
    pub mode: Mode,
    pub concurrency: Option<usize>,
    pub output: Option<PathBuf>,
    pub formats: Vec<OutputFormat>,
    pub org_url: Option<String>,
    pub token: Option<String>,
}

/// Local calendar dates of the analysis.
pub fn resolve_dates(
    start: Option<&str>,
    end: Option<&str>,
    window: Option<&str>,
    zone: Zone,
) -> Result<(NaiveDate, NaiveDate), ConfigError> {
    if let Some(key) = window {
        return parse_window_key(key);
    }
    let today = zone.today();
    let start = start.map(parse_date).transpose()?.unwrap_or(today);
    let end = end.map(parse_date).transpose()?.unwrap_or(today);
    if end < start {
        return Err(ConfigError::InvertedDates {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok((start, end))
}

/// A fully resolved analysis; running it never prompts.
#[derive(Debug, Clone)]
pub struct AnalysisPlan {
    pub date_range: DateRange,
    pub window: AnalysisWindow,
    pub mode: Mode,
    pub projects: Vec<String>,
    pub states: Vec<String>,
    pub work_item_types: Vec<String>,
    pub rules: BTreeMap<String, ProjectRule>,
    pub concurrency: usize,
}

impl AnalysisPlan {
    pub fn new(start: NaiveDate, end: NaiveDate, zone: Zone) -> Result<Self, ConfigError> {
        let window = AnalysisWindow::from_local_dates(start, end, zone)?;
        Ok(Self {
            date_range: DateRange {
                start: start.to_string(),
                end: end.to_string(),
                timezone: zone.name(),
            },
            window,
            mode: Mode::default(),
            projects: Vec::new(),
            states: Vec::new(),
            work_item_types: Vec::new(),
            rules: BTreeMap::new(),
            concurrency: crate::reconcile::DEFAULT_CONCURRENCY,
        })
    }
}

/// What an analysis produced.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub report: AnalysisReport,
    pub stats: ReconcileStats,
    /// Nothing could be fetched at all
    pub unreachable: bool,
}

/// Run `plan` against `client`.
///
/// Discovery, detail and history failures are collected into the report.
/// Only configuration problems and cancellation fail the run.
pub async fn execute(
    client: &AdoClient,
    plan: &AnalysisPlan,
    cancel: CancelFlag,
    progress: Option<&AnalysisProgress>,
) -> Result<AnalysisRun> {
    if plan.states.is_empty() {
        return Err(ReconcileError::NoStatesSelected.into());
    }

    let mut failures: Vec<FetchFailure> = Vec::new();
    let say = |msg: &str| match progress {
        Some(p) => p.println(msg),
        None => tracing::info!("{}", msg),
    };

    // 1) Discovery
    let (ids, records, discovery_blind) = match plan.mode {
        Mode::Revisions => {
            say(&format!(
                "🔍 Scanning revisions for {} project(s) over {} day(s)...",
                plan.projects.len(),
                plan.window.day_count()
            ));
            let scan = client
                .scan_revisions(
                    &plan.projects,
                    &plan.work_item_types,
                    &plan.window,
                    &cancel,
                )
                .await;
            let attempts = plan.projects.len() * plan.window.daily_slices().len();
            let blind = scan.ids.is_empty() && attempts > 0 && scan.failures.len() == attempts;
            failures.extend(scan.failures);
            (scan.ids, scan.records, blind)
        }
        Mode::Wiql => {
            say(&format!(
                "🔍 Querying {} project(s) with WIQL...",
                plan.projects.len()
            ));
            let wiql = client
                .run_wiql(
                    &plan.projects,
                    &plan.work_item_types,
                    &plan.window,
                    &plan.rules,
                )
                .await;
            for query in &wiql.queries {
                tracing::debug!("WIQL:\n{}", query);
            }
            let blind = wiql.ids.is_empty()
                && !plan.projects.is_empty()
                && wiql.failures.len() == plan.projects.len();
            failures.extend(wiql.failures);
            (wiql.ids, Vec::new(), blind)
        }
    };
    if cancel.is_cancelled() {
        return Err(ReconcileError::Cancelled.into());
    }
    say(&format!("📚 Found {} candidate work item(s)", ids.len()));

    // 2) Current details, batched
    let details = client.work_items(&ids).await;
    let details_failed = !details.failures.is_empty() && details.items.is_empty();
    failures.extend(details.failures);

    // 3) Reconciliation
    // Update history precedes snapshot records: of two copies of one change,
    // the one carrying the old state and author is kept.
    let mut sources = vec![ChangeSource::Items(details.items)];
    if !records.is_empty() {
        sources.push(ChangeSource::Records(records));
    }

    let mut reconciler = Reconciler::new(client)
        .concurrency(plan.concurrency)
        .cancel_flag(cancel);
    let mut bar = None;
    if let Some(p) = progress {
        let (callback, pb) = p.reconcile_callback("Fetching history");
        reconciler = reconciler.on_progress(callback);
        bar = Some(pb);
    }
    let result = reconciler
        .reconcile(sources, &plan.states, &plan.window)
        .await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let outcome = result?;

    let (items_cache, updates_cache, revisions_cache) = client.cache_stats();
    tracing::debug!(
        "Cache hits/misses: items {}/{}, updates {}/{}, revisions {}/{}",
        items_cache.hits,
        items_cache.misses,
        updates_cache.hits,
        updates_cache.misses,
        revisions_cache.hits,
        revisions_cache.misses
    );

    let nothing_counted = outcome.aggregate.is_empty();
    let unreachable = nothing_counted
        && (discovery_blind || (!ids.is_empty() && details_failed) || outcome.all_sources_failed());
    failures.extend(outcome.failures);

    let report = AnalysisReport {
        schema_version: REPORT_SCHEMA_VERSION,
        analysis_date: chrono::Utc::now().to_rfc3339(),
        organization_url: Some(client.organization_url().to_string()),
        date_range: plan.date_range.clone(),
        window: plan.window,
        mode: plan.mode.to_string(),
        selected_states: plan.states.clone(),
        selected_projects: plan.projects.clone(),
        selected_work_item_types: plan.work_item_types.clone(),
        results: outcome.aggregate,
        failures,
    };

    Ok(AnalysisRun {
        report,
        stats: outcome.stats,
        unreachable,
    })
}

/// Terminal summary of a run: the matrix, or why there is none.
pub fn summary_text(run: &AnalysisRun) -> String {
    if run.unreachable {
        let mut text = format!("{}.\n", UNREACHABLE_MESSAGE);
        for failure in &run.report.failures {
            text.push_str(&format_failure(failure));
            text.push('\n');
        }
        return text;
    }
    let matrix = ProjectMatrix::from_aggregate(&run.report.results);
    if matrix.is_empty() {
        format!("{}\n", NO_CHANGES_MESSAGE)
    } else {
        matrix.render_text()
    }
}

/// Write the requested formats into `output_dir`; returns the written paths.
pub fn write_outputs(
    report: &AnalysisReport,
    output_dir: &Path,
    formats: &[OutputFormat],
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            output_dir.display()
        )
    })?;

    let stem = report.file_stem();
    let mut written = Vec::new();
    for format in formats {
        let path = match format {
            OutputFormat::Md => {
                let path = output_dir.join(format!("{}.md", stem));
                let markdown = renderer::md::render(report)?;
                std::fs::write(&path, markdown)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                path
            }
            OutputFormat::Json => {
                let path = output_dir.join(format!("{}.json", stem));
                report.save_to_file(&path)?;
                path
            }
        };
        written.push(path);
    }
    Ok(written)
}

/// Entry point of `wits analyze`.
pub async fn run(data_dir: &Path, args: AnalyzeArgs) -> Result<()> {
    let zone = Zone::parse(args.timezone.as_deref())?;
    let (start, end) = resolve_dates(
        args.start.as_deref(),
        args.end.as_deref(),
        args.window.as_deref(),
        zone,
    )?;

    let config = AnalyzerConfig::load(data_dir)?;
    let store = CredentialsStore::new(data_dir)?;
    let connection = resolve_connection(args.org_url, args.token, &store)?;
    let client = connection.client(&config.client_settings());

    let mut selector = Selector::new(data_dir)?;
    let projects = if args.projects.is_empty() {
        let available = client
            .team_projects()
            .await
            .context("Failed to list team projects")?;
        selector.select_projects(Vec::new(), &available)?
    } else {
        selector.select_projects(args.projects, &[])?
    };
    let states = selector.select_states(args.states, &config)?;
    let work_item_types = selector.select_work_item_types(args.work_item_types, &config)?;
    if let Err(e) = selector.save() {
        tracing::warn!("Failed to save preferences: {:#}", e);
    }

    if projects.is_empty() {
        anyhow::bail!("No projects selected");
    }

    let mut plan = AnalysisPlan::new(start, end, zone)?;
    plan.mode = args.mode;
    plan.projects = projects;
    plan.states = states;
    plan.work_item_types = work_item_types;
    plan.rules = config.project_rules.clone();
    plan.concurrency = args.concurrency.unwrap_or(config.concurrency()).max(1);

    eprintln!(
        "📥 Analyzing {} to {} ({}) via {}",
        plan.date_range.start, plan.date_range.end, plan.date_range.timezone, plan.mode
    );
    tracing::info!(
        "Analysis window {} .. {} (UTC), {} project(s), {} state(s)",
        plan.window.start(),
        plan.window.end(),
        plan.projects.len(),
        plan.states.len()
    );

    let cancel = CancelFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⏹️  Cancelling...");
                cancel.cancel();
            }
        })
    };

    let progress = AnalysisProgress::new();
    let result = execute(&client, &plan, cancel, Some(&progress)).await;
    watcher.abort();
    let run = result?;

    print!("{}", summary_text(&run));
    if !run.unreachable && !run.report.failures.is_empty() {
        eprintln!(
            "⚠️  {} fetch(es) failed and were skipped:",
            run.report.failures.len()
        );
        for failure in &run.report.failures {
            eprintln!("{}", format_failure(failure));
        }
    }
    tracing::info!("Reconcile stats: {:?}", run.stats);

    let formats = if args.formats.is_empty() {
        vec![OutputFormat::Md, OutputFormat::Json]
    } else {
        args.formats
    };
    if let Some(output_dir) = args.output {
        for path in write_outputs(&run.report, &output_dir, &formats)? {
            eprintln!("Report written to: {}", path.display());
        }
    }

    Ok(())
}
