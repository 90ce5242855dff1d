use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wits::analyze::{self, AnalyzeArgs, Mode, OutputFormat};
use wits::aggregate::AnalysisReport;
use wits::config::resolve_data_root;
use wits::query::{self, QuerySource};
use wits::{logging, login, logout, renderer, status};

// Help text constants
const HELP_MAIN: &str = "\
wits — work item state transitions for Azure DevOps

Commands:
    analyze     Count state changes per project over a date range.
    projects    List team projects.
    query       Run a WIQL query with local date filters.
    status      Check stored credentials and API health.
    login       Store organization URL and personal access token.
    logout      Remove stored credentials.
    render      Re-render a saved JSON report as Markdown.

Usage:
    wits analyze [--start YYYY-MM-DD] [--end YYYY-MM-DD] [--tz NAME] [--output <dir>]

More help:
    wits --help analyze
    wits --help query
    wits --help render
    wits --help config";

const HELP_ANALYZE: &str = "\
Count state changes per project over a date range

Usage:
    wits analyze [options]

Options:
    --start YYYY-MM-DD     First local day (default: today)
    --end YYYY-MM-DD       Last local day, inclusive (default: today)
    --window KEY           2025, 2025-03, 2025-W12 or 2025-03-15; overrides --start/--end
    --tz NAME              IANA timezone for the dates (default: local)
    --project P            Team project (repeatable; prompts when omitted)
    --state S              Target state (repeatable; prompts when omitted)
    --type T               Work item type (repeatable; prompts when omitted)
    --mode revisions|wiql  Discovery strategy (default: revisions)
    --concurrency N        Parallel history fetches (default: 4)
    --output <dir>         Write reports into <dir>
    --format md,json       Report formats (default: both)

Examples:
  wits analyze --start 2024-01-01 --end 2024-01-31 --tz America/Bogota --output reports
  wits analyze --window 2024-W03 --project EDW --state \"3.4 - QA Approved\" --mode wiql";

const HELP_QUERY: &str = "\
Run a WIQL query with local date filters

Date-only filters such as >= '2024-01-01' and <= '2024-01-31' are rewritten to
the UTC start and end of those local days before the query runs.

Usage:
    wits query --wiql \"<query>\" [--tz NAME]
    wits query --file <path> [--tz NAME]";

const HELP_RENDER: &str = "\
Re-render a saved JSON report as Markdown

Usage:
    wits render --report <file.json> [--output <dir>]

Options:
    --report <file>   Report written by 'wits analyze --format json'
    --output <dir>    Output directory (default: current dir). The filename follows the report's date range.";

const HELP_CONFIG: &str = "\
Configuration

Data directory: $WITS_DATA_DIR (default: .wits)
    credentials.json           written by 'wits login'
    config.json                analyzer settings (all fields optional)
    global/preferences.json    last selections
    logs/wits.log              session log (RUST_LOG overrides the filter)

Connection: --org-url / AZURE_DEVOPS_URL and --token / AZURE_DEVOPS_PAT
take precedence over the stored credentials.

config.json fields:
    states, default_states, work_item_types, default_work_item_types,
    project_rules {\"<project>\": {\"area_paths\": [...], \"tags\": [...]}},
    request_timeout_secs, rate_limit_millis, cache_duration_secs,
    cache_capacity, concurrency, max_revision_pages";

#[derive(Parser)]
#[command(name = "wits", disable_help_flag = true)]
#[command(about = "Work item state transition analyzer", long_about = None)]
struct Cli {
    /// Show help (global or per topic). Example: wits --help analyze
    #[arg(long, value_name = "TOPIC", num_args = 0..=1, default_missing_value = "")]
    help: Option<String>,

    /// Organization URL (e.g. https://dev.azure.com/contoso)
    #[arg(long, global = true, env = "AZURE_DEVOPS_URL")]
    org_url: Option<String>,

    /// Personal access token
    #[arg(long, global = true, env = "AZURE_DEVOPS_PAT", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Count state changes per project over a date range
    Analyze {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Window key: 2025, 2025-03, 2025-W12 or 2025-03-15
        #[arg(long, conflicts_with_all = ["start", "end"])]
        window: Option<String>,
        /// IANA timezone name (default: local)
        #[arg(long = "tz")]
        timezone: Option<String>,
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long = "state")]
        states: Vec<String>,
        #[arg(long = "type")]
        work_item_types: Vec<String>,
        #[arg(long, value_enum, default_value_t = Mode::Revisions)]
        mode: Mode,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, value_delimiter = ',')]
        format: Vec<OutputFormat>,
    },
    /// List team projects
    Projects,
    /// Run a WIQL query with local date filters
    Query {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        wiql: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long = "tz")]
        timezone: Option<String>,
    },
    /// Check stored credentials and API health
    Status,
    /// Store organization URL and personal access token
    Login,
    /// Remove stored credentials
    Logout {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Re-render a saved JSON report as Markdown
    Render {
        #[arg(long)]
        report: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Analyze { .. } => "analyze",
            Commands::Projects => "projects",
            Commands::Query { .. } => "query",
            Commands::Status => "status",
            Commands::Login => "login",
            Commands::Logout { .. } => "logout",
            Commands::Render { .. } => "render",
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(help_topic) = cli.help {
        let topic = help_topic.trim();
        if topic.is_empty() {
            println!("{}", HELP_MAIN);
        } else if topic.eq_ignore_ascii_case("analyze") {
            println!("{}", HELP_ANALYZE);
        } else if topic.eq_ignore_ascii_case("query") {
            println!("{}", HELP_QUERY);
        } else if topic.eq_ignore_ascii_case("render") {
            println!("{}", HELP_RENDER);
        } else if topic.eq_ignore_ascii_case("config") {
            println!("{}", HELP_CONFIG);
        } else {
            println!("Unknown help topic: {}", topic);
        }
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        eprintln!("No command specified.");
        eprintln!("Example: wits analyze --start 2024-01-01 --end 2024-01-31");
        eprintln!("Run 'wits --help' for the list of commands.");
        return Ok(());
    };

    let data_dir = resolve_data_root();
    if let Err(e) = logging::init(&data_dir, cmd.name()) {
        eprintln!("Warning: file logging disabled: {:#}", e);
    }

    match cmd {
        Commands::Analyze {
            start,
            end,
            window,
            timezone,
            projects,
            states,
            work_item_types,
            mode,
            concurrency,
            output,
            format,
        } => {
            let args = AnalyzeArgs {
                start,
                end,
                window,
                timezone,
                projects,
                states,
                work_item_types,
                mode,
                concurrency,
                output,
                formats: format,
                org_url: cli.org_url,
                token: cli.token,
            };
            runtime()?.block_on(analyze::run(&data_dir, args))?;
        }
        Commands::Projects => {
            runtime()?.block_on(query::list_projects(&data_dir, cli.org_url, cli.token))?;
        }
        Commands::Query {
            wiql,
            file,
            timezone,
        } => {
            let source = match (wiql, file) {
                (Some(text), _) => QuerySource::Text(text),
                (None, Some(path)) => QuerySource::File(path),
                (None, None) => anyhow::bail!("Either --wiql or --file is required"),
            };
            runtime()?.block_on(query::run(
                &data_dir,
                source,
                timezone,
                cli.org_url,
                cli.token,
            ))?;
        }
        Commands::Status => {
            runtime()?.block_on(status::run(&data_dir, cli.org_url, cli.token))?;
        }
        Commands::Login => {
            runtime()?.block_on(login::run(&data_dir, cli.org_url))?;
        }
        Commands::Logout { yes } => {
            logout::run(&data_dir, yes)?;
        }
        Commands::Render { report, output } => {
            let report = AnalysisReport::load_from_file(&report)?;

            // Determine output directory
            let output_dir = output.unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&output_dir).with_context(|| {
                format!(
                    "Failed to create output directory: {}",
                    output_dir.display()
                )
            })?;

            let markdown = renderer::md::render(&report)?;
            let output_path = output_dir.join(format!("{}.md", report.file_stem()));
            std::fs::write(&output_path, markdown)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            eprintln!("Markdown report written to: {}", output_path.display());
        }
    }

    Ok(())
}
