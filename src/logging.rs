/// File logging for analyzer sessions.
///
/// Logs go to `{data_dir}/logs/wits.log`. Each command invocation appends to
/// the same file, preceded by a separator naming the command.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name inside the log directory.
pub const LOG_FILE: &str = "wits.log";

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,wits=debug,ureq=warn";

/// Path of the log file under a data directory.
pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join(LOG_FILE)
}

/// Initializes session logging under `data_dir`.
///
/// Writes a session separator first, then installs a global subscriber. If a
/// subscriber is already installed (tests, repeated calls) the existing one is
/// kept.
pub fn init(data_dir: &Path, command: &str) -> Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    write_separator(&log_dir.join(LOG_FILE), command);

    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .ok();

    tracing::info!("Logging initialized for command: {}", command);

    Ok(())
}

fn write_separator(log_file: &Path, command: &str) {
    use std::io::Write;

    let separator = format!(
        "\n{sep}\n[{ts}] New session: wits {command}\n{sep}\n",
        sep = "=".repeat(80),
        ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        command = command
    );

    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
    {
        let _ = writeln!(file, "{}", separator);
    }
}
