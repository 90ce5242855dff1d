/// Error types shared across the library.
///
/// The command layer wraps these in `anyhow::Error`; inside the library each
/// failure class keeps its own enum so callers can tell a bad configuration
/// apart from a failed HTTP call or a malformed record.
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Invalid or missing configuration. Raised before any fetch starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown timezone: '{0}'")]
    UnknownTimezone(String),

    #[error("no organization URL configured (use --org-url, AZURE_DEVOPS_URL or 'wits login')")]
    MissingOrganizationUrl,

    #[error("invalid organization URL '{url}': {source}")]
    InvalidOrganizationUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no personal access token configured (use --token, AZURE_DEVOPS_PAT or 'wits login')")]
    MissingToken,

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("invalid window '{0}', expected YYYY, YYYY-MM, YYYY-Www or YYYY-MM-DD")]
    InvalidWindow(String),

    #[error("end date {end} is before start date {start}")]
    InvertedDates { start: String, end: String },

    #[error("local time {0} cannot be mapped to an instant in the selected timezone")]
    UnmappableLocalTime(String),

    #[error("invalid WIQL query: {0}")]
    InvalidQuery(String),

    #[error("failed to read config file {path}: {message}")]
    Unreadable { path: String, message: String },
}

/// A single upstream call failed. Recovered per item or per project.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("request worker for {url} stopped: {message}")]
    Worker { url: String, message: String },
}

/// A change record that cannot be interpreted. Recovered per record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("unparseable state change date '{raw}'")]
    BadTimestamp { raw: String },
}

/// Precondition violations and cancellation, the only ways reconciliation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("at least one state must be selected")]
    NoStatesSelected,

    #[error("window end {end} is before window start {start}")]
    InvertedWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("reconciliation cancelled")]
    Cancelled,
}
