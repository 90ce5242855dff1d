/// Analyzer configuration.
///
/// Everything lives under the data root (`WITS_DATA_DIR`, default `.wits`):
/// `config.json` for the analyzer settings, `credentials.json` for the
/// connection written by `wits login`, and `global/preferences.json` for the
/// last interactive selections.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_DURATION};
use crate::error::ConfigError;
use crate::fetch::rate_limit::DEFAULT_SPACING;
use crate::fetch::transport::UreqTransport;
use crate::fetch::{AdoClient, ClientSettings};
use crate::reconcile::DEFAULT_CONCURRENCY;
use crate::secrets::CredentialsStore;
use crate::wiql::ProjectRule;

pub const DATA_DIR_ENV: &str = "WITS_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = ".wits";
pub const CONFIG_FILE: &str = "config.json";

/// Data root: `WITS_DATA_DIR` when set, `.wits` otherwise.
pub fn resolve_data_root() -> PathBuf {
    match env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_DATA_DIR),
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Settings read from `{data_dir}/config.json`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// States offered for selection
    pub states: Vec<String>,
    /// States used when nothing is selected and no prompt is possible
    pub default_states: Vec<String>,
    pub work_item_types: Vec<String>,
    pub default_work_item_types: Vec<String>,
    /// Extra WIQL conditions keyed by team project name
    pub project_rules: BTreeMap<String, ProjectRule>,
    pub request_timeout_secs: u64,
    pub rate_limit_millis: u64,
    pub cache_duration_secs: u64,
    pub cache_capacity: usize,
    /// Parallel history fetches during reconciliation
    pub concurrency: usize,
    pub max_revision_pages: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let client = ClientSettings::default();
        Self {
            states: strings(&[
                "New",
                "Active",
                "Resolved",
                "Closed",
                "3.1 - Ready for Test",
                "3.2 - In Progress",
                "3.3 - Failed Test",
                "3.4 - QA Approved",
            ]),
            default_states: strings(&["3.1 - Ready for Test", "3.4 - QA Approved"]),
            work_item_types: strings(&["Bug", "Product Backlog Item", "User Story"]),
            default_work_item_types: strings(&["Bug", "Product Backlog Item"]),
            project_rules: BTreeMap::new(),
            request_timeout_secs: client.request_timeout.as_secs(),
            rate_limit_millis: DEFAULT_SPACING.as_millis() as u64,
            cache_duration_secs: DEFAULT_CACHE_DURATION.as_secs(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            concurrency: DEFAULT_CONCURRENCY,
            max_revision_pages: client.max_revision_pages,
        }
    }
}

impl AnalyzerConfig {
    /// Load `{data_dir}/config.json`, or the defaults when the file is absent.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let unreadable = |message: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            message,
        };
        let contents = fs::read_to_string(&path).map_err(|e| unreadable(e.to_string()))?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| unreadable(e.to_string()))?;
        tracing::debug!("Loaded analyzer config from {}", path.display());
        Ok(config)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            rate_limit: Duration::from_millis(self.rate_limit_millis),
            cache_duration: Duration::from_secs(self.cache_duration_secs),
            cache_capacity: self.cache_capacity.max(1),
            max_revision_pages: self.max_revision_pages.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Where and how to reach the tracker.
#[derive(Debug, Clone)]
pub struct Connection {
    pub organization_url: Url,
    pub token: String,
}

impl Connection {
    /// REST client for this connection over the production transport.
    pub fn client(&self, settings: &ClientSettings) -> AdoClient {
        let transport = UreqTransport::new(&self.token, settings.request_timeout);
        AdoClient::new(self.organization_url.clone(), Arc::new(transport), settings)
    }
}

/// Parse an organization URL such as `https://dev.azure.com/contoso`.
pub fn parse_organization_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|source| ConfigError::InvalidOrganizationUrl {
        url: raw.to_string(),
        source,
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::InvalidOrganizationUrl {
            url: raw.to_string(),
            source: url::ParseError::RelativeUrlWithoutBase,
        });
    }
    Ok(url)
}

/// Resolve the connection: flags and environment first, then stored credentials.
pub fn resolve_connection(
    org_url: Option<String>,
    token: Option<String>,
    stored: &CredentialsStore,
) -> Result<Connection, ConfigError> {
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    let raw_url = non_empty(org_url)
        .or_else(|| non_empty(stored.organization_url()))
        .ok_or(ConfigError::MissingOrganizationUrl)?;
    let token = non_empty(token)
        .or_else(|| non_empty(stored.token()))
        .ok_or(ConfigError::MissingToken)?;

    Ok(Connection {
        organization_url: parse_organization_url(&raw_url)?,
        token: token.trim().to_string(),
    })
}
