use anyhow::Result;
use std::path::Path;

use crate::config::{resolve_connection, AnalyzerConfig};
use crate::error::FetchError;
use crate::fetch::AdoClient;
use crate::logging::log_path;
use crate::secrets::CredentialsStore;

/// Result of probing the projects endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// The API answered with at least one project
    Healthy { project_count: u64 },
    /// The API answered, but reported no projects
    Unexpected { project_count: u64 },
    /// The call itself failed
    Unreachable { error: String },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy { .. })
    }
}

/// Probe the API once.
pub async fn check_health(client: &AdoClient) -> Health {
    match client.health_check().await {
        Ok(count) if count > 0 => Health::Healthy {
            project_count: count,
        },
        Ok(count) => Health::Unexpected {
            project_count: count,
        },
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            Health::Unreachable {
                error: describe(&e),
            }
        }
    }
}

fn describe(error: &FetchError) -> String {
    match error {
        FetchError::Status { status, body, .. } => format!("API returned status {}: {}", status, body),
        other => format!("Connection error: {}", other),
    }
}

pub async fn run(data_dir: &Path, org_url: Option<String>, token: Option<String>) -> Result<()> {
    let store = CredentialsStore::new(data_dir)?;
    println!("Data directory: {}", data_dir.display());
    println!(
        "  credentials.json: {}",
        if store.has_credentials() { "OK" } else { "MISSING" }
    );
    println!("  Log file: {}", log_path(data_dir).display());

    let connection = resolve_connection(org_url, token, &store)?;
    println!("Organization: {}", connection.organization_url);

    let config = AnalyzerConfig::load(data_dir)?;
    let client = connection.client(&config.client_settings());

    match check_health(&client).await {
        Health::Healthy { project_count } => {
            println!("API: HEALTHY ({} team project(s))", project_count);
        }
        Health::Unexpected { project_count } => {
            println!("API: unexpected response (project count {})", project_count);
        }
        Health::Unreachable { error } => {
            println!("API: UNREACHABLE");
            println!("  {}", error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::transport::ScriptedTransport;
    use crate::fetch::ClientSettings;
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;

    fn client(transport: ScriptedTransport) -> AdoClient {
        AdoClient::new(
            Url::parse("https://dev.azure.com/contoso").unwrap(),
            Arc::new(transport),
            &ClientSettings {
                rate_limit: std::time::Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn positive_count_is_healthy() {
        let transport = ScriptedTransport::new().respond(
            "_apis/projects",
            json!({"count": 3, "value": [{"name": "A"}, {"name": "B"}, {"name": "C"}]}),
        );
        let health = check_health(&client(transport)).await;
        assert_eq!(health, Health::Healthy { project_count: 3 });
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn zero_projects_is_unexpected() {
        let transport =
            ScriptedTransport::new().respond("_apis/projects", json!({"count": 0, "value": []}));
        assert_eq!(
            check_health(&client(transport)).await,
            Health::Unexpected { project_count: 0 }
        );
    }

    #[tokio::test]
    async fn http_error_is_unreachable() {
        let transport = ScriptedTransport::new().fail("_apis/projects", 401);
        match check_health(&client(transport)).await {
            Health::Unreachable { error } => assert!(error.contains("status 401")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
