use anyhow::{Context, Result};
use rpassword::prompt_password;
use std::io::{self, Write};
use std::path::Path;

use crate::config::{parse_organization_url, AnalyzerConfig, Connection};
use crate::secrets::CredentialsStore;

/// Prompt for the organization URL and PAT, verify them, and store them.
///
/// Verification failures are reported but do not prevent storing, so a login
/// can be prepared while the service is unreachable.
pub async fn run(data_dir: &Path, org_url_flag: Option<String>) -> Result<()> {
    let mut store = CredentialsStore::new(data_dir)?;

    if let Some(existing) = store.organization_url() {
        eprintln!("Currently logged in to {}", existing);
        eprintln!();
    }

    let raw_url = match org_url_flag {
        Some(url) => url,
        None => {
            let default = store.organization_url().unwrap_or_default();
            let label = if default.is_empty() {
                "Organization URL (e.g., https://dev.azure.com/your-org): ".to_string()
            } else {
                format!("Organization URL [{}]: ", default)
            };
            let entered = prompt(&label)?;
            if entered.trim().is_empty() {
                default
            } else {
                entered
            }
        }
    };
    let organization_url = parse_organization_url(&raw_url)?;

    let token = prompt_password("Personal access token: ").context("Failed to read token")?;
    let token = token.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("Personal access token cannot be empty");
    }

    let connection = Connection {
        organization_url,
        token,
    };

    let config = AnalyzerConfig::load(data_dir)?;
    let client = connection.client(&config.client_settings());
    match client.health_check().await {
        Ok(count) => eprintln!("✅ Connected: {} team project(s) visible", count),
        Err(e) => {
            tracing::warn!("Login health check failed: {}", e);
            eprintln!("⚠️  Could not verify the credentials: {}", e);
        }
    }

    store.store_credentials(connection.organization_url.as_str(), &connection.token)?;
    tracing::info!("Stored credentials for {}", connection.organization_url);
    eprintln!(
        "Stored credentials for {} in {}",
        connection.organization_url,
        store.path().display()
    );
    Ok(())
}

pub fn prompt(msg: &str) -> Result<String> {
    print!("{}", msg);
    io::stdout().flush().ok();
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
