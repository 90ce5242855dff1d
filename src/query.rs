/// Hand-written WIQL queries and project listing.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{resolve_connection, AnalyzerConfig};
use crate::fetch::AdoClient;
use crate::secrets::CredentialsStore;
use crate::window::Zone;
use crate::wiql::localize_date_filters;

/// Where the query text comes from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    Text(String),
    File(PathBuf),
}

impl QuerySource {
    pub fn read(&self) -> Result<String> {
        match self {
            QuerySource::Text(text) => Ok(text.clone()),
            QuerySource::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read query file: {}", path.display())),
        }
    }
}

/// Localize the query's date filters, run it, and return (converted query, ids).
pub async fn execute(client: &AdoClient, query: &str, zone: Zone) -> Result<(String, Vec<u32>)> {
    let converted = localize_date_filters(query, zone)?;
    tracing::debug!("Converted WIQL:\n{}", converted);
    let ids = client
        .run_raw_wiql(&converted)
        .await
        .context("WIQL query failed")?;
    Ok((converted, ids))
}

fn client_for(data_dir: &Path, org_url: Option<String>, token: Option<String>) -> Result<AdoClient> {
    let store = CredentialsStore::new(data_dir)?;
    let connection = resolve_connection(org_url, token, &store)?;
    let config = AnalyzerConfig::load(data_dir)?;
    Ok(connection.client(&config.client_settings()))
}

/// Entry point of `wits query`.
pub async fn run(
    data_dir: &Path,
    source: QuerySource,
    timezone: Option<String>,
    org_url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let zone = Zone::parse(timezone.as_deref())?;
    let query = source.read()?;
    if query.trim().is_empty() {
        anyhow::bail!("Query is empty");
    }
    let client = client_for(data_dir, org_url, token)?;

    let (converted, ids) = execute(&client, &query, zone).await?;
    eprintln!("Converted query ({}):", zone.name());
    eprintln!("{}", converted);
    eprintln!();
    eprintln!("{} work item(s)", ids.len());
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

/// Entry point of `wits projects`.
pub async fn list_projects(
    data_dir: &Path,
    org_url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let client = client_for(data_dir, org_url, token)?;
    let mut projects = client
        .team_projects()
        .await
        .context("Failed to list team projects")?;
    projects.sort();
    for project in &projects {
        println!("{}", project);
    }
    eprintln!("{} team project(s)", projects.len());
    Ok(())
}
