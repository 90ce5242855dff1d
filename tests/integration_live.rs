use anyhow::{Context, Result};
use std::env;

use wits::config::{parse_organization_url, AnalyzerConfig, Connection};
use wits::status::{check_health, Health};

/// Live check against a real organization
///
/// Required environment variables:
/// - WITS_TEST_ORG_URL: organization URL (e.g., https://dev.azure.com/contoso)
/// - WITS_TEST_PAT: personal access token with Work Items (read) scope
///
/// Run: (set -a && source .env && set +a && cargo test --test integration_live -- --ignored --nocapture)
#[tokio::test]
#[ignore]
async fn test_health_and_projects() -> Result<()> {
    let org_url =
        env::var("WITS_TEST_ORG_URL").context("WITS_TEST_ORG_URL environment variable not set")?;
    let token = env::var("WITS_TEST_PAT").context("WITS_TEST_PAT environment variable not set")?;

    let connection = Connection {
        organization_url: parse_organization_url(&org_url)?,
        token,
    };
    let client = connection.client(&AnalyzerConfig::default().client_settings());

    let health = check_health(&client).await;
    println!("Health: {:?}", health);
    assert!(matches!(health, Health::Healthy { .. }));

    let projects = client.team_projects().await?;
    println!("✅ {} team project(s)", projects.len());
    assert!(!projects.is_empty());

    Ok(())
}
