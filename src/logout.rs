use anyhow::Result;
use inquire::Confirm;
use std::io::IsTerminal;
use std::path::Path;

use crate::secrets::CredentialsStore;

/// Delete stored credentials, asking first when attached to a terminal.
pub fn run(data_dir: &Path, assume_yes: bool) -> Result<()> {
    let mut store = CredentialsStore::new(data_dir)?;

    let Some(org) = store.organization_url() else {
        if store.path().exists() {
            store.delete_all()?;
        }
        eprintln!("No stored credentials.");
        return Ok(());
    };

    if !assume_yes && std::io::stdin().is_terminal() {
        let confirmed = Confirm::new(&format!("Remove stored credentials for {}?", org))
            .with_default(true)
            .prompt()?;
        if !confirmed {
            eprintln!("Logout cancelled.");
            return Ok(());
        }
    }

    store.delete_all()?;
    tracing::info!("Removed credentials for {}", org);
    eprintln!("Removed stored credentials for {}", org);
    Ok(())
}
