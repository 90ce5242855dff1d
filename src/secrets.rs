// src/secrets.rs
// Connection credentials for wits
// Stored in a local JSON file with owner-only permissions

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CREDENTIALS_FILE: &str = "credentials.json";

// ============================================
// Internal Types (Private)
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredCredentials {
    organization_url: Option<String>,
    personal_access_token: Option<String>,
}

// ============================================
// Public API
// ============================================

/// Storage for the organization URL and personal access token
///
/// Callers do not need to know how or where the values are kept.
pub struct CredentialsStore {
    path: PathBuf,
    credentials: StoredCredentials,
}

impl CredentialsStore {
    /// Open the store under `data_dir`
    ///
    /// Loads existing credentials if available, or starts empty. A file that
    /// cannot be parsed is treated as empty and logged.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CREDENTIALS_FILE);
        let credentials = if path.exists() {
            load_from_file(&path).unwrap_or_else(|e| {
                tracing::warn!("Ignoring stored credentials: {:#}", e);
                StoredCredentials::default()
            })
        } else {
            StoredCredentials::default()
        };
        Ok(Self { path, credentials })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn organization_url(&self) -> Option<String> {
        self.credentials.organization_url.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.personal_access_token.clone()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.organization_url.is_some()
            && self.credentials.personal_access_token.is_some()
    }

    /// Store both values and persist them immediately.
    pub fn store_credentials(&mut self, organization_url: &str, token: &str) -> Result<()> {
        self.credentials = StoredCredentials {
            organization_url: Some(organization_url.to_string()),
            personal_access_token: Some(token.to_string()),
        };
        save_to_file(&self.path, &self.credentials)
    }

    /// Remove stored credentials from disk and memory.
    pub fn delete_all(&mut self) -> Result<bool> {
        self.credentials = StoredCredentials::default();
        if self.path.exists() {
            fs::remove_file(&self.path).with_context(|| {
                format!("Failed to delete credentials file {}", self.path.display())
            })?;
            return Ok(true);
        }
        Ok(false)
    }
}

// ============================================
// Internal Implementation
// ============================================

fn load_from_file(path: &Path) -> Result<StoredCredentials> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials from {}", path.display()))?;
    let credentials: StoredCredentials = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse credentials from {}", path.display()))?;
    Ok(credentials)
}

fn save_to_file(path: &Path, credentials: &StoredCredentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let json =
        serde_json::to_string_pretty(credentials).context("Failed to serialize credentials")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write credentials to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    }

    Ok(())
}
