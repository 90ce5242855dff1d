use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::window::AnalysisWindow;

#[cfg(test)]
use anyhow::{anyhow, bail};
#[cfg(test)]
use jsonschema::{Draft, JSONSchema};

/// Current version of the exported report layout.
pub const REPORT_SCHEMA_VERSION: i32 = 1;

/// One counted state transition, as presented to users.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransitionRecord {
    pub id: u32,
    pub title: Option<String>,
    /// Raw `StateChangeDate` string of the transition
    pub date: String,
    pub project: Option<String>,
    pub work_item_type: Option<String>,
    pub area_path: Option<String>,
    #[serde(default)]
    pub tags: String,
    pub old_state: Option<String>,
    pub changed_by: String,
}

/// Count and itemized transitions into one state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StateSummary {
    pub count: usize,
    pub items: Vec<TransitionRecord>,
}

/// Per-state results of a reconciliation run.
///
/// Keys are exactly the requested states, in request order, present even
/// when no transition into them was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Aggregate(IndexMap<String, StateSummary>);

impl Aggregate {
    /// Zeroed aggregate for the given states. Repeated states keep their first position.
    pub fn for_states<S: AsRef<str>>(states: &[S]) -> Self {
        let mut map = IndexMap::new();
        for state in states {
            map.entry(state.as_ref().to_string())
                .or_insert_with(StateSummary::default);
        }
        Self(map)
    }

    /// Append a transition. Returns false if `state` is not one of the keys.
    pub(crate) fn record(&mut self, state: &str, item: TransitionRecord) -> bool {
        match self.0.get_mut(state) {
            Some(summary) => {
                summary.items.push(item);
                summary.count = summary.items.len();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, state: &str) -> Option<&StateSummary> {
        self.0.get(state)
    }

    /// Count for a state, zero when the state is not a key.
    pub fn count(&self, state: &str) -> usize {
        self.0.get(state).map_or(0, |s| s.count)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateSummary)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Total transitions across all states.
    pub fn total(&self) -> usize {
        self.0.values().map(|s| s.count).sum()
    }

    /// True when no transition was counted (keys may still be present).
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// A sub-fetch that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FetchFailure {
    /// What was being fetched, e.g. "work item 101" or "project EDW (2024-01-03)"
    pub subject: String,
    pub error: String,
}

impl FetchFailure {
    pub fn new(subject: impl Into<String>, error: impl ToString) -> Self {
        Self {
            subject: subject.into(),
            error: error.to_string(),
        }
    }
}

/// Calendar dates the user asked for, before UTC normalization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
    pub timezone: String,
}

/// Exported result of one analysis.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalysisReport {
    pub schema_version: i32,
    pub analysis_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_url: Option<String>,
    pub date_range: DateRange,
    pub window: AnalysisWindow,
    pub mode: String,
    pub selected_states: Vec<String>,
    pub selected_projects: Vec<String>,
    pub selected_work_item_types: Vec<String>,
    pub results: Aggregate,
    #[serde(default)]
    pub failures: Vec<FetchFailure>,
}

impl AnalysisReport {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report file: {}", path.display()))?;

        let report: AnalysisReport = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON from: {}", path.display()))?;

        Ok(report)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Base file name (without extension) derived from the date range.
    pub fn file_stem(&self) -> String {
        if self.date_range.start == self.date_range.end {
            format!("wits-{}", self.date_range.start)
        } else {
            format!("wits-{}_{}", self.date_range.start, self.date_range.end)
        }
    }

    #[cfg(test)]
    /// Validate report JSON against the JSON schema
    pub fn validate_with_schema(
        report_json: &serde_json::Value,
        schema: &JSONSchema,
    ) -> Result<()> {
        match schema.validate(report_json) {
            Ok(_) => Ok(()),
            Err(errors) => {
                let error_messages: Vec<String> = errors
                    .map(|e| format!("  - {}: {}", e.instance_path, e))
                    .collect();
                bail!("Report validation failed:\n{}", error_messages.join("\n"))
            }
        }
    }

    #[cfg(test)]
    /// Load and compile the JSON schema
    pub fn load_schema(schema_path: &Path) -> Result<JSONSchema> {
        let schema_content = std::fs::read_to_string(schema_path)
            .with_context(|| format!("Failed to read schema file: {}", schema_path.display()))?;

        let schema_json: serde_json::Value =
            serde_json::from_str(&schema_content).with_context(|| {
                format!(
                    "Failed to parse schema JSON from: {}",
                    schema_path.display()
                )
            })?;

        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_json)
            .map_err(|e| anyhow!("Failed to compile JSON schema: {}", e))
    }
}
