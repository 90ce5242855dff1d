use anyhow::{Context, Result};
use inquire::MultiSelect;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::config::AnalyzerConfig;

/// Last selections, stored globally.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Preferences {
    #[serde(default)]
    pub last_projects: Vec<String>,

    #[serde(default)]
    pub last_states: Vec<String>,

    #[serde(default)]
    pub last_work_item_types: Vec<String>,
}

impl Preferences {
    fn file(data_dir: &Path) -> PathBuf {
        data_dir.join("global").join("preferences.json")
    }

    /// Load preferences from the global preferences file
    pub fn load(data_dir: &Path) -> Result<Self> {
        let prefs_file = Self::file(data_dir);
        if !prefs_file.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&prefs_file).context("Failed to read preferences file")?;
        let prefs: Self =
            serde_json::from_str(&contents).context("Failed to parse preferences file")?;
        Ok(prefs)
    }

    /// Save preferences to the global preferences file
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let prefs_file = Self::file(data_dir);
        if let Some(global_dir) = prefs_file.parent() {
            fs::create_dir_all(global_dir).context("Failed to create global directory")?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize preferences")?;
        fs::write(&prefs_file, contents).context("Failed to write preferences file")?;
        Ok(())
    }
}

/// Pre-selection for a prompt: remembered values still on offer, else the
/// fallback values still on offer.
pub fn preselect(options: &[String], remembered: &[String], fallback: &[String]) -> Vec<String> {
    let keep = |values: &[String]| -> Vec<String> {
        options
            .iter()
            .filter(|option| values.contains(option))
            .cloned()
            .collect()
    };
    let remembered = keep(remembered);
    if remembered.is_empty() {
        keep(fallback)
    } else {
        remembered
    }
}

/// Chooses projects, states and work item types for an analysis.
///
/// Values given on the command line win. Otherwise a multi-select prompt is
/// shown, pre-selected from the last run. Without a terminal the pre-selection
/// is used as-is.
pub struct Selector {
    data_dir: PathBuf,
    preferences: Preferences,
    interactive: bool,
}

impl Selector {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let preferences = Preferences::load(data_dir).unwrap_or_else(|e| {
            tracing::warn!("Ignoring preferences: {:#}", e);
            Preferences::default()
        });
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            preferences,
            interactive: std::io::stdin().is_terminal() && std::io::stderr().is_terminal(),
        })
    }

    /// Never prompt.
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    /// Projects to analyze. With nothing remembered, every project is pre-selected.
    pub fn select_projects(&mut self, given: Vec<String>, available: &[String]) -> Result<Vec<String>> {
        let defaults = preselect(available, &self.preferences.last_projects, available);
        let selected = self.choose("Select projects", given, available, defaults)?;
        self.preferences.last_projects = selected.clone();
        Ok(selected)
    }

    pub fn select_states(&mut self, given: Vec<String>, config: &AnalyzerConfig) -> Result<Vec<String>> {
        let defaults = preselect(
            &config.states,
            &self.preferences.last_states,
            &config.default_states,
        );
        let selected = self.choose("Select states", given, &config.states, defaults)?;
        self.preferences.last_states = selected.clone();
        Ok(selected)
    }

    pub fn select_work_item_types(
        &mut self,
        given: Vec<String>,
        config: &AnalyzerConfig,
    ) -> Result<Vec<String>> {
        let defaults = preselect(
            &config.work_item_types,
            &self.preferences.last_work_item_types,
            &config.default_work_item_types,
        );
        let selected = self.choose(
            "Select work item types",
            given,
            &config.work_item_types,
            defaults,
        )?;
        self.preferences.last_work_item_types = selected.clone();
        Ok(selected)
    }

    /// Persist the selections made so far.
    pub fn save(&self) -> Result<()> {
        self.preferences.save(&self.data_dir)
    }

    fn choose(
        &self,
        message: &str,
        given: Vec<String>,
        options: &[String],
        defaults: Vec<String>,
    ) -> Result<Vec<String>> {
        if !given.is_empty() {
            return Ok(given);
        }
        if !self.interactive || options.is_empty() {
            return Ok(defaults);
        }

        let default_indices: Vec<usize> = defaults
            .iter()
            .filter_map(|value| options.iter().position(|option| option == value))
            .collect();

        let selected = MultiSelect::new(
            &format!("{} (Space to toggle, Enter to confirm):", message),
            options.to_vec(),
        )
        .with_default(&default_indices)
        .prompt()?;

        if selected.is_empty() {
            anyhow::bail!("Nothing selected");
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn preselect_prefers_remembered_values_in_option_order() {
        let options = s(&["A", "B", "C"]);
        assert_eq!(preselect(&options, &s(&["C", "A"]), &s(&["B"])), s(&["A", "C"]));
        assert_eq!(preselect(&options, &s(&["gone"]), &s(&["B"])), s(&["B"]));
        assert!(preselect(&options, &[], &[]).is_empty());
    }

    #[test]
    fn preferences_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Preferences::load(dir.path()).unwrap(), Preferences::default());

        let prefs = Preferences {
            last_projects: s(&["EDW"]),
            last_states: s(&["Active"]),
            last_work_item_types: s(&["Bug"]),
        };
        prefs.save(dir.path()).unwrap();
        assert_eq!(Preferences::load(dir.path()).unwrap(), prefs);
    }

    #[test]
    fn non_interactive_uses_flags_then_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalyzerConfig::default();
        let mut selector = Selector::new(dir.path()).unwrap().non_interactive();

        let states = selector.select_states(Vec::new(), &config).unwrap();
        assert_eq!(states, config.default_states);

        let types = selector
            .select_work_item_types(s(&["User Story"]), &config)
            .unwrap();
        assert_eq!(types, s(&["User Story"]));

        let projects = selector
            .select_projects(Vec::new(), &s(&["EDW", "COE Operations"]))
            .unwrap();
        assert_eq!(projects, s(&["EDW", "COE Operations"]));

        selector.save().unwrap();
        let mut next = Selector::new(dir.path()).unwrap().non_interactive();
        assert_eq!(next.preferences().last_work_item_types, s(&["User Story"]));
        assert_eq!(
            next.select_work_item_types(Vec::new(), &config).unwrap(),
            s(&["User Story"])
        );
    }
}
