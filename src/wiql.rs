/// WIQL query construction.
///
/// Builds the per-project id discovery queries and rewrites local date-only
/// filters in hand-written queries to UTC instants.
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::fields;
use crate::timefmt::{format_wiql_instant, format_wiql_upper_bound};
use crate::window::{parse_date, AnalysisWindow, Zone};

/// Matches `>= 'YYYY-MM-DD'` and `<= 'YYYY-MM-DD'`.
const DATE_FILTER_PATTERN: &str = r"([<>]=)\s*'(\d{4}-\d{2}-\d{2})'";

/// Extra conditions applied to one team project's query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRule {
    /// Restrict to these area paths (any of)
    #[serde(default)]
    pub area_paths: Vec<String>,
    /// Require each of these tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Quote a WIQL string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote(v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Query selecting the ids of items in `project` whose state changed inside `window`.
pub fn build_project_query(
    project: &str,
    work_item_types: &[String],
    window: &AnalysisWindow,
    rule: Option<&ProjectRule>,
) -> String {
    let mut lines = vec![
        format!("SELECT [{}]", fields::ID),
        "FROM WorkItems".to_string(),
        format!("WHERE [{}] = {}", fields::TEAM_PROJECT, quote(project)),
    ];

    if let Some(rule) = rule {
        if !rule.area_paths.is_empty() {
            lines.push(format!(
                "AND [{}] IN ({})",
                fields::AREA_PATH,
                quoted_list(&rule.area_paths)
            ));
        }
        for tag in &rule.tags {
            lines.push(format!("AND [{}] CONTAINS {}", fields::TAGS, quote(tag)));
        }
    }

    if !work_item_types.is_empty() {
        lines.push(format!(
            "AND [{}] IN ({})",
            fields::WORK_ITEM_TYPE,
            quoted_list(work_item_types)
        ));
    }

    lines.push(format!(
        "AND [{}] >= '{}'",
        fields::STATE_CHANGE_DATE,
        format_wiql_instant(window.start())
    ));
    lines.push(format!(
        "AND [{}] <= '{}'",
        fields::STATE_CHANGE_DATE,
        format_wiql_upper_bound(window.end())
    ));
    lines.push(format!("ORDER BY [{}]", fields::ID));

    lines.join("\n")
}

/// Rewrite local date-only filters to UTC instants.
///
/// `>= 'YYYY-MM-DD'` becomes the UTC instant of local midnight of that day and
/// `<= 'YYYY-MM-DD'` the UTC instant of its last local second, both rendered
/// with a `.000Z` fraction.
pub fn localize_date_filters(query: &str, zone: Zone) -> Result<String, ConfigError> {
    let pattern =
        Regex::new(DATE_FILTER_PATTERN).map_err(|e| ConfigError::InvalidQuery(e.to_string()))?;

    let mut out = String::with_capacity(query.len());
    let mut last = 0;
    for caps in pattern.captures_iter(query) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&query[last..whole.start()]);
        out.push_str(&replace_filter(&caps, zone)?);
        last = whole.end();
    }
    out.push_str(&query[last..]);

    Ok(out)
}

fn replace_filter(caps: &Captures<'_>, zone: Zone) -> Result<String, ConfigError> {
    let operator = &caps[1];
    let date = parse_date(&caps[2])?;
    let instant = match operator {
        "<=" => zone.end_of_day(date)?,
        _ => zone.start_of_day(date)?,
    };
    Ok(format!("{} '{}'", operator, format_wiql_instant(instant)))
}
