use crate::aggregate::*;
use crate::crosstab::ProjectMatrix;
use crate::timefmt::format_display;
use anyhow::Result;
use url::Url;

/// Render an analysis report to Markdown
pub fn render(report: &AnalysisReport) -> Result<String> {
    let mut output = String::new();

    // 1. Title and selection
    render_header(&mut output, report);

    // 2. Project × state counts
    let matrix = ProjectMatrix::from_aggregate(&report.results);
    render_counts(&mut output, &matrix, report);

    // 3. One detail table per state with transitions
    if !matrix.is_empty() {
        render_details(&mut output, report);
    }

    // 4. Skipped fetches
    if !report.failures.is_empty() {
        render_failures(&mut output, &report.failures);
    }

    Ok(output)
}

fn render_header(output: &mut String, report: &AnalysisReport) {
    let range = &report.date_range;
    if range.start == range.end {
        output.push_str(&format!("# Work item state changes — {}\n", range.start));
    } else {
        output.push_str(&format!(
            "# Work item state changes — {} to {}\n",
            range.start, range.end
        ));
    }

    output.push_str("### Selection\n");
    if let Some(ref org) = report.organization_url {
        output.push_str(&format!("- **Organization:** {}\n", org));
    }
    output.push_str(&format!(
        "- **Dates:** {} to {} ({})\n",
        range.start, range.end, range.timezone
    ));
    output.push_str(&format!(
        "- **UTC window:** {} to {}\n",
        report.window.start().format("%Y-%m-%d %H:%M:%S"),
        report.window.end().format("%Y-%m-%d %H:%M:%S")
    ));
    output.push_str(&format!("- **Projects:** {}\n", join_or_all(&report.selected_projects)));
    output.push_str(&format!(
        "- **Work item types:** {}\n",
        join_or_all(&report.selected_work_item_types)
    ));
    output.push_str(&format!("- **States:** {}\n", report.selected_states.join(", ")));
    output.push_str(&format!("- **Mode:** {}\n", report.mode));
    output.push_str(&format!("- **Generated:** {}\n", report.analysis_date));
    output.push('\n');
}

fn render_counts(output: &mut String, matrix: &ProjectMatrix, report: &AnalysisReport) {
    output.push_str("## State count by project\n");
    if matrix.is_empty() {
        output.push_str("No state changes found for the selected criteria.\n\n");
        return;
    }
    output.push_str(&matrix.render_markdown());
    output.push('\n');

    // States with zero transitions do not get a matrix column; list them.
    let quiet: Vec<&str> = report
        .results
        .iter()
        .filter(|(_, summary)| summary.count == 0)
        .map(|(state, _)| state)
        .collect();
    if !quiet.is_empty() {
        output.push_str(&format!("_No transitions into: {}_\n\n", quiet.join(", ")));
    }
}

fn render_details(output: &mut String, report: &AnalysisReport) {
    output.push_str("## Details\n");
    for (state, summary) in report.results.iter() {
        if summary.items.is_empty() {
            continue;
        }
        output.push_str(&format!("### {} ({})\n", state, summary.count));
        output.push_str(
            "| ID | Title | Type | Old State | Area Path | Tags | Changed By | State Change Date (UTC) |\n",
        );
        output.push_str("| ---: | --- | --- | --- | --- | --- | --- | --- |\n");
        for item in &summary.items {
            let id = match work_item_link(report.organization_url.as_deref(), item) {
                Some(link) => format!("[{}]({})", item.id, link),
                None => item.id.to_string(),
            };
            output.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
                id,
                cell(item.title.as_deref()),
                cell(item.work_item_type.as_deref()),
                item.old_state.as_deref().map_or("N/A".to_string(), escape),
                cell(item.area_path.as_deref()),
                cell(Some(item.tags.as_str())),
                escape(&item.changed_by),
                format_display(&item.date),
            ));
        }
        output.push('\n');
    }
}

fn render_failures(output: &mut String, failures: &[FetchFailure]) {
    output.push_str("## Skipped fetches\n");
    output.push_str(&format!(
        "{} request(s) failed; the counts above leave them out.\n\n",
        failures.len()
    ));
    for failure in failures {
        output.push_str(&format!("- **{}:** {}\n", failure.subject, failure.error));
    }
    output.push('\n');
}

/// Web link to a work item, when organization and project are known.
pub fn work_item_link(organization_url: Option<&str>, item: &TransitionRecord) -> Option<String> {
    let project = item.project.as_deref()?;
    let mut url = Url::parse(organization_url?).ok()?;
    let id = item.id.to_string();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .push(project)
        .extend(["_workitems", "edit", id.as_str()]);
    Some(url.to_string())
}

fn join_or_all(values: &[String]) -> String {
    if values.is_empty() {
        "(all)".to_string()
    } else {
        values.join(", ")
    }
}

fn cell(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => escape(v),
        _ => String::new(),
    }
}

/// Escape table-breaking characters in a cell
fn escape(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
