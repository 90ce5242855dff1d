/// Project × state cross-tabulation of an aggregate.
use unicode_width::UnicodeWidthStr;

use crate::aggregate::Aggregate;

/// Row label for transitions whose project is unknown.
pub const NO_PROJECT: &str = "(no project)";

const TOTAL: &str = "Total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixRow {
    pub project: String,
    /// One count per column of [`ProjectMatrix::states`]
    pub counts: Vec<usize>,
    pub total: usize,
}

/// Counts per (project, state) with row and column totals.
///
/// Rows follow first-seen project order; columns are the states that had at
/// least one transition, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectMatrix {
    pub states: Vec<String>,
    pub rows: Vec<MatrixRow>,
    pub column_totals: Vec<usize>,
    pub grand_total: usize,
}

impl ProjectMatrix {
    pub fn from_aggregate(aggregate: &Aggregate) -> Self {
        let mut states: Vec<String> = aggregate
            .iter()
            .filter(|(_, summary)| summary.count > 0)
            .map(|(state, _)| state.to_string())
            .collect();
        states.sort();

        let mut rows: Vec<MatrixRow> = Vec::new();
        for (state, summary) in aggregate.iter() {
            let Some(column) = states.iter().position(|s| s == state) else {
                continue;
            };
            for item in &summary.items {
                let project = item.project.as_deref().unwrap_or(NO_PROJECT);
                let row = match rows.iter().position(|r| r.project == project) {
                    Some(index) => &mut rows[index],
                    None => {
                        rows.push(MatrixRow {
                            project: project.to_string(),
                            counts: vec![0; states.len()],
                            total: 0,
                        });
                        let last = rows.len() - 1;
                        &mut rows[last]
                    }
                };
                row.counts[column] += 1;
                row.total += 1;
            }
        }

        let column_totals: Vec<usize> = (0..states.len())
            .map(|column| rows.iter().map(|r| r.counts[column]).sum())
            .collect();
        let grand_total = rows.iter().map(|r| r.total).sum();

        Self {
            states,
            rows,
            column_totals,
            grand_total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn header(&self) -> Vec<String> {
        let mut header = vec!["Project".to_string()];
        header.extend(self.states.iter().cloned());
        header.push(TOTAL.to_string());
        header
    }

    /// Body rows followed by the totals row, as display cells.
    fn body(&self) -> Vec<Vec<String>> {
        let mut body: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                let mut cells = vec![row.project.clone()];
                cells.extend(row.counts.iter().map(usize::to_string));
                cells.push(row.total.to_string());
                cells
            })
            .collect();

        let mut totals = vec![TOTAL.to_string()];
        totals.extend(self.column_totals.iter().map(usize::to_string));
        totals.push(self.grand_total.to_string());
        body.push(totals);
        body
    }

    /// Aligned plain-text table for the terminal.
    pub fn render_text(&self) -> String {
        let header = self.header();
        let body = self.body();

        let mut widths: Vec<usize> = header.iter().map(|h| h.width()).collect();
        for row in &body {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.width());
            }
        }

        let line = |cells: &[String]| -> String {
            cells
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let pad = " ".repeat(widths[i] - cell.width());
                    if i == 0 {
                        format!("{}{}", cell, pad)
                    } else {
                        format!("{}{}", pad, cell)
                    }
                })
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };

        let rule: String = widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  ");

        let mut out = String::new();
        out.push_str(&line(&header));
        out.push('\n');
        out.push_str(&rule);
        out.push('\n');
        let last = body.len().saturating_sub(1);
        for (i, row) in body.iter().enumerate() {
            if i == last {
                out.push_str(&rule);
                out.push('\n');
            }
            out.push_str(&line(row));
            out.push('\n');
        }
        out
    }

    /// GitHub-flavored Markdown table.
    pub fn render_markdown(&self) -> String {
        let header = self.header();
        let mut out = format!("| {} |\n", header.join(" | "));
        let align: Vec<&str> = header
            .iter()
            .enumerate()
            .map(|(i, _)| if i == 0 { "---" } else { "---:" })
            .collect();
        out.push_str(&format!("| {} |\n", align.join(" | ")));

        let body = self.body();
        let last = body.len().saturating_sub(1);
        for (i, row) in body.iter().enumerate() {
            let cells: Vec<String> = if i == last {
                row.iter().map(|c| format!("**{}**", c)).collect()
            } else {
                row.iter().map(|c| c.replace('|', "\\|")).collect()
            };
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TransitionRecord;

    fn entry(id: u32, project: Option<&str>) -> TransitionRecord {
        TransitionRecord {
            id,
            title: None,
            date: "2024-01-10T00:00:00Z".to_string(),
            project: project.map(str::to_string),
            work_item_type: None,
            area_path: None,
            tags: String::new(),
            old_state: None,
            changed_by: "Unknown".to_string(),
        }
    }

    fn sample() -> Aggregate {
        let mut agg = Aggregate::for_states(&["Resolved", "Active", "Closed"]);
        agg.record("Resolved", entry(1, Some("EDW")));
        agg.record("Active", entry(2, Some("COE Operations")));
        agg.record("Active", entry(3, Some("EDW")));
        agg.record("Active", entry(4, Some("EDW")));
        agg.record("Resolved", entry(5, None));
        agg
    }

    #[test]
    fn counts_and_totals() {
        let matrix = ProjectMatrix::from_aggregate(&sample());

        assert_eq!(matrix.states, vec!["Active", "Resolved"]);
        let projects: Vec<&str> = matrix.rows.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(projects, vec!["EDW", NO_PROJECT, "COE Operations"]);

        assert_eq!(matrix.rows[0].counts, vec![2, 1]);
        assert_eq!(matrix.rows[0].total, 3);
        assert_eq!(matrix.rows[1].counts, vec![0, 1]);
        assert_eq!(matrix.rows[2].counts, vec![1, 0]);
        assert_eq!(matrix.column_totals, vec![3, 2]);
        assert_eq!(matrix.grand_total, 5);
    }

    #[test]
    fn empty_aggregate_gives_empty_matrix() {
        let matrix = ProjectMatrix::from_aggregate(&Aggregate::for_states(&["Active"]));
        assert!(matrix.is_empty());
        assert!(matrix.states.is_empty());
        assert_eq!(matrix.grand_total, 0);
    }

    #[test]
    fn text_table_is_aligned() {
        let text = ProjectMatrix::from_aggregate(&sample()).render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Project         Active  Resolved  Total");
        assert_eq!(lines[2], "EDW                  2         1      3");
        assert_eq!(lines.last().copied(), Some("Total                3         2      5"));
    }

    #[test]
    fn markdown_table_has_totals_row() {
        let md = ProjectMatrix::from_aggregate(&sample()).render_markdown();
        assert!(md.starts_with("| Project | Active | Resolved | Total |\n| --- | ---: | ---: | ---: |\n"));
        assert!(md.contains("| EDW | 2 | 1 | 3 |"));
        assert!(md.contains("| **Total** | **3** | **2** | **5** |"));
    }
}
