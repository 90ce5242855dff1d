/// Conversion of reporting revision snapshots into delta change records.
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::model::{fields, value_text, ChangeRecord, FieldChange, WorkItem};
use crate::timefmt::parse_state_change_date;

/// One page of the reporting revisions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionBatch {
    #[serde(default)]
    pub values: Vec<WorkItem>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub is_last_batch: bool,
}

/// Presentation fields copied onto every derived record.
const CARRIED_FIELDS: &[&str] = &[
    fields::TITLE,
    fields::WORK_ITEM_TYPE,
    fields::TEAM_PROJECT,
    fields::AREA_PATH,
    fields::TAGS,
    fields::CHANGED_BY,
];

/// True when this snapshot was produced by the revision that changed the state.
///
/// Either the state differs from the previous snapshot, or (with no earlier
/// snapshot at hand) the state change date equals the revision's changed date.
fn is_state_change(previous: Option<&WorkItem>, current: &WorkItem) -> bool {
    let Some(state) = current.state() else {
        return false;
    };
    match previous {
        Some(prev) => prev.state().as_deref() != Some(state.as_str()),
        None => {
            let changed = current.field_text(fields::CHANGED_DATE);
            let state_changed = current.field_text(fields::STATE_CHANGE_DATE);
            match (changed, state_changed) {
                (Some(changed), Some(state_changed)) => {
                    match (
                        parse_state_change_date(&changed),
                        parse_state_change_date(&state_changed),
                    ) {
                        (Ok(a), Ok(b)) => a == b,
                        _ => changed == state_changed,
                    }
                }
                _ => false,
            }
        }
    }
}

fn change(previous: Option<&WorkItem>, current: &WorkItem, field: &str) -> Option<FieldChange> {
    let new_value = current.fields.get(field).filter(|v| !v.is_null()).cloned();
    let old_value = previous
        .and_then(|p| p.fields.get(field))
        .filter(|v| !v.is_null())
        .cloned();
    if new_value.is_none() && old_value.is_none() {
        None
    } else {
        Some(FieldChange::new(old_value, new_value))
    }
}

/// Turn full-field snapshots into delta records, one per state change.
///
/// Snapshots are grouped by item and ordered by revision number. Snapshots
/// that did not change the state produce nothing. Output is ordered by item id
/// then revision.
pub fn snapshots_to_records(snapshots: Vec<WorkItem>) -> Vec<ChangeRecord> {
    let mut by_item: BTreeMap<u32, Vec<WorkItem>> = BTreeMap::new();
    for snapshot in snapshots {
        by_item.entry(snapshot.id).or_default().push(snapshot);
    }

    let mut records = Vec::new();
    for (id, mut revisions) in by_item {
        revisions.sort_by_key(|r| r.rev.unwrap_or(0));
        revisions.dedup_by_key(|r| r.rev);

        let mut previous: Option<&WorkItem> = None;
        for current in &revisions {
            if is_state_change(previous, current) {
                let mut record = ChangeRecord::new(id, current.rev.unwrap_or(0));
                record.revised_by = current.fields.get(fields::CHANGED_BY).and_then(value_text);

                for field in [fields::STATE, fields::STATE_CHANGE_DATE] {
                    if let Some(c) = change(previous, current, field) {
                        record.fields.insert(field.to_string(), c);
                    }
                }
                for field in CARRIED_FIELDS {
                    if let Some(value) = current.fields.get(*field).filter(|v| !v.is_null()) {
                        record.fields.insert(
                            field.to_string(),
                            FieldChange::new(None, Some(value.clone())),
                        );
                    }
                }
                records.push(record);
            }
            previous = Some(current);
        }
    }

    records
}
