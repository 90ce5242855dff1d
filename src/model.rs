/// Work items and change records as returned by the tracker's REST API.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field reference names used by the analyzer.
pub mod fields {
    pub const ID: &str = "System.Id";
    pub const TITLE: &str = "System.Title";
    pub const STATE: &str = "System.State";
    pub const WORK_ITEM_TYPE: &str = "System.WorkItemType";
    pub const TEAM_PROJECT: &str = "System.TeamProject";
    pub const AREA_PATH: &str = "System.AreaPath";
    pub const TAGS: &str = "System.Tags";
    pub const CHANGED_BY: &str = "System.ChangedBy";
    pub const CHANGED_DATE: &str = "System.ChangedDate";
    pub const STATE_CHANGE_DATE: &str = "Microsoft.VSTS.Common.StateChangeDate";

    /// Fields requested from the reporting revisions endpoint.
    pub const REVISION_FIELDS: &[&str] = &[
        ID,
        TITLE,
        WORK_ITEM_TYPE,
        STATE,
        AREA_PATH,
        TAGS,
        TEAM_PROJECT,
        CHANGED_BY,
        CHANGED_DATE,
        STATE_CHANGE_DATE,
    ];
}

/// Render a field value as text.
///
/// Identity fields come back either as a `"Name <mail>"` string or as an
/// object with a `displayName`; both render as the display name.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map
            .get("displayName")
            .or_else(|| map.get("uniqueName"))
            .and_then(value_text),
        Value::Array(_) => Some(value.to_string()),
    }
}

/// Snapshot of a work item (or of one of its revisions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<u32>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl WorkItem {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            rev: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter, mostly for fixtures.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field_text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(value_text)
    }

    pub fn title(&self) -> Option<String> {
        self.field_text(fields::TITLE)
    }

    pub fn state(&self) -> Option<String> {
        self.field_text(fields::STATE)
    }

    pub fn project(&self) -> Option<String> {
        self.field_text(fields::TEAM_PROJECT)
    }

    pub fn details(&self) -> ItemDetails {
        ItemDetails {
            title: self.field_text(fields::TITLE),
            work_item_type: self.field_text(fields::WORK_ITEM_TYPE),
            project: self.field_text(fields::TEAM_PROJECT),
            area_path: self.field_text(fields::AREA_PATH),
            tags: self.field_text(fields::TAGS),
        }
    }
}

/// Presentation fields of a work item, attached to change records as a fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub title: Option<String>,
    pub work_item_type: Option<String>,
    pub project: Option<String>,
    pub area_path: Option<String>,
    pub tags: Option<String>,
}

impl ItemDetails {
    fn get(&self, field: &str) -> Option<&String> {
        match field {
            fields::TITLE => self.title.as_ref(),
            fields::WORK_ITEM_TYPE => self.work_item_type.as_ref(),
            fields::TEAM_PROJECT => self.project.as_ref(),
            fields::AREA_PATH => self.area_path.as_ref(),
            fields::TAGS => self.tags.as_ref(),
            _ => None,
        }
    }
}

/// Old and new value of one field within one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(rename = "oldValue", default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(rename = "newValue", default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl FieldChange {
    pub fn new(old_value: Option<Value>, new_value: Option<Value>) -> Self {
        Self {
            old_value,
            new_value,
        }
    }
}

/// One revision of one work item, in delta form.
///
/// Deserializes directly from the `workitems/{id}/updates` payload; reporting
/// revision snapshots are converted into this shape by the fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub work_item_id: u32,
    #[serde(default)]
    pub rev: u32,
    #[serde(
        default,
        deserialize_with = "identity_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub revised_by: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ItemDetails>,
}

fn identity_name<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(value_text))
}

impl ChangeRecord {
    pub fn new(work_item_id: u32, rev: u32) -> Self {
        Self {
            work_item_id,
            rev,
            revised_by: None,
            fields: BTreeMap::new(),
            details: None,
        }
    }

    /// Builder-style field change setter, mostly for fixtures.
    pub fn with_change(mut self, field: &str, old: Option<&str>, new: Option<&str>) -> Self {
        self.fields.insert(
            field.to_string(),
            FieldChange::new(old.map(Value::from), new.map(Value::from)),
        );
        self
    }

    pub fn with_revised_by(mut self, name: &str) -> Self {
        self.revised_by = Some(name.to_string());
        self
    }

    pub fn new_text(&self, field: &str) -> Option<String> {
        self.fields
            .get(field)
            .and_then(|c| c.new_value.as_ref())
            .and_then(value_text)
    }

    pub fn old_text(&self, field: &str) -> Option<String> {
        self.fields
            .get(field)
            .and_then(|c| c.old_value.as_ref())
            .and_then(value_text)
    }

    pub fn new_state(&self) -> Option<String> {
        self.new_text(fields::STATE)
    }

    pub fn old_state(&self) -> Option<String> {
        self.old_text(fields::STATE)
    }

    /// Raw `StateChangeDate` new value, exactly as received.
    pub fn state_change_date(&self) -> Option<String> {
        self.new_text(fields::STATE_CHANGE_DATE)
    }

    /// Whoever made this revision, when known.
    pub fn changed_by(&self) -> Option<String> {
        self.revised_by
            .clone()
            .or_else(|| self.new_text(fields::CHANGED_BY))
    }

    /// Value of a presentation field: this revision's own delta first, then the
    /// attached details snapshot.
    pub fn detail_text(&self, field: &str) -> Option<String> {
        self.new_text(field).or_else(|| {
            self.details
                .as_ref()
                .and_then(|d| d.get(field))
                .cloned()
        })
    }

    /// Attach a details snapshot unless one is already present.
    pub fn attach_details(&mut self, details: &ItemDetails) {
        if self.details.is_none() {
            self.details = Some(details.clone());
        }
    }
}

/// Envelope of list responses (`{"count": n, "value": [...]}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}
