/// History retrieval.
///
/// Two strategies feed the reconciler through one record shape:
/// - **updates**: per-item delta history (`AdoClient::work_item_updates`),
///   reached through the [`ChangeFeed`] trait;
/// - **revisions**: bulk per-(project, day) snapshots
///   (`AdoClient::scan_revisions`), converted to delta records up front.
///
/// Every outbound call shares one rate limiter and carries a timeout.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::error::FetchError;
use crate::model::{ChangeRecord, ItemDetails};

pub mod ado;
pub mod rate_limit;
pub mod revisions;
pub mod transport;

pub use crate::aggregate::FetchFailure;
pub use ado::{AdoClient, ClientSettings, ScanOutcome, WiqlOutcome, WorkItemsOutcome};

/// Source of per-item change history.
#[allow(async_fn_in_trait)]
pub trait ChangeFeed {
    /// All change records of one work item, oldest first.
    async fn records_for(&self, id: u32) -> Result<Vec<ChangeRecord>, FetchError>;
}

/// Attach current item details to records that do not carry a snapshot yet.
pub fn enrich(records: &mut [ChangeRecord], details: &ItemDetails) {
    for record in records {
        record.attach_details(details);
    }
}

/// Change feed backed by a map, for tests and offline runs.
#[derive(Default)]
pub struct MemoryFeed {
    records: HashMap<u32, Vec<ChangeRecord>>,
    failing: HashSet<u32>,
    requests: Mutex<Vec<u32>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to its item's history.
    pub fn with_record(mut self, record: ChangeRecord) -> Self {
        self.records
            .entry(record.work_item_id)
            .or_default()
            .push(record);
        self
    }

    /// Make fetching `id` fail with HTTP 500.
    pub fn failing(mut self, id: u32) -> Self {
        self.failing.insert(id);
        self
    }

    /// Ids requested so far, in request order.
    pub fn requests(&self) -> Vec<u32> {
        self.requests.lock().clone()
    }
}

impl ChangeFeed for MemoryFeed {
    async fn records_for(&self, id: u32) -> Result<Vec<ChangeRecord>, FetchError> {
        self.requests.lock().push(id);
        if self.failing.contains(&id) {
            return Err(FetchError::Status {
                url: format!("memory://workitems/{}/updates", id),
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(self.records.get(&id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fields;

    #[test]
    fn enrich_fills_only_missing_snapshots() {
        let mut records = vec![ChangeRecord::new(1, 1), ChangeRecord::new(1, 2)];
        records[1].attach_details(&ItemDetails {
            title: Some("kept".to_string()),
            ..Default::default()
        });
        let details = ItemDetails {
            title: Some("current".to_string()),
            project: Some("EDW".to_string()),
            ..Default::default()
        };

        enrich(&mut records, &details);

        assert_eq!(records[0].detail_text(fields::TITLE).as_deref(), Some("current"));
        assert_eq!(records[1].detail_text(fields::TITLE).as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn memory_feed_serves_and_fails() {
        let feed = MemoryFeed::new()
            .with_record(ChangeRecord::new(1, 1))
            .with_record(ChangeRecord::new(1, 2))
            .failing(2);

        assert_eq!(feed.records_for(1).await.unwrap().len(), 2);
        assert!(feed.records_for(2).await.is_err());
        assert!(feed.records_for(3).await.unwrap().is_empty());
        assert_eq!(feed.requests(), vec![1, 2, 3]);
    }
}
