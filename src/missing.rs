use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;

use crate::error::ListingError;
use crate::refresh::{Completion, RequestOutcome};
use crate::remote::RemoteSampleSource;
use crate::snapshot::SnapshotStore;
use crate::table::SourceTable;

/// Finds subgroups with unresolved samples and fetches them, one pass at a
/// time across the whole process.
pub struct MissingEntryCollector<S: RemoteSampleSource + 'static> {
    source: Arc<S>,
    snapshots: SnapshotStore,
    in_flight: bool,
}

impl<S: RemoteSampleSource + 'static> MissingEntryCollector<S> {
    pub fn new(source: Arc<S>, snapshots: SnapshotStore) -> Self {
        Self {
            source,
            snapshots,
            in_flight: false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn find_missing(&self, table: &SourceTable) -> Vec<String> {
        find_missing(table)
    }

    pub fn fetch_missing(
        &mut self,
        subgroup_ids: Vec<String>,
        completions: Sender<Completion>,
    ) -> Result<RequestOutcome, ListingError> {
        if self.in_flight {
            tracing::debug!("missing-sample fetch already in flight");
            return Ok(RequestOutcome::AlreadyInFlight);
        }

        let source = Arc::clone(&self.source);
        let snapshots = self.snapshots.clone();
        let count = subgroup_ids.len();
        thread::Builder::new()
            .name("listing-missing".to_string())
            .spawn(move || {
                let report = source.fetch_missing(&subgroup_ids, &snapshots);
                let _ = completions.send(Completion::MissingFetched {
                    subgroup_ids,
                    report,
                });
            })
            .map_err(|err| ListingError::RefreshFailed(err.to_string()))?;

        tracing::info!(subgroups = count, "missing-sample fetch started");
        self.in_flight = true;
        Ok(RequestOutcome::Started)
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }
}

/// Distinct subgroup ids of flagged rows, in table order.
pub fn find_missing(table: &SourceTable) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for row in table.rows().iter().filter(|row| row.missing_sample) {
        if !row.subgroup_id.is_empty() && !ids.contains(&row.subgroup_id) {
            ids.push(row.subgroup_id.clone());
        }
    }
    ids
}
