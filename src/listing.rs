use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::aggregate::RowAggregator;
use crate::config::ResolvedConfig;
use crate::domain::{RowKey, SampleRow};
use crate::error::ListingError;
use crate::missing::{MissingEntryCollector, find_missing};
use crate::refresh::{Completion, RefreshCoordinator, RequestOutcome, Trigger};
use crate::remote::{FetchReport, RemoteSampleSource};
use crate::scope::{Prefilter, Scope, resolve_scope};
use crate::snapshot::SnapshotStore;
use crate::store::{CacheStore, CacheWriter, SourcesSignature};
use crate::view::{ListingView, RefreshApplied};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshDecision {
    Skipped,
    Started,
    AlreadyInFlight,
}

impl From<RequestOutcome> for RefreshDecision {
    fn from(outcome: RequestOutcome) -> Self {
        match outcome {
            RequestOutcome::Started => RefreshDecision::Started,
            RequestOutcome::AlreadyInFlight => RefreshDecision::AlreadyInFlight,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub scope: String,
    pub cached_rows: usize,
    pub fresh: bool,
    pub refresh: RefreshDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub key: String,
    pub snapshot_removed: bool,
    pub cache_removed: bool,
    pub row_removed: bool,
}

#[derive(Debug)]
pub enum ListingUpdate {
    Refreshed {
        scope: String,
        applied: Option<RefreshApplied>,
        missing: Vec<String>,
    },
    RefreshFailed {
        scope: String,
        trigger: Trigger,
        error: ListingError,
    },
    MissingFetched(FetchReport),
    CacheWriteFailed {
        error: String,
    },
}

/// Owns the whole listing pipeline on one thread: snapshots, cache, view,
/// and the background launchers. Cache files are written by a single
/// writer thread so the owning thread never waits on disk.
pub struct Listing<S: RemoteSampleSource + 'static> {
    config: ResolvedConfig,
    snapshots: SnapshotStore,
    cache: CacheStore,
    writer: Option<CacheWriter>,
    pending_saves: usize,
    view: ListingView,
    coordinator: RefreshCoordinator,
    collector: MissingEntryCollector<S>,
    prefilter: Prefilter,
    scope: Scope,
    shown_scope: Option<String>,
    /// Fetched subgroups still waiting for their re-aggregation.
    pending_followup: Option<Scope>,
    started: HashMap<String, Instant>,
}

impl<S: RemoteSampleSource + 'static> Listing<S> {
    pub fn new(config: ResolvedConfig, source: S) -> Self {
        let snapshots = SnapshotStore::new(config.data_root.clone());
        let cache = CacheStore::new(config.cache_path.clone());
        let view = ListingView::new(config.columns.clone(), config.page_size);
        let collector = MissingEntryCollector::new(Arc::new(source), snapshots.clone());
        Self {
            config,
            snapshots,
            cache,
            writer: None,
            pending_saves: 0,
            view,
            coordinator: RefreshCoordinator::new(),
            collector,
            prefilter: Prefilter::default(),
            scope: Scope::default(),
            shown_scope: None,
            pending_followup: None,
            started: HashMap::new(),
        }
    }

    /// Sets the prefilter without loading; see [`Listing::set_prefilter`].
    pub fn with_prefilter(mut self, prefilter: Prefilter) -> Self {
        self.prefilter = prefilter;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn view(&self) -> &ListingView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ListingView {
        &mut self.view
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn prefilter(&self) -> &Prefilter {
        &self.prefilter
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_busy(&self) -> bool {
        !self.coordinator.is_idle()
            || self.collector.is_in_flight()
            || self.pending_saves > 0
            || self.pending_followup.is_some()
    }

    pub fn set_prefilter(
        &mut self,
        prefilter: Prefilter,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, ListingError> {
        self.prefilter = prefilter;
        self.load(Trigger::Background, false, sink)
    }

    /// Shows cached rows for the current scope right away, then starts a
    /// background aggregation when the cache is stale or `force` is set.
    pub fn load(
        &mut self,
        trigger: Trigger,
        force: bool,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, ListingError> {
        self.scope = match resolve_scope(&self.snapshots, &self.prefilter) {
            Ok(scope) => scope,
            Err(err) if trigger == Trigger::Background => {
                tracing::warn!(error = %err, "subgroup snapshot unreadable, listing everything");
                notify(sink, format!("subgroup snapshot unreadable: {err}"), None);
                Scope::all(Vec::new())
            }
            Err(err) => return Err(err),
        };
        let scope_key = self.scope.key();

        // While writes are queued the file lags behind the in-memory document.
        if self.pending_saves == 0 {
            self.cache.load();
        }
        if self.scope.subgroup_order.is_empty() {
            self.scope.subgroup_order = self.cache.document().subgroup_order.clone();
        }
        let cached = self.scoped_cache_rows();
        let cached_rows = cached.len();
        // Rows of another scope must not linger; the refresh would only
        // patch them.
        if cached_rows > 0 || self.shown_scope.as_deref() != Some(scope_key.as_str()) {
            self.view.set_rows(cached);
            self.shown_scope = Some(scope_key.clone());
        }
        tracing::debug!(scope = %scope_key, cached_rows, "listing loaded from cache");

        // Nothing to aggregate; a merge would only restamp the document and
        // make every other subgroup look fresh.
        if self.scope.is_empty() {
            return Ok(LoadReport {
                scope: scope_key,
                cached_rows,
                fresh: false,
                refresh: RefreshDecision::Skipped,
            });
        }

        let signature = self.snapshots.sources_signature();
        let fresh = !force && CacheStore::is_fresh(self.cache.document(), &signature, self.config.ttl);

        if fresh && cached_rows > 0 {
            if self.config.auto_fetch_missing {
                self.start_missing_fetch(sink)?;
            }
            return Ok(LoadReport {
                scope: scope_key,
                cached_rows,
                fresh,
                refresh: RefreshDecision::Skipped,
            });
        }

        let outcome = self.start_refresh(self.scope.clone(), trigger, signature)?;
        if outcome == RequestOutcome::Started {
            notify(sink, "refreshing sample listing".to_string(), None);
        }
        Ok(LoadReport {
            scope: scope_key,
            cached_rows,
            fresh,
            refresh: outcome.into(),
        })
    }

    /// User-initiated refresh; ignores freshness.
    pub fn refresh(&mut self, sink: &dyn ProgressSink) -> Result<LoadReport, ListingError> {
        self.load(Trigger::User, true, sink)
    }

    /// User-initiated fetch of every subgroup in scope holding unresolved
    /// samples.
    pub fn fetch_missing(&mut self, sink: &dyn ProgressSink) -> Result<RefreshDecision, ListingError> {
        self.start_missing_fetch(sink)
    }

    /// Applies finished background work. Call from the owning thread.
    pub fn pump(&mut self, sink: &dyn ProgressSink) -> Vec<ListingUpdate> {
        let mut updates = Vec::new();
        while let Some(completion) = self.coordinator.poll() {
            updates.extend(self.handle(completion, sink));
        }
        updates
    }

    /// Blocks until no background work remains or `timeout` elapses.
    pub fn wait_idle(&mut self, timeout: Duration, sink: &dyn ProgressSink) -> Vec<ListingUpdate> {
        let deadline = Instant::now() + timeout;
        let mut updates = self.pump(sink);
        while self.is_busy() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("gave up waiting for background work");
                break;
            }
            if let Some(completion) = self.coordinator.recv_timeout(remaining) {
                updates.extend(self.handle(completion, sink));
            }
        }
        updates
    }

    /// Removes one sample from the local snapshot, the cache and the table.
    pub fn purge_sample(&mut self, key: &RowKey, sink: &dyn ProgressSink) -> Result<PurgeReport, ListingError> {
        if key.is_placeholder() {
            return Err(ListingError::InvalidRowKey(key.to_string()));
        }
        let snapshot_removed = self.snapshots.remove_sample(&key.subgroup_id, &key.sample_id)?;
        let cache_removed = self.cache.purge_in_memory(&key.subgroup_id, &key.sample_id);
        if cache_removed {
            self.persist_cache()?;
        }
        let row_removed = self.view.remove_row(key);
        if !snapshot_removed && !cache_removed && !row_removed {
            return Err(ListingError::SampleNotFound(key.to_string()));
        }
        notify(sink, format!("purged sample {key}"), None);
        Ok(PurgeReport {
            key: key.to_string(),
            snapshot_removed,
            cache_removed,
            row_removed,
        })
    }

    fn scoped_cache_rows(&self) -> Vec<SampleRow> {
        if self.scope.is_empty() {
            return Vec::new();
        }
        self.cache
            .document()
            .rows_for(self.scope.ids_or_empty(), &self.scope.subgroup_order)
    }

    /// Queues the current in-memory document for the writer thread.
    fn persist_cache(&mut self) -> Result<(), ListingError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let completions = self.coordinator.sender();
                CacheWriter::spawn(self.cache.path().to_path_buf(), move |result| {
                    let _ = completions.send(Completion::CacheSaved { result });
                })?
            }
        };
        let submitted = writer.submit(self.cache.document().clone());
        self.writer = Some(writer);
        submitted?;
        self.pending_saves += 1;
        Ok(())
    }

    fn start_refresh(
        &mut self,
        scope: Scope,
        trigger: Trigger,
        signature: SourcesSignature,
    ) -> Result<RequestOutcome, ListingError> {
        let aggregator = RowAggregator::new(self.snapshots.clone());
        let key = scope.key();
        let outcome = self
            .coordinator
            .request(scope, trigger, signature, move |ids| aggregator.aggregate(ids))?;
        if outcome == RequestOutcome::Started {
            self.started.insert(key, Instant::now());
        }
        Ok(outcome)
    }

    /// Re-aggregates fetched subgroups once no running refresh covers any
    /// of them; a running one may have read the snapshots before the fetch.
    fn start_followup(&mut self) {
        let Some(scope) = self.pending_followup.take() else {
            return;
        };
        if self.coordinator.overlaps(&scope) {
            tracing::debug!(scope = %scope.key(), "follow-up refresh waits for a running refresh");
            self.pending_followup = Some(scope);
            return;
        }
        let signature = self.snapshots.sources_signature();
        if let Err(err) = self.start_refresh(scope, Trigger::MissingFetch, signature) {
            tracing::warn!(error = %err, "follow-up refresh not started");
        }
    }

    fn start_missing_fetch(&mut self, sink: &dyn ProgressSink) -> Result<RefreshDecision, ListingError> {
        let ids: Vec<String> = find_missing(self.view.table())
            .into_iter()
            .filter(|id| self.scope.contains(id))
            .collect();
        if ids.is_empty() {
            notify(sink, FetchReport::default().message(), None);
            return Ok(RefreshDecision::Skipped);
        }
        let outcome = self.collector.fetch_missing(ids, self.coordinator.sender())?;
        if outcome == RequestOutcome::Started {
            self.started.insert(MISSING_KEY.to_string(), Instant::now());
            notify(sink, "fetching missing samples".to_string(), None);
        }
        Ok(outcome.into())
    }

    fn handle(&mut self, completion: Completion, sink: &dyn ProgressSink) -> Vec<ListingUpdate> {
        match completion {
            Completion::Refreshed {
                scope,
                trigger,
                signature,
                result,
            } => {
                let key = scope.key();
                let elapsed = self.started.remove(&key).map(|start| start.elapsed());
                let aggregation = match result {
                    Ok(aggregation) => aggregation,
                    Err(error) => {
                        notify(sink, format!("sample listing refresh failed: {error}"), elapsed);
                        self.start_followup();
                        return vec![ListingUpdate::RefreshFailed {
                            scope: key,
                            trigger,
                            error,
                        }];
                    }
                };

                self.cache
                    .merge(scope.ids_or_empty(), &scope.subgroup_order, &aggregation.rows, &signature);
                let write_error = self.persist_cache().err();

                let applied = if trigger == Trigger::MissingFetch {
                    // Fetched subgroups may only be part of what is shown.
                    let rows = self.scoped_cache_rows();
                    self.view.set_rows(rows);
                    Some(RefreshApplied::Replaced)
                } else if key != self.scope.key() {
                    tracing::debug!(scope = %key, "refresh finished for a scope no longer shown");
                    None
                } else {
                    Some(self.view.apply_refresh(aggregation.rows))
                };

                notify(
                    sink,
                    format!("sample listing updated: {} rows", self.view.table().rows().len()),
                    elapsed,
                );

                let mut updates = vec![ListingUpdate::Refreshed {
                    scope: key,
                    applied,
                    missing: aggregation.missing.clone(),
                }];
                if let Some(err) = write_error {
                    tracing::warn!(error = %err, "listing cache not queued for writing");
                    updates.push(ListingUpdate::CacheWriteFailed {
                        error: err.to_string(),
                    });
                }
                self.start_followup();
                if self.config.auto_fetch_missing
                    && trigger != Trigger::MissingFetch
                    && !aggregation.missing.is_empty()
                {
                    if let Err(err) = self.start_missing_fetch(sink) {
                        tracing::warn!(error = %err, "automatic missing-sample fetch not started");
                    }
                }
                updates
            }
            Completion::MissingFetched { subgroup_ids, report } => {
                self.collector.finish();
                let elapsed = self.started.remove(MISSING_KEY).map(|start| start.elapsed());
                notify(sink, report.message(), elapsed);
                tracing::info!(
                    subgroups = subgroup_ids.len(),
                    succeeded = report.succeeded.len(),
                    "missing-sample fetch finished"
                );
                if !report.succeeded.is_empty() {
                    let mut ids = self
                        .pending_followup
                        .take()
                        .and_then(|pending| pending.subgroup_ids)
                        .unwrap_or_default();
                    for id in &report.succeeded {
                        if !ids.contains(id) {
                            ids.push(id.clone());
                        }
                    }
                    self.pending_followup = Some(Scope {
                        subgroup_ids: Some(ids),
                        subgroup_order: self.scope.subgroup_order.clone(),
                    });
                    self.start_followup();
                }
                vec![ListingUpdate::MissingFetched(report)]
            }
            Completion::CacheSaved { result } => {
                self.pending_saves = self.pending_saves.saturating_sub(1);
                match result {
                    Ok(rows) => {
                        tracing::debug!(rows, "listing cache persisted");
                        Vec::new()
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "listing cache not updated");
                        notify(sink, format!("listing cache not updated: {error}"), None);
                        vec![ListingUpdate::CacheWriteFailed {
                            error: error.to_string(),
                        }]
                    }
                }
            }
        }
    }
}

const MISSING_KEY: &str = "#missing";

fn notify(sink: &dyn ProgressSink, message: String, elapsed: Option<Duration>) {
    sink.event(ProgressEvent { message, elapsed });
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use camino::Utf8PathBuf;
    use serde_json::{Value, json};

    use super::*;
    use crate::aggregate::Aggregation;
    use crate::config::{Config, ConfigLoader};

    struct Offline;

    impl RemoteSampleSource for Offline {
        fn fetch_samples(&self, subgroup_id: &str) -> Result<Value, ListingError> {
            Err(ListingError::MaterialHttp(format!("offline: {subgroup_id}")))
        }
    }

    struct Quiet;

    impl ProgressSink for Quiet {
        fn event(&self, _event: ProgressEvent) {}
    }

    fn write(path: Utf8PathBuf, value: Value) {
        std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(path.as_std_path(), serde_json::to_vec(&value).unwrap()).unwrap();
    }

    fn listing(temp: &tempfile::TempDir) -> (Listing<Offline>, SnapshotStore) {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let snapshots = SnapshotStore::new(root.join("data"));
        write(snapshots.self_path(), json!({"data": {"id": "u1"}}));
        write(
            snapshots.subgroup_path(),
            json!({"included": [
                {"type": "group", "id": "g1", "attributes": {"name": "Alloys", "groupType": "TEAM",
                    "roles": [{"userId": "u1", "role": "OWNER"}]}},
                {"type": "group", "id": "g2", "attributes": {"name": "Oxides", "groupType": "TEAM",
                    "roles": [{"userId": "u1", "role": "OWNER"}]}}
            ]}),
        );
        write(
            snapshots.dataset_path(),
            json!({"data": [
                {"id": "d1", "attributes": {"name": "Tensile"}, "relationships": {"group": {"data": {"id": "g1"}}}},
                {"id": "d2", "attributes": {"name": "XRD"}, "relationships": {"group": {"data": {"id": "g2"}}}}
            ]}),
        );
        write(
            snapshots.data_entry_path("d1"),
            json!({"data": [
                {"id": "e1", "attributes": {"name": "tile A"}, "relationships": {"sample": {"data": {"id": "s1"}}}}
            ]}),
        );
        write(
            snapshots.data_entry_path("d2"),
            json!({"data": [
                {"id": "e2", "attributes": {"name": "tile B"}, "relationships": {"sample": {"data": {"id": "s5"}}}}
            ]}),
        );
        write(
            snapshots.samples_path("g1"),
            json!({"data": [{"id": "s1", "attributes": {"names": ["Ti-6Al-4V"]}}]}),
        );

        let config = ConfigLoader::resolve_config(Config {
            data_root: Some(root.join("data").to_string()),
            cache_path: Some(root.join("cache.json").to_string()),
            ..Config::default()
        })
        .unwrap();
        (Listing::new(config, Offline), snapshots)
    }

    fn keys(listing: &Listing<Offline>) -> Vec<String> {
        listing
            .view()
            .table()
            .rows()
            .iter()
            .map(|row| row.key().to_string())
            .collect()
    }

    #[test]
    fn fetched_subgroups_are_reaggregated_after_a_running_refresh() {
        let temp = tempfile::tempdir().unwrap();
        let (mut listing, snapshots) = listing(&temp);
        let wait = Duration::from_secs(10);
        listing.load(Trigger::Background, false, &Quiet).unwrap();
        listing.wait_idle(wait, &Quiet);
        assert_eq!(keys(&listing), vec!["g1/s1", "g2/"]);

        // A refresh of the shown scope that read the snapshots before the fetch.
        let stale = listing.view().table().rows().to_vec();
        let gate = Arc::new(Barrier::new(2));
        let held = Arc::clone(&gate);
        let shown = listing.scope().clone();
        listing
            .coordinator
            .request(shown, Trigger::User, SourcesSignature::default(), move |_| {
                held.wait();
                Ok(Aggregation {
                    rows: stale,
                    missing: vec!["g2".to_string()],
                    ..Aggregation::default()
                })
            })
            .unwrap();

        snapshots
            .write_samples("g2", &json!({"data": [{"id": "s5", "attributes": {"names": ["NiO"]}}]}))
            .unwrap();
        let fetched = listing.handle(
            Completion::MissingFetched {
                subgroup_ids: vec!["g2".to_string()],
                report: FetchReport {
                    succeeded: vec!["g2".to_string()],
                    failed: Vec::new(),
                },
            },
            &Quiet,
        );
        assert_eq!(fetched.len(), 1);
        assert!(listing.pending_followup.is_some());
        assert!(listing.is_busy());

        gate.wait();
        let updates = listing.wait_idle(wait, &Quiet);
        let refreshed: Vec<&String> = updates
            .iter()
            .filter_map(|update| match update {
                ListingUpdate::Refreshed { scope, .. } => Some(scope),
                _ => None,
            })
            .collect();
        assert_eq!(refreshed, vec!["g1,g2", "g2"]);
        assert!(listing.pending_followup.is_none());
        assert_eq!(keys(&listing), vec!["g1/s1", "g2/s5"]);
        assert!(listing.view().table().rows().iter().all(|row| !row.missing_sample));
    }
}
