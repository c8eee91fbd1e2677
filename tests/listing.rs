use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use sample_listing::config::{Config, ConfigLoader, ResolvedConfig};
use sample_listing::domain::RowKey;
use sample_listing::error::ListingError;
use sample_listing::listing::{
    Listing, ListingUpdate, ProgressEvent, ProgressSink, RefreshDecision,
};
use sample_listing::refresh::Trigger;
use sample_listing::remote::RemoteSampleSource;
use sample_listing::scope::Prefilter;
use sample_listing::snapshot::SnapshotStore;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

#[derive(Default)]
struct StaticSource {
    payloads: HashMap<String, Value>,
    calls: AtomicUsize,
}

impl StaticSource {
    fn with(subgroup_id: &str, payload: Value) -> Self {
        let mut payloads = HashMap::new();
        payloads.insert(subgroup_id.to_string(), payload);
        Self {
            payloads,
            calls: AtomicUsize::new(0),
        }
    }
}

impl RemoteSampleSource for StaticSource {
    fn fetch_samples(&self, subgroup_id: &str) -> Result<Value, ListingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .get(subgroup_id)
            .cloned()
            .ok_or_else(|| ListingError::MaterialStatus {
                status: 404,
                message: format!("no samples for {subgroup_id}"),
            })
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    config: ResolvedConfig,
    snapshots: SnapshotStore,
}

fn write(path: Utf8PathBuf, value: Value) {
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), serde_json::to_vec(&value).unwrap()).unwrap();
}

/// Two owned TEAM subgroups: g1 has a sample snapshot, g2 has none yet.
fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let data_root = root.join("data");
    let snapshots = SnapshotStore::new(data_root.clone());

    write(snapshots.self_path(), json!({"data": {"id": "u1"}}));
    write(
        snapshots.subgroup_path(),
        json!({"included": [
            {"type": "group", "id": "g1", "attributes": {"name": "Alloys", "groupType": "TEAM",
                "subjects": [{"grantNumber": "JPMXP-9"}],
                "roles": [{"userId": "u1", "role": "OWNER"}]}},
            {"type": "group", "id": "g2", "attributes": {"name": "Oxides", "groupType": "TEAM",
                "roles": [{"userId": "u1", "role": "ASSISTANT"}]}},
            {"type": "group", "id": "p1", "attributes": {"name": "Project", "groupType": "PROJECT"}}
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
        json!({"data": [
            {"id": "s1", "attributes": {"names": ["Ti-6Al-4V"], "composition": "Ti"}},
            {"id": "s2", "attributes": {"names": ["Inconel 718"]}}
        ]}),
    );

    let config = ConfigLoader::resolve_config(Config {
        data_root: Some(data_root.to_string()),
        cache_path: Some(root.join("cache").join("listing.json").to_string()),
        page_size: Some(10),
        ..Config::default()
    })
    .unwrap();

    Fixture {
        _temp: temp,
        config,
        snapshots,
    }
}

fn keys<S: RemoteSampleSource + 'static>(listing: &Listing<S>) -> Vec<String> {
    listing
        .view()
        .table()
        .rows()
        .iter()
        .map(|row| row.key().to_string())
        .collect()
}

fn refreshed_count(updates: &[ListingUpdate]) -> usize {
    updates
        .iter()
        .filter(|update| matches!(update, ListingUpdate::Refreshed { .. }))
        .count()
}

#[test]
fn cold_start_aggregates_and_persists() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());

    let report = listing.load(Trigger::Background, false, &sink).unwrap();
    assert_eq!(report.cached_rows, 0);
    assert!(!report.fresh);
    assert_eq!(report.refresh, RefreshDecision::Started);
    assert_eq!(report.scope, "g1,g2");

    let updates = listing.wait_idle(WAIT, &sink);
    assert_eq!(refreshed_count(&updates), 1);
    assert_matches!(
        &updates[0],
        ListingUpdate::Refreshed { missing, .. } if missing == &vec!["g2".to_string()]
    );
    assert!(
        !updates
            .iter()
            .any(|update| matches!(update, ListingUpdate::CacheWriteFailed { .. }))
    );
    assert_eq!(keys(&listing), vec!["g1/s1", "g1/s2", "g2/"]);
    assert!(listing.view().table().rows()[2].missing_sample);
    assert!(fixture.config.cache_path.as_std_path().exists());
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .any(|message| message.starts_with("sample listing updated"))
    );
}

#[test]
fn fresh_cache_is_served_without_refresh() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut first = Listing::new(fixture.config.clone(), StaticSource::default());
    first.load(Trigger::Background, false, &sink).unwrap();
    first.wait_idle(WAIT, &sink);

    let mut second = Listing::new(fixture.config.clone(), StaticSource::default());
    let report = second.load(Trigger::Background, false, &sink).unwrap();
    assert!(report.fresh);
    assert_eq!(report.cached_rows, 3);
    assert_eq!(report.refresh, RefreshDecision::Skipped);
    assert!(!second.is_busy());
    assert_eq!(keys(&second), vec!["g1/s1", "g1/s2", "g2/"]);
}

#[test]
fn snapshot_change_makes_cache_stale() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut first = Listing::new(fixture.config.clone(), StaticSource::default());
    first.load(Trigger::Background, false, &sink).unwrap();
    first.wait_idle(WAIT, &sink);

    fixture
        .snapshots
        .write_samples("g2", &json!({"data": [{"id": "s5", "attributes": {"names": ["NiO"]}}]}))
        .unwrap();

    let mut second = Listing::new(fixture.config.clone(), StaticSource::default());
    let report = second.load(Trigger::Background, false, &sink).unwrap();
    assert!(!report.fresh);
    assert_eq!(report.cached_rows, 3);
    assert_eq!(report.refresh, RefreshDecision::Started);
    second.wait_idle(WAIT, &sink);
    assert_eq!(second.cache().document().row_count(), 3);
    assert!(
        second
            .cache()
            .document()
            .rows_for(&["g2".to_string()], &[])
            .iter()
            .any(|row| row.sample_id == "s5")
    );
}

#[test]
fn back_to_back_triggers_run_one_aggregation() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());

    let first = listing.load(Trigger::Background, false, &sink).unwrap();
    let second = listing.refresh(&sink).unwrap();
    assert_eq!(first.refresh, RefreshDecision::Started);
    assert_eq!(second.refresh, RefreshDecision::AlreadyInFlight);

    let updates = listing.wait_idle(WAIT, &sink);
    assert_eq!(refreshed_count(&updates), 1);
    assert!(!listing.is_busy());
}

#[test]
fn fetch_missing_resolves_placeholder_rows() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let source = StaticSource::with(
        "g2",
        json!({"data": [{"id": "s5", "attributes": {"names": ["NiO"], "composition": "NiO"}}]}),
    );
    let mut listing = Listing::new(fixture.config.clone(), source);
    listing.load(Trigger::Background, false, &sink).unwrap();
    listing.wait_idle(WAIT, &sink);

    let decision = listing.fetch_missing(&sink).unwrap();
    assert_eq!(decision, RefreshDecision::Started);
    let updates = listing.wait_idle(WAIT, &sink);

    let fetched: Vec<_> = updates
        .iter()
        .filter_map(|update| match update {
            ListingUpdate::MissingFetched(report) => Some(report.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].succeeded, vec!["g2".to_string()]);
    assert!(fetched[0].failed.is_empty());
    assert_eq!(refreshed_count(&updates), 1);

    assert_eq!(keys(&listing), vec!["g1/s1", "g1/s2", "g2/s5"]);
    assert!(listing.view().table().rows().iter().all(|row| !row.missing_sample));
    assert!(fixture.snapshots.samples_path("g2").as_std_path().exists());
}

#[test]
fn fetch_missing_with_nothing_pending_is_skipped() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());
    listing
        .set_prefilter(
            Prefilter {
                subgroup_id: Some("g1".to_string()),
                ..Prefilter::default()
            },
            &sink,
        )
        .unwrap();
    listing.wait_idle(WAIT, &sink);

    assert_eq!(listing.fetch_missing(&sink).unwrap(), RefreshDecision::Skipped);
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .any(|message| message == "no subgroups to fetch")
    );
}

#[test]
fn failed_fetch_is_reported_per_subgroup() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());
    listing.load(Trigger::Background, false, &sink).unwrap();
    listing.wait_idle(WAIT, &sink);

    listing.fetch_missing(&sink).unwrap();
    let updates = listing.wait_idle(WAIT, &sink);
    let report = updates
        .iter()
        .find_map(|update| match update {
            ListingUpdate::MissingFetched(report) => Some(report.clone()),
            _ => None,
        })
        .unwrap();
    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].subgroup_id, "g2");
    assert_eq!(refreshed_count(&updates), 0);
    assert_eq!(keys(&listing), vec!["g1/s1", "g1/s2", "g2/"]);
}

#[test]
fn prefilter_switch_shows_only_scoped_rows() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());
    listing.load(Trigger::Background, false, &sink).unwrap();
    listing.wait_idle(WAIT, &sink);

    let report = listing
        .set_prefilter(
            Prefilter {
                subgroup_id: Some("g1".to_string()),
                ..Prefilter::default()
            },
            &sink,
        )
        .unwrap();
    assert_eq!(report.scope, "g1");
    assert_eq!(report.cached_rows, 2);
    assert_eq!(report.refresh, RefreshDecision::Skipped);
    assert_eq!(keys(&listing), vec!["g1/s1", "g1/s2"]);

    let report = listing
        .set_prefilter(
            Prefilter {
                grant_number: Some("JPMXP-404".to_string()),
                ..Prefilter::default()
            },
            &sink,
        )
        .unwrap();
    assert_eq!(report.cached_rows, 0);
    assert!(keys(&listing).is_empty());
    listing.wait_idle(WAIT, &sink);
    assert!(keys(&listing).is_empty());
}

#[test]
fn empty_scope_does_not_restamp_stale_cache() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());
    listing.load(Trigger::Background, false, &sink).unwrap();
    listing.wait_idle(WAIT, &sink);

    fixture
        .snapshots
        .write_samples("g2", &json!({"data": [{"id": "s5", "attributes": {"names": ["NiO"]}}]}))
        .unwrap();

    let report = listing
        .set_prefilter(
            Prefilter {
                grant_number: Some("nomatch".to_string()),
                ..Prefilter::default()
            },
            &sink,
        )
        .unwrap();
    assert_eq!(report.scope, "");
    assert_eq!(report.refresh, RefreshDecision::Skipped);
    assert!(!listing.is_busy());
    assert!(keys(&listing).is_empty());

    let report = listing.set_prefilter(Prefilter::default(), &sink).unwrap();
    assert!(!report.fresh);
    assert_eq!(report.refresh, RefreshDecision::Started);
    listing.wait_idle(WAIT, &sink);
    assert_eq!(keys(&listing).len(), 3);
    assert!(
        listing
            .cache()
            .document()
            .rows_for(&["g2".to_string()], &[])
            .iter()
            .any(|row| row.sample_id == "s5")
    );
}

#[test]
fn scoped_refresh_keeps_other_subgroups_cached() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default()).with_prefilter(
        Prefilter {
            subgroup_id: Some("g1".to_string()),
            ..Prefilter::default()
        },
    );
    listing.refresh(&sink).unwrap();
    listing.wait_idle(WAIT, &sink);
    assert_eq!(listing.cache().document().row_count(), 2);

    let mut full = Listing::new(fixture.config.clone(), StaticSource::default());
    full.refresh(&sink).unwrap();
    full.wait_idle(WAIT, &sink);

    let mut scoped = Listing::new(fixture.config.clone(), StaticSource::default()).with_prefilter(
        Prefilter {
            subgroup_id: Some("g1".to_string()),
            ..Prefilter::default()
        },
    );
    scoped.refresh(&sink).unwrap();
    scoped.wait_idle(WAIT, &sink);
    let document = scoped.cache().document();
    assert_eq!(document.row_count(), 3);
    assert_eq!(document.subgroup_order, vec!["g1", "g2"]);
}

#[test]
fn purge_removes_sample_everywhere() {
    let fixture = fixture();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());
    listing.load(Trigger::Background, false, &sink).unwrap();
    listing.wait_idle(WAIT, &sink);

    let key = RowKey::new("g1", "s2");
    let report = listing.purge_sample(&key, &sink).unwrap();
    assert!(report.snapshot_removed);
    assert!(report.cache_removed);
    assert!(report.row_removed);
    assert_eq!(keys(&listing), vec!["g1/s1", "g2/"]);
    let remaining = fixture.snapshots.load_samples("g1").unwrap();
    assert_eq!(remaining.len(), 1);

    assert_matches!(
        listing.purge_sample(&key, &sink),
        Err(ListingError::SampleNotFound(_))
    );
    assert_matches!(
        listing.purge_sample(&RowKey::new("g2", ""), &sink),
        Err(ListingError::InvalidRowKey(_))
    );
}

#[test]
fn user_refresh_failure_is_surfaced() {
    let fixture = fixture();
    std::fs::write(fixture.snapshots.subgroup_path().as_std_path(), b"{broken").unwrap();
    let sink = RecordingSink::default();
    let mut listing = Listing::new(fixture.config.clone(), StaticSource::default());

    let err = listing.refresh(&sink).unwrap_err();
    assert_matches!(err, ListingError::SnapshotParse { .. });

    let report = listing.load(Trigger::Background, false, &sink).unwrap();
    assert_eq!(report.scope, "*");
    let updates = listing.wait_idle(WAIT, &sink);
    assert_matches!(
        updates.as_slice(),
        [ListingUpdate::RefreshFailed {
            trigger: Trigger::Background,
            ..
        }]
    );
}
