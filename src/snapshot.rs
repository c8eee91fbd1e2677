use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ListingError;
use crate::store::{SourceStamp, SourcesSignature, write_bytes_atomic};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRole {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubgroupInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub group_type: String,
    pub grants: Vec<String>,
    pub roles: Vec<GroupRole>,
}

impl SubgroupInfo {
    pub fn is_team(&self) -> bool {
        self.group_type == "TEAM"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetInfo {
    pub id: String,
    pub name: String,
    pub group_id: String,
    pub grants: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataEntryInfo {
    pub id: String,
    pub name: String,
    pub sample_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRecord {
    pub id: String,
    pub names: Vec<String>,
    pub composition: String,
    pub description: String,
    pub tags: Vec<String>,
    pub reference_url: String,
}

/// Local JSON snapshots of the remote catalog, laid out as
/// `subGroup.json`, `dataset.json`, `datasets/<id>.json`,
/// `dataEntry/<dataset>.json`, `samples/<subgroup>.json` and `self.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: Utf8PathBuf,
}

impl SnapshotStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn subgroup_path(&self) -> Utf8PathBuf {
        self.root.join("subGroup.json")
    }

    pub fn dataset_path(&self) -> Utf8PathBuf {
        self.root.join("dataset.json")
    }

    pub fn dataset_detail_path(&self, dataset_id: &str) -> Utf8PathBuf {
        self.root.join("datasets").join(format!("{dataset_id}.json"))
    }

    pub fn data_entry_dir(&self) -> Utf8PathBuf {
        self.root.join("dataEntry")
    }

    pub fn data_entry_path(&self, dataset_id: &str) -> Utf8PathBuf {
        self.data_entry_dir().join(format!("{dataset_id}.json"))
    }

    pub fn samples_dir(&self) -> Utf8PathBuf {
        self.root.join("samples")
    }

    pub fn samples_path(&self, subgroup_id: &str) -> Utf8PathBuf {
        self.samples_dir().join(format!("{subgroup_id}.json"))
    }

    pub fn self_path(&self) -> Utf8PathBuf {
        self.root.join("self.json")
    }

    /// Groups listed in `subGroup.json`, in file order. A missing file is an
    /// empty list; a file that exists but cannot be parsed is an error.
    pub fn load_subgroups(&self) -> Result<Vec<SubgroupInfo>, ListingError> {
        let path = self.subgroup_path();
        let Some(payload) = read_json(&path)? else {
            return Ok(Vec::new());
        };

        let mut groups = Vec::new();
        for item in items(&payload, "included") {
            let kind = text(item, &["type"]);
            if !kind.is_empty() && kind != "group" {
                continue;
            }
            let id = text(item, &["id"]);
            if id.is_empty() {
                continue;
            }
            let mut name = text(item, &["attributes", "name"]);
            if name.is_empty() {
                name = text(item, &["attributes", "title"]);
            }
            let roles = field(item, &["attributes", "roles"])
                .and_then(Value::as_array)
                .map(|roles| {
                    roles
                        .iter()
                        .map(|role| GroupRole {
                            user_id: text(role, &["userId"]),
                            role: text(role, &["role"]),
                        })
                        .collect()
                })
                .unwrap_or_default();
            groups.push(SubgroupInfo {
                id,
                name,
                description: text(item, &["attributes", "description"]),
                group_type: text(item, &["attributes", "groupType"]),
                grants: grants_from_subjects(field(item, &["attributes", "subjects"])),
                roles,
            });
        }
        Ok(groups)
    }

    pub fn load_datasets(&self) -> Vec<DatasetInfo> {
        let Some(payload) = load_json(&self.dataset_path()) else {
            return Vec::new();
        };

        let mut datasets = Vec::new();
        for item in items(&payload, "data") {
            let id = text(item, &["id"]);
            if id.is_empty() {
                continue;
            }
            let mut group_id = text(item, &["relationships", "group", "data", "id"]);
            let mut grants = dataset_grants(item.get("attributes"));
            if group_id.is_empty() || grants.is_empty() {
                if let Some(detail) = load_json(&self.dataset_detail_path(&id)) {
                    let data = detail.get("data").unwrap_or(&Value::Null);
                    if group_id.is_empty() {
                        group_id = text(data, &["relationships", "group", "data", "id"]);
                    }
                    if grants.is_empty() {
                        grants = dataset_grants(data.get("attributes"));
                    }
                }
            }
            datasets.push(DatasetInfo {
                name: text(item, &["attributes", "name"]),
                id,
                group_id,
                grants,
            });
        }
        datasets
    }

    pub fn load_data_entries(&self, dataset_id: &str) -> Vec<DataEntryInfo> {
        let Some(payload) = load_json(&self.data_entry_path(dataset_id)) else {
            return Vec::new();
        };

        items(&payload, "data")
            .iter()
            .filter_map(|entry| {
                let sample_ids = sample_ids_of_entry(entry);
                if sample_ids.is_empty() {
                    return None;
                }
                Some(DataEntryInfo {
                    id: text(entry, &["id"]),
                    name: text(entry, &["attributes", "name"]),
                    sample_ids,
                })
            })
            .collect()
    }

    /// `None` when the subgroup's sample snapshot has never been fetched.
    pub fn load_samples(&self, subgroup_id: &str) -> Option<Vec<SampleRecord>> {
        let payload = load_json(&self.samples_path(subgroup_id))?;
        if !payload.is_object() {
            return None;
        }
        let records = items(&payload, "data")
            .iter()
            .filter(|item| item.is_object())
            .map(|item| SampleRecord {
                id: text(item, &["id"]),
                names: string_list(field(item, &["attributes", "names"])),
                composition: text(item, &["attributes", "composition"]),
                description: text(item, &["attributes", "description"]),
                tags: string_list(field(item, &["attributes", "tags"])),
                reference_url: text(item, &["attributes", "referenceUrl"]),
            })
            .collect();
        Some(records)
    }

    pub fn current_user_id(&self) -> Option<String> {
        let payload = load_json(&self.self_path())?;
        let id = text(&payload, &["data", "id"]);
        (!id.is_empty()).then_some(id)
    }

    pub fn write_samples(&self, subgroup_id: &str, payload: &Value) -> Result<(), ListingError> {
        let content = serde_json::to_vec_pretty(payload)
            .map_err(|err| ListingError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.samples_path(subgroup_id), &content)
    }

    /// Drops one sample from `samples/<subgroup>.json`. Returns whether the
    /// file changed.
    pub fn remove_sample(&self, subgroup_id: &str, sample_id: &str) -> Result<bool, ListingError> {
        let path = self.samples_path(subgroup_id);
        let Some(mut payload) = load_json(&path) else {
            return Ok(false);
        };
        let Some(data) = payload.get_mut("data").and_then(Value::as_array_mut) else {
            return Ok(false);
        };
        let before = data.len();
        data.retain(|item| text(item, &["id"]) != sample_id);
        if data.len() == before {
            return Ok(false);
        }
        self.write_samples(subgroup_id, &payload)?;
        Ok(true)
    }

    /// Stamps every input that can change the aggregation result.
    pub fn sources_signature(&self) -> SourcesSignature {
        let signature = SourcesSignature::default()
            .with_entry("subGroup.json", file_stamp(self.subgroup_path().as_std_path()))
            .with_entry("dataset.json", file_stamp(self.dataset_path().as_std_path()))
            .with_entry("dataEntry", dir_stamp(self.data_entry_dir().as_std_path()))
            .with_entry("samples", dir_stamp(self.samples_dir().as_std_path()));
        tracing::debug!(root = %self.root, ?signature, "computed sources signature");
        signature
    }
}

fn read_json(path: &Utf8Path) -> Result<Option<Value>, ListingError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ListingError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| ListingError::SnapshotParse {
            path: path.to_string(),
            message: err.to_string(),
        })
}

fn load_json(path: &Utf8Path) -> Option<Value> {
    match read_json(path) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(%path, error = %err, "skipping unreadable snapshot");
            None
        }
    }
}

fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |acc, key| acc.get(*key))
}

fn text(value: &Value, path: &[&str]) -> String {
    match field(value, path) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn items<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn grants_from_subjects(subjects: Option<&Value>) -> Vec<String> {
    let mut grants: Vec<String> = Vec::new();
    for subject in subjects.and_then(Value::as_array).into_iter().flatten() {
        let grant = text(subject, &["grantNumber"]);
        if !grant.is_empty() && !grants.contains(&grant) {
            grants.push(grant);
        }
    }
    grants
}

fn dataset_grants(attributes: Option<&Value>) -> Vec<String> {
    let Some(attributes) = attributes else {
        return Vec::new();
    };
    let mut grants = grants_from_subjects(attributes.get("subjects"));
    if grants.is_empty() {
        grants = grants_from_subjects(attributes.get("subject"));
    }
    if grants.is_empty() {
        let single = text(attributes, &["grantNumber"]);
        if !single.is_empty() {
            grants.push(single);
        }
    }
    grants
}

fn sample_ids_of_entry(entry: &Value) -> Vec<String> {
    match field(entry, &["relationships", "sample", "data"]) {
        Some(Value::Object(_)) => {
            let id = text(entry, &["relationships", "sample", "data", "id"]);
            if id.is_empty() { Vec::new() } else { vec![id] }
        }
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| text(value, &["id"]))
            .filter(|id| !id.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn modified_ms(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|time| DateTime::<Utc>::from(time).timestamp_millis())
        .unwrap_or(0)
}

fn file_stamp(path: &Path) -> SourceStamp {
    if !path.is_file() {
        return SourceStamp::default();
    }
    SourceStamp {
        count: 1,
        latest_modified_ms: modified_ms(path),
    }
}

fn dir_stamp(path: &Path) -> SourceStamp {
    let mut stamp = SourceStamp::default();
    let Ok(entries) = fs::read_dir(path) else {
        return stamp;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        stamp.count += 1;
        stamp.latest_modified_ms = stamp.latest_modified_ms.max(modified_ms(&path));
    }
    stamp
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, SnapshotStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, SnapshotStore::new(root))
    }

    #[test]
    fn missing_subgroup_file_is_empty() {
        let (_temp, store) = temp_store();
        assert!(store.load_subgroups().unwrap().is_empty());
    }

    #[test]
    fn corrupt_subgroup_file_is_an_error() {
        let (_temp, store) = temp_store();
        fs::write(store.subgroup_path().as_std_path(), b"{not json").unwrap();
        assert_matches!(
            store.load_subgroups(),
            Err(ListingError::SnapshotParse { .. })
        );
    }

    #[test]
    fn entry_sample_relationship_accepts_object_and_array() {
        let single = json!({"relationships": {"sample": {"data": {"id": "s1"}}}});
        let many = json!({"relationships": {"sample": {"data": [{"id": "s1"}, {"id": "s2"}, {}]}}});
        assert_eq!(sample_ids_of_entry(&single), vec!["s1"]);
        assert_eq!(sample_ids_of_entry(&many), vec!["s1", "s2"]);
    }

    #[test]
    fn dataset_grants_fall_back_through_shapes() {
        let subjects = json!({"subjects": [{"grantNumber": "A"}, {"grantNumber": "A"}, {"grantNumber": "B"}]});
        let single = json!({"grantNumber": "C"});
        assert_eq!(dataset_grants(Some(&subjects)), vec!["A", "B"]);
        assert_eq!(dataset_grants(Some(&single)), vec!["C"]);
        assert!(dataset_grants(None).is_empty());
    }

    #[test]
    fn remove_sample_rewrites_snapshot() {
        let (_temp, store) = temp_store();
        store
            .write_samples("g1", &json!({"data": [{"id": "s1"}, {"id": "s2"}]}))
            .unwrap();

        assert!(store.remove_sample("g1", "s1").unwrap());
        assert!(!store.remove_sample("g1", "s1").unwrap());
        let remaining = store.load_samples("g1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "s2");
    }

    #[test]
    fn signature_tracks_sample_files() {
        let (_temp, store) = temp_store();
        let empty = store.sources_signature();
        store.write_samples("g1", &json!({"data": []})).unwrap();
        let after = store.sources_signature();
        assert_ne!(empty, after);
        assert_eq!(after.entries["samples"].count, 1);
    }
}
