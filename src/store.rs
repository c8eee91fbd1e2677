use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::SampleRow;
use crate::error::ListingError;

pub const CACHE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub count: u64,
    pub latest_modified_ms: i64,
}

/// Opaque digest of everything that can change the aggregation result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesSignature {
    pub entries: BTreeMap<String, SourceStamp>,
}

impl SourcesSignature {
    pub fn with_entry(mut self, name: &str, stamp: SourceStamp) -> Self {
        self.entries.insert(name.to_string(), stamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub subgroup_order: Vec<String>,
    #[serde(default)]
    pub rows_by_subgroup: BTreeMap<String, Vec<SampleRow>>,
    #[serde(default)]
    pub sources_signature: SourcesSignature,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            subgroup_order: Vec::new(),
            rows_by_subgroup: BTreeMap::new(),
            sources_signature: SourcesSignature::default(),
            generated_at: None,
        }
    }
}

impl CacheDocument {
    pub fn is_empty(&self) -> bool {
        self.rows_by_subgroup.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows_by_subgroup.values().map(Vec::len).sum()
    }

    pub fn is_fresh_at(&self, signature: &SourcesSignature, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Some(generated_at) = self.generated_at else {
            return false;
        };
        if self.version != CACHE_VERSION || &self.sources_signature != signature {
            return false;
        }
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(generated_at) < ttl
    }

    /// Cached rows for a scope, grouped by subgroup. Order preference is
    /// caller order, then document order, then key order. An empty
    /// `subgroup_ids` means every cached subgroup.
    pub fn rows_for(&self, subgroup_ids: &[String], subgroup_order: &[String]) -> Vec<SampleRow> {
        let wanted = normalize_ids(subgroup_ids);

        let mut ordered = Vec::new();
        for sid in subgroup_order
            .iter()
            .chain(self.subgroup_order.iter())
            .chain(self.rows_by_subgroup.keys())
        {
            push_unique(&mut ordered, sid);
        }
        if !wanted.is_empty() {
            ordered.retain(|sid| wanted.contains(sid));
            for sid in &wanted {
                push_unique(&mut ordered, sid);
            }
        }

        ordered
            .iter()
            .filter_map(|sid| self.rows_by_subgroup.get(sid))
            .flat_map(|rows| rows.iter().cloned())
            .collect()
    }

    /// Replaces the rows of the targeted subgroups and leaves every other
    /// subgroup untouched. With empty `subgroup_ids` the targets are the
    /// subgroups present in `rows`.
    pub fn merge_partial(
        &self,
        subgroup_ids: &[String],
        subgroup_order: &[String],
        rows: &[SampleRow],
        signature: &SourcesSignature,
        now: DateTime<Utc>,
    ) -> CacheDocument {
        let wanted = normalize_ids(subgroup_ids);

        let mut targets = wanted.clone();
        let mut grouped: BTreeMap<String, Vec<SampleRow>> = BTreeMap::new();
        for row in rows {
            let sid = row.subgroup_id.trim();
            if !wanted.is_empty() && !wanted.iter().any(|w| w == sid) {
                continue;
            }
            if wanted.is_empty() {
                push_unique(&mut targets, sid);
            }
            grouped.entry(sid.to_string()).or_default().push(row.clone());
        }

        let mut merged = self.clone();
        merged.version = CACHE_VERSION;
        for sid in &targets {
            merged
                .rows_by_subgroup
                .insert(sid.clone(), grouped.remove(sid).unwrap_or_default());
        }

        let mut order = Vec::new();
        for sid in self
            .subgroup_order
            .iter()
            .chain(subgroup_order.iter())
            .chain(targets.iter())
            .chain(merged.rows_by_subgroup.keys())
        {
            push_unique(&mut order, sid);
        }
        merged.subgroup_order = order;
        merged.sources_signature = signature.clone();
        merged.generated_at = Some(now);
        merged
    }

    pub fn purge_sample(&mut self, subgroup_id: &str, sample_id: &str) -> bool {
        let Some(rows) = self.rows_by_subgroup.get_mut(subgroup_id) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| row.sample_id != sample_id);
        rows.len() != before
    }
}

/// Single owner of the persisted listing cache.
#[derive(Debug)]
pub struct CacheStore {
    path: Utf8PathBuf,
    document: CacheDocument,
    loaded: bool,
}

impl CacheStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            document: CacheDocument::default(),
            loaded: false,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn document(&self) -> &CacheDocument {
        &self.document
    }

    /// Reloads the document from disk. Missing, unreadable, malformed or
    /// outdated documents all come back as an empty document.
    pub fn load(&mut self) -> &CacheDocument {
        self.document = Self::read(&self.path);
        self.loaded = true;
        &self.document
    }

    pub fn read(path: &Utf8Path) -> CacheDocument {
        if !path.as_std_path().exists() {
            return CacheDocument::default();
        }
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!(%path, error = %err, "listing cache unreadable, starting empty");
                return CacheDocument::default();
            }
        };
        match serde_json::from_str::<CacheDocument>(&content) {
            Ok(document) if document.version == CACHE_VERSION => document,
            Ok(document) => {
                tracing::debug!(%path, version = document.version, "listing cache version mismatch");
                CacheDocument::default()
            }
            Err(err) => {
                tracing::debug!(%path, error = %err, "listing cache malformed, starting empty");
                CacheDocument::default()
            }
        }
    }

    pub fn is_fresh(document: &CacheDocument, signature: &SourcesSignature, ttl: Duration) -> bool {
        document.is_fresh_at(signature, ttl, Utc::now())
    }

    pub fn save(&self, document: &CacheDocument) -> Result<(), ListingError> {
        save_document(&self.path, document)
    }

    /// Merges a scoped aggregation result into the in-memory document only.
    /// Persisting it is up to the caller, usually through a [`CacheWriter`].
    pub fn merge(
        &mut self,
        subgroup_ids: &[String],
        subgroup_order: &[String],
        rows: &[SampleRow],
        signature: &SourcesSignature,
    ) -> &CacheDocument {
        if !self.loaded {
            self.load();
        }
        self.document = self
            .document
            .merge_partial(subgroup_ids, subgroup_order, rows, signature, Utc::now());
        &self.document
    }

    /// In-memory counterpart of [`CacheStore::purge_sample`].
    pub fn purge_in_memory(&mut self, subgroup_id: &str, sample_id: &str) -> bool {
        if !self.loaded {
            self.load();
        }
        self.document.purge_sample(subgroup_id, sample_id)
    }

    /// Merges a scoped aggregation result and persists it. The in-memory
    /// document only changes once the write succeeded.
    pub fn commit_merge(
        &mut self,
        subgroup_ids: &[String],
        subgroup_order: &[String],
        rows: &[SampleRow],
        signature: &SourcesSignature,
    ) -> Result<&CacheDocument, ListingError> {
        if !self.loaded {
            self.load();
        }
        let merged = self
            .document
            .merge_partial(subgroup_ids, subgroup_order, rows, signature, Utc::now());
        self.save(&merged)?;
        self.document = merged;
        Ok(&self.document)
    }

    pub fn purge_sample(&mut self, subgroup_id: &str, sample_id: &str) -> Result<bool, ListingError> {
        if !self.loaded {
            self.load();
        }
        let mut updated = self.document.clone();
        if !updated.purge_sample(subgroup_id, sample_id) {
            return Ok(false);
        }
        self.save(&updated)?;
        self.document = updated;
        Ok(true)
    }
}

/// Persists cache documents on a dedicated thread, in submission order.
/// The thread exits once the writer is dropped and its queue is drained.
#[derive(Debug)]
pub struct CacheWriter {
    sender: Sender<CacheDocument>,
}

impl CacheWriter {
    /// `on_saved` runs on the writer thread after every write with the
    /// persisted row count or the write error.
    pub fn spawn<F>(path: Utf8PathBuf, on_saved: F) -> Result<Self, ListingError>
    where
        F: Fn(Result<usize, ListingError>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<CacheDocument>();
        thread::Builder::new()
            .name("listing-cache-writer".to_string())
            .spawn(move || {
                for document in receiver {
                    on_saved(save_document(&path, &document).map(|()| document.row_count()));
                }
            })
            .map_err(|err| ListingError::CacheWrite(err.to_string()))?;
        Ok(Self { sender })
    }

    pub fn submit(&self, document: CacheDocument) -> Result<(), ListingError> {
        self.sender
            .send(document)
            .map_err(|_| ListingError::CacheWrite("cache writer stopped".to_string()))
    }
}

fn save_document(path: &Utf8Path, document: &CacheDocument) -> Result<(), ListingError> {
    let content = serde_json::to_vec_pretty(document)
        .map_err(|err| ListingError::CacheWrite(err.to_string()))?;
    write_bytes_atomic(path, &content).map_err(|err| ListingError::CacheWrite(err.to_string()))?;
    tracing::debug!(%path, rows = document.row_count(), "saved listing cache");
    Ok(())
}

/// Writes a temp file next to `path`, syncs it and renames it over `path`.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ListingError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ListingError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".sample-listing")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ListingError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ListingError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| ListingError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ListingError::Filesystem(err.to_string()))?;
    Ok(())
}

fn normalize_ids(ids: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for id in ids {
        push_unique(&mut out, id);
    }
    out
}

fn push_unique(out: &mut Vec<String>, id: &str) {
    let id = id.trim();
    if !id.is_empty() && !out.iter().any(|seen| seen == id) {
        out.push(id.to_string());
    }
}
