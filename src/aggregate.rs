use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::{ColumnSpec, SampleRow, TileLink, default_columns, normalize_sample_name};
use crate::error::ListingError;
use crate::snapshot::{DatasetInfo, SnapshotStore, SubgroupInfo};

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<SampleRow>,
    /// Subgroups holding at least one row with an unresolved sample.
    pub missing: Vec<String>,
}

/// Builds canonical rows from the local snapshots.
#[derive(Debug, Clone)]
pub struct RowAggregator {
    snapshots: SnapshotStore,
}

struct TileRef {
    data_entry_id: String,
    data_entry_name: String,
    dataset_id: String,
}

impl RowAggregator {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self { snapshots }
    }

    /// `None` aggregates every subgroup listed in the snapshot.
    pub fn aggregate(&self, subgroup_ids: Option<&[String]>) -> Result<Aggregation, ListingError> {
        let groups = self.snapshots.load_subgroups()?;
        let datasets = self.snapshots.load_datasets();
        let wanted: Option<HashSet<&str>> =
            subgroup_ids.map(|ids| ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()).collect());

        let datasets_by_id: HashMap<&str, &DatasetInfo> =
            datasets.iter().map(|dataset| (dataset.id.as_str(), dataset)).collect();
        let mut datasets_by_group: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for dataset in &datasets {
            if !dataset.group_id.is_empty() {
                datasets_by_group
                    .entry(dataset.group_id.as_str())
                    .or_default()
                    .push(dataset.id.as_str());
            }
        }
        let usage = self.sample_usage(&datasets);

        let mut rows = Vec::new();
        let mut missing = Vec::new();
        for group in &groups {
            if let Some(wanted) = &wanted {
                if !wanted.contains(group.id.as_str()) {
                    continue;
                }
            }
            let group_datasets = datasets_by_group
                .get(group.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let Some(samples) = self.snapshots.load_samples(&group.id) else {
                let mut row = placeholder_row(group, group_datasets.len());
                row.missing_sample = true;
                rows.push(row);
                missing.push(group.id.clone());
                continue;
            };

            if samples.is_empty() {
                rows.push(placeholder_row(group, group_datasets.len()));
                continue;
            }

            let mut seen: HashSet<String> = HashSet::new();
            for sample in samples {
                if sample.id.is_empty() || !seen.insert(sample.id.clone()) {
                    continue;
                }
                let mut row = base_row(group, group_datasets.len());
                row.sample_id = sample.id.clone();
                row.sample_name = sample.names.first().cloned().unwrap_or_default();
                row.name_key = normalize_sample_name(&row.sample_name);
                row.sample_names = sample.names;
                row.composition = sample.composition;
                row.description = sample.description;
                row.tags = sample.tags;
                row.reference_url = sample.reference_url;
                row.set_links(tile_links(&sample.id, &usage, &datasets_by_id, group));
                rows.push(row);
            }

            // Tiles of this subgroup's datasets may reference samples the
            // snapshot does not know yet.
            let mut unresolved = false;
            for dataset_id in group_datasets {
                for sample_id in usage_order(&usage, dataset_id) {
                    if !seen.insert(sample_id.clone()) {
                        continue;
                    }
                    let mut row = base_row(group, group_datasets.len());
                    row.sample_id = sample_id.clone();
                    row.missing_sample = true;
                    row.set_links(tile_links(&sample_id, &usage, &datasets_by_id, group));
                    rows.push(row);
                    unresolved = true;
                }
            }
            if unresolved {
                missing.push(group.id.clone());
            }
        }

        tracing::debug!(rows = rows.len(), missing = missing.len(), "aggregated sample rows");
        Ok(Aggregation {
            columns: default_columns(),
            rows,
            missing,
        })
    }

    fn sample_usage(&self, datasets: &[DatasetInfo]) -> Usage {
        let mut usage = Usage::default();
        for dataset in datasets {
            for entry in self.snapshots.load_data_entries(&dataset.id) {
                for sample_id in &entry.sample_ids {
                    let refs = usage.by_sample.entry(sample_id.clone()).or_default();
                    if !entry.id.is_empty() && refs.iter().any(|r| r.data_entry_id == entry.id) {
                        continue;
                    }
                    refs.push(TileRef {
                        data_entry_id: entry.id.clone(),
                        data_entry_name: entry.name.clone(),
                        dataset_id: dataset.id.clone(),
                    });
                    let seen = usage.by_dataset.entry(dataset.id.clone()).or_default();
                    if !seen.contains(sample_id) {
                        seen.push(sample_id.clone());
                    }
                }
            }
        }
        usage
    }
}

#[derive(Default)]
struct Usage {
    by_sample: HashMap<String, Vec<TileRef>>,
    by_dataset: HashMap<String, Vec<String>>,
}

fn usage_order(usage: &Usage, dataset_id: &str) -> Vec<String> {
    usage.by_dataset.get(dataset_id).cloned().unwrap_or_default()
}

fn tile_links(
    sample_id: &str,
    usage: &Usage,
    datasets_by_id: &HashMap<&str, &DatasetInfo>,
    group: &SubgroupInfo,
) -> Vec<TileLink> {
    let Some(refs) = usage.by_sample.get(sample_id) else {
        return Vec::new();
    };
    refs.iter()
        .map(|tile| {
            let dataset = datasets_by_id.get(tile.dataset_id.as_str());
            let dataset_name = dataset
                .map(|d| d.name.as_str())
                .filter(|name| !name.is_empty())
                .unwrap_or(tile.dataset_id.as_str());
            let grants = match dataset {
                Some(d) if !d.grants.is_empty() => d.grants.clone(),
                _ => group.grants.clone(),
            };
            TileLink::new(
                &tile.data_entry_id,
                &tile.data_entry_name,
                &tile.dataset_id,
                dataset_name,
                grants,
            )
        })
        .collect()
}

fn base_row(group: &SubgroupInfo, subgroup_dataset_count: usize) -> SampleRow {
    SampleRow {
        subgroup_id: group.id.clone(),
        subgroup_name: group.name.clone(),
        subgroup_description: group.description.clone(),
        subgroup_dataset_count,
        ..SampleRow::default()
    }
}

fn placeholder_row(group: &SubgroupInfo, subgroup_dataset_count: usize) -> SampleRow {
    let mut row = base_row(group, subgroup_dataset_count);
    row.grant_numbers = group.grants.clone();
    row.recompute_counts();
    row
}
