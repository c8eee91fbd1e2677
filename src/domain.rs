use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ListingError;

pub const DATASET_PAGE_URL: &str = "https://rde.nims.go.jp/rde/datasets/{id}";
pub const DATA_ENTRY_PAGE_URL: &str = "https://rde.nims.go.jp/rde/datasets/data/{id}";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("literal regex"));
static NAME_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\-_/\\.]+").expect("literal regex"));

/// Identity of a listing row. An empty `sample_id` marks the subgroup-level
/// placeholder row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub subgroup_id: String,
    pub sample_id: String,
}

impl RowKey {
    pub fn new(subgroup_id: impl Into<String>, sample_id: impl Into<String>) -> Self {
        Self {
            subgroup_id: subgroup_id.into(),
            sample_id: sample_id.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.sample_id.is_empty()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subgroup_id, self.sample_id)
    }
}

impl FromStr for RowKey {
    type Err = ListingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (subgroup, sample) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| ListingError::InvalidRowKey(value.to_string()))?;
        let subgroup = subgroup.trim();
        if subgroup.is_empty() {
            return Err(ListingError::InvalidRowKey(value.to_string()));
        }
        Ok(Self::new(subgroup, sample.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKey {
    SubgroupName,
    SampleName,
    TileDatasetGrant,
    DataEntryCount,
    DatasetCount,
    GrantCount,
    GrantNumbers,
    SubgroupId,
    SampleId,
    DatasetIds,
    DataEntryIds,
    SubgroupDescription,
    DatasetNames,
    DataEntryNames,
    SubgroupDatasetCount,
    SampleNames,
    Composition,
    Description,
    Tags,
    ReferenceUrl,
    NameKey,
}

impl ColumnKey {
    pub const ALL: [ColumnKey; 21] = [
        ColumnKey::SubgroupName,
        ColumnKey::SampleName,
        ColumnKey::TileDatasetGrant,
        ColumnKey::DataEntryCount,
        ColumnKey::DatasetCount,
        ColumnKey::GrantCount,
        ColumnKey::GrantNumbers,
        ColumnKey::SubgroupId,
        ColumnKey::SampleId,
        ColumnKey::DatasetIds,
        ColumnKey::DataEntryIds,
        ColumnKey::SubgroupDescription,
        ColumnKey::DatasetNames,
        ColumnKey::DataEntryNames,
        ColumnKey::SubgroupDatasetCount,
        ColumnKey::SampleNames,
        ColumnKey::Composition,
        ColumnKey::Description,
        ColumnKey::Tags,
        ColumnKey::ReferenceUrl,
        ColumnKey::NameKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKey::SubgroupName => "subgroup_name",
            ColumnKey::SampleName => "sample_name",
            ColumnKey::TileDatasetGrant => "tile_dataset_grant",
            ColumnKey::DataEntryCount => "data_entry_count",
            ColumnKey::DatasetCount => "dataset_count",
            ColumnKey::GrantCount => "grant_count",
            ColumnKey::GrantNumbers => "grant_numbers",
            ColumnKey::SubgroupId => "subgroup_id",
            ColumnKey::SampleId => "sample_id",
            ColumnKey::DatasetIds => "dataset_ids",
            ColumnKey::DataEntryIds => "data_entry_ids",
            ColumnKey::SubgroupDescription => "subgroup_description",
            ColumnKey::DatasetNames => "dataset_names",
            ColumnKey::DataEntryNames => "data_entry_names",
            ColumnKey::SubgroupDatasetCount => "subgroup_dataset_count",
            ColumnKey::SampleNames => "sample_names",
            ColumnKey::Composition => "composition",
            ColumnKey::Description => "description",
            ColumnKey::Tags => "tags",
            ColumnKey::ReferenceUrl => "reference_url",
            ColumnKey::NameKey => "name_key",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ColumnKey::SubgroupName => "Subgroup",
            ColumnKey::SampleName => "Sample",
            ColumnKey::TileDatasetGrant => "Tile - Dataset - Grant",
            ColumnKey::DataEntryCount => "Tiles",
            ColumnKey::DatasetCount => "Datasets",
            ColumnKey::GrantCount => "Grants",
            ColumnKey::GrantNumbers => "Grant numbers",
            ColumnKey::SubgroupId => "Subgroup UUID",
            ColumnKey::SampleId => "Sample UUID",
            ColumnKey::DatasetIds => "Dataset UUIDs",
            ColumnKey::DataEntryIds => "Tile UUIDs",
            ColumnKey::SubgroupDescription => "Subgroup description",
            ColumnKey::DatasetNames => "Dataset names",
            ColumnKey::DataEntryNames => "Tile names",
            ColumnKey::SubgroupDatasetCount => "Datasets in subgroup",
            ColumnKey::SampleNames => "Aliases",
            ColumnKey::Composition => "Composition",
            ColumnKey::Description => "Description",
            ColumnKey::Tags => "Tags",
            ColumnKey::ReferenceUrl => "Reference URL",
            ColumnKey::NameKey => "Name key",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            ColumnKey::DataEntryCount
            | ColumnKey::DatasetCount
            | ColumnKey::GrantCount
            | ColumnKey::SubgroupDatasetCount => ColumnKind::Numeric,
            _ => ColumnKind::Text,
        }
    }

    pub fn default_visible(self) -> bool {
        matches!(
            self,
            ColumnKey::SubgroupName
                | ColumnKey::SampleName
                | ColumnKey::TileDatasetGrant
                | ColumnKey::DataEntryCount
                | ColumnKey::DatasetCount
                | ColumnKey::GrantCount
                | ColumnKey::SubgroupId
                | ColumnKey::SampleId
                | ColumnKey::DatasetIds
                | ColumnKey::DataEntryIds
        )
    }

    /// Columns backed by the positionally aligned per-tile lists.
    pub fn is_aligned_group(self) -> bool {
        matches!(
            self,
            ColumnKey::TileDatasetGrant
                | ColumnKey::DatasetIds
                | ColumnKey::DatasetNames
                | ColumnKey::DataEntryIds
                | ColumnKey::DataEntryNames
        )
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ColumnKey {
    type Err = ListingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        ColumnKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| ListingError::UnknownColumn(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub key: ColumnKey,
    pub label: String,
    pub default_visible: bool,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(key: ColumnKey) -> Self {
        Self {
            key,
            label: key.label().to_string(),
            default_visible: key.default_visible(),
            kind: key.kind(),
        }
    }
}

pub fn default_columns() -> Vec<ColumnSpec> {
    ColumnKey::ALL.into_iter().map(ColumnSpec::new).collect()
}

/// One tile reference of a sample: tile -> dataset -> grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLink {
    pub data_entry_id: String,
    pub data_entry_name: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub grants: Vec<String>,
    pub tile_url: String,
    pub dataset_url: String,
}

impl TileLink {
    pub fn new(
        data_entry_id: &str,
        data_entry_name: &str,
        dataset_id: &str,
        dataset_name: &str,
        grants: Vec<String>,
    ) -> Self {
        let tile_url = if data_entry_id.is_empty() {
            String::new()
        } else {
            DATA_ENTRY_PAGE_URL.replace("{id}", data_entry_id)
        };
        let dataset_url = if dataset_id.is_empty() {
            String::new()
        } else {
            DATASET_PAGE_URL.replace("{id}", dataset_id)
        };
        Self {
            data_entry_id: data_entry_id.to_string(),
            data_entry_name: data_entry_name.to_string(),
            dataset_id: dataset_id.to_string(),
            dataset_name: dataset_name.to_string(),
            grants,
            tile_url,
            dataset_url,
        }
    }

    pub fn display_line(&self) -> String {
        if self.grants.is_empty() {
            format!("{} - {}", self.data_entry_name, self.dataset_name)
        } else {
            format!(
                "{} - {} - {}",
                self.data_entry_name,
                self.dataset_name,
                self.grants.join(" / ")
            )
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleRow {
    pub subgroup_id: String,
    pub subgroup_name: String,
    pub subgroup_description: String,
    pub sample_id: String,
    pub sample_name: String,
    pub sample_names: Vec<String>,
    pub composition: String,
    pub description: String,
    pub tags: Vec<String>,
    pub reference_url: String,
    pub name_key: String,
    pub dataset_ids: Vec<String>,
    pub dataset_names: Vec<String>,
    pub data_entry_ids: Vec<String>,
    pub data_entry_names: Vec<String>,
    pub tile_dataset_grant_links: Vec<TileLink>,
    pub grant_numbers: Vec<String>,
    pub dataset_count: usize,
    pub data_entry_count: usize,
    pub grant_count: usize,
    pub subgroup_dataset_count: usize,
    pub missing_sample: bool,
}

impl SampleRow {
    pub fn key(&self) -> RowKey {
        RowKey::new(self.subgroup_id.clone(), self.sample_id.clone())
    }

    pub fn matches_key(&self, key: &RowKey) -> bool {
        self.subgroup_id == key.subgroup_id && self.sample_id == key.sample_id
    }

    /// Replaces the aligned per-tile lists in one step and recomputes the
    /// counts derived from them.
    pub fn set_links(&mut self, links: Vec<TileLink>) {
        self.dataset_ids = links.iter().map(|l| l.dataset_id.clone()).collect();
        self.dataset_names = links.iter().map(|l| l.dataset_name.clone()).collect();
        self.data_entry_ids = links.iter().map(|l| l.data_entry_id.clone()).collect();
        self.data_entry_names = links.iter().map(|l| l.data_entry_name.clone()).collect();
        self.tile_dataset_grant_links = links;
        self.recompute_counts();
    }

    pub fn recompute_counts(&mut self) {
        self.dataset_count = distinct_non_empty(&self.dataset_ids).len();
        self.data_entry_count = distinct_non_empty(&self.data_entry_ids).len();
        let mut grants = distinct_non_empty(
            &self
                .tile_dataset_grant_links
                .iter()
                .flat_map(|link| link.grants.iter().cloned())
                .collect::<Vec<_>>(),
        );
        if grants.is_empty() {
            grants = distinct_non_empty(&self.grant_numbers);
        }
        grants.sort();
        self.grant_count = grants.len();
        self.grant_numbers = grants;
    }

    pub fn is_aligned(&self) -> bool {
        let n = self.tile_dataset_grant_links.len();
        if self.dataset_ids.len() != n
            || self.dataset_names.len() != n
            || self.data_entry_ids.len() != n
            || self.data_entry_names.len() != n
        {
            return false;
        }
        self.tile_dataset_grant_links
            .iter()
            .enumerate()
            .all(|(i, link)| {
                link.dataset_id == self.dataset_ids[i] && link.data_entry_id == self.data_entry_ids[i]
            })
    }

    /// String rendering of one cell, shared by the view layer and the filters.
    pub fn cell(&self, column: ColumnKey) -> String {
        match column {
            ColumnKey::SubgroupName => self.subgroup_name.clone(),
            ColumnKey::SampleName => self.sample_name.clone(),
            ColumnKey::TileDatasetGrant => self
                .tile_dataset_grant_links
                .iter()
                .map(TileLink::display_line)
                .collect::<Vec<_>>()
                .join("\n"),
            ColumnKey::DataEntryCount => self.data_entry_count.to_string(),
            ColumnKey::DatasetCount => self.dataset_count.to_string(),
            ColumnKey::GrantCount => self.grant_count.to_string(),
            ColumnKey::GrantNumbers => self.grant_numbers.join("\n"),
            ColumnKey::SubgroupId => self.subgroup_id.clone(),
            ColumnKey::SampleId => self.sample_id.clone(),
            ColumnKey::DatasetIds => self.dataset_ids.join("\n"),
            ColumnKey::DataEntryIds => self.data_entry_ids.join("\n"),
            ColumnKey::SubgroupDescription => self.subgroup_description.clone(),
            ColumnKey::DatasetNames => self.dataset_names.join("\n"),
            ColumnKey::DataEntryNames => self.data_entry_names.join("\n"),
            ColumnKey::SubgroupDatasetCount => self.subgroup_dataset_count.to_string(),
            ColumnKey::SampleNames => self.sample_names.join("\n"),
            ColumnKey::Composition => self.composition.clone(),
            ColumnKey::Description => self.description.clone(),
            ColumnKey::Tags => self.tags.join("\n"),
            ColumnKey::ReferenceUrl => self.reference_url.clone(),
            ColumnKey::NameKey => self.name_key.clone(),
        }
    }

    /// Copies the field(s) backing `column` from `other`. Aligned columns
    /// copy the whole per-tile group so the lists never drift apart.
    pub fn assign_column(&mut self, column: ColumnKey, other: &SampleRow) {
        if column.is_aligned_group() {
            self.dataset_ids = other.dataset_ids.clone();
            self.dataset_names = other.dataset_names.clone();
            self.data_entry_ids = other.data_entry_ids.clone();
            self.data_entry_names = other.data_entry_names.clone();
            self.tile_dataset_grant_links = other.tile_dataset_grant_links.clone();
            return;
        }
        match column {
            ColumnKey::SubgroupName => self.subgroup_name = other.subgroup_name.clone(),
            ColumnKey::SampleName => self.sample_name = other.sample_name.clone(),
            ColumnKey::DataEntryCount => self.data_entry_count = other.data_entry_count,
            ColumnKey::DatasetCount => self.dataset_count = other.dataset_count,
            ColumnKey::GrantCount => self.grant_count = other.grant_count,
            ColumnKey::GrantNumbers => self.grant_numbers = other.grant_numbers.clone(),
            ColumnKey::SubgroupId => self.subgroup_id = other.subgroup_id.clone(),
            ColumnKey::SampleId => self.sample_id = other.sample_id.clone(),
            ColumnKey::SubgroupDescription => {
                self.subgroup_description = other.subgroup_description.clone()
            }
            ColumnKey::SubgroupDatasetCount => {
                self.subgroup_dataset_count = other.subgroup_dataset_count
            }
            ColumnKey::SampleNames => self.sample_names = other.sample_names.clone(),
            ColumnKey::Composition => self.composition = other.composition.clone(),
            ColumnKey::Description => self.description = other.description.clone(),
            ColumnKey::Tags => self.tags = other.tags.clone(),
            ColumnKey::ReferenceUrl => self.reference_url = other.reference_url.clone(),
            ColumnKey::NameKey => self.name_key = other.name_key.clone(),
            ColumnKey::TileDatasetGrant
            | ColumnKey::DatasetIds
            | ColumnKey::DatasetNames
            | ColumnKey::DataEntryIds
            | ColumnKey::DataEntryNames => {}
        }
    }
}

pub fn normalize_sample_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let compact = WHITESPACE.replace_all(&lowered, "");
    NAME_PUNCTUATION.replace_all(&compact, "").into_owned()
}

fn distinct_non_empty(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() || out.iter().any(|seen| seen == value) {
            continue;
        }
        out.push(value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_row_key() {
        let key: RowKey = "g1/s1".parse().unwrap();
        assert_eq!(key, RowKey::new("g1", "s1"));
        assert_eq!(key.to_string(), "g1/s1");

        let placeholder: RowKey = "g1/".parse().unwrap();
        assert!(placeholder.is_placeholder());
    }

    #[test]
    fn parse_row_key_invalid() {
        assert_matches!("g1".parse::<RowKey>(), Err(ListingError::InvalidRowKey(_)));
        assert_matches!("/s1".parse::<RowKey>(), Err(ListingError::InvalidRowKey(_)));
    }

    #[test]
    fn parse_column_key() {
        let key: ColumnKey = "Dataset_Count".parse().unwrap();
        assert_eq!(key, ColumnKey::DatasetCount);
        assert_eq!(key.kind(), ColumnKind::Numeric);
        assert_matches!("bogus".parse::<ColumnKey>(), Err(ListingError::UnknownColumn(_)));
    }

    #[test]
    fn name_key_strips_separators() {
        assert_eq!(normalize_sample_name("  Ti-6Al 4V_bar/2.0 "), "ti6al4vbar20");
    }

    #[test]
    fn set_links_keeps_lists_aligned() {
        let mut row = SampleRow::default();
        row.set_links(vec![
            TileLink::new("e1", "tile 1", "d1", "set 1", vec!["G-1".to_string()]),
            TileLink::new("e2", "tile 2", "d1", "set 1", vec!["G-1".to_string()]),
        ]);
        assert!(row.is_aligned());
        assert_eq!(row.dataset_count, 1);
        assert_eq!(row.data_entry_count, 2);
        assert_eq!(row.grant_count, 1);
        assert_eq!(
            row.cell(ColumnKey::TileDatasetGrant),
            "tile 1 - set 1 - G-1\ntile 2 - set 1 - G-1"
        );
    }
}
