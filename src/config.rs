use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{ColumnKey, ColumnSpec, default_columns};
use crate::error::ListingError;

pub const DEFAULT_CONFIG_FILE: &str = "sample-listing.json";
pub const DEFAULT_TTL_SECONDS: u64 = 6 * 60 * 60;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_DATA_ROOT: &str = "output/rde/data";
pub const DEFAULT_MATERIAL_API_BASE: &str = "https://rde-material-api.nims.go.jp";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub cache_path: Option<String>,
    #[serde(default)]
    pub material_api_base: Option<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, bool>,
    #[serde(default)]
    pub auto_fetch_missing: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub ttl: Duration,
    pub page_size: usize,
    pub data_root: Utf8PathBuf,
    pub cache_path: Utf8PathBuf,
    pub material_api_base: String,
    pub columns: Vec<ColumnSpec>,
    pub auto_fetch_missing: bool,
}

impl ResolvedConfig {
    pub fn visible_columns(&self) -> Vec<ColumnKey> {
        self.columns
            .iter()
            .filter(|column| column.default_visible)
            .map(|column| column.key)
            .collect()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ListingError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ListingError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ListingError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ListingError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mut columns = default_columns();
        for (key, visible) in &config.columns {
            let key: ColumnKey = key.parse()?;
            if let Some(column) = columns.iter_mut().find(|column| column.key == key) {
                column.default_visible = *visible;
            }
        }

        let cache_path = match config.cache_path {
            Some(path) => Utf8PathBuf::from(path),
            None => default_cache_path()?,
        };

        Ok(ResolvedConfig {
            schema_version,
            ttl: Duration::from_secs(config.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS)),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            data_root: Utf8PathBuf::from(
                config
                    .data_root
                    .unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string()),
            ),
            cache_path,
            material_api_base: config
                .material_api_base
                .unwrap_or_else(|| DEFAULT_MATERIAL_API_BASE.to_string()),
            columns,
            auto_fetch_missing: config.auto_fetch_missing.unwrap_or(false),
        })
    }
}

pub fn default_cache_path() -> Result<Utf8PathBuf, ListingError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("sample-listing")
                    .join("sample_listing_cache.json"),
            )
            .ok()
        })
        .ok_or_else(|| ListingError::Filesystem("unable to resolve cache directory".to_string()))
}
