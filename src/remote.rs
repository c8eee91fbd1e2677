use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::Value;

use crate::config::DEFAULT_MATERIAL_API_BASE;
use crate::error::ListingError;
use crate::snapshot::SnapshotStore;

pub const TOKEN_ENV: &str = "SAMPLE_LISTING_TOKEN";

/// Source of raw per-subgroup sample records.
pub trait RemoteSampleSource: Send + Sync {
    fn fetch_samples(&self, subgroup_id: &str) -> Result<Value, ListingError>;

    /// Fetches every subgroup in turn and stores the payload as the local
    /// sample snapshot. A failing subgroup never stops the others.
    fn fetch_missing(&self, subgroup_ids: &[String], snapshots: &SnapshotStore) -> FetchReport {
        let mut report = FetchReport::default();
        for subgroup_id in subgroup_ids {
            let outcome = self
                .fetch_samples(subgroup_id)
                .and_then(|payload| snapshots.write_samples(subgroup_id, &payload));
            match outcome {
                Ok(()) => report.succeeded.push(subgroup_id.clone()),
                Err(err) => {
                    tracing::warn!(subgroup = %subgroup_id, error = %err, "sample fetch failed");
                    report.failed.push(FailedFetch {
                        subgroup_id: subgroup_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFetch {
    pub subgroup_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedFetch>,
}

impl FetchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn message(&self) -> String {
        if self.total() == 0 {
            return "no subgroups to fetch".to_string();
        }
        format!(
            "sample fetch finished: succeeded={}, failed={}, total={}",
            self.succeeded.len(),
            self.failed.len(),
            self.total()
        )
    }
}

#[derive(Clone)]
pub struct MaterialHttpClient {
    client: Client,
    base_url: String,
}

impl MaterialHttpClient {
    pub fn new(base_url: Option<&str>) -> Result<Self, ListingError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sample-listing/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ListingError::MaterialHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.api+json"));

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| ListingError::MaterialHttp(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ListingError::MaterialHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_MATERIAL_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn samples_url(&self) -> String {
        format!("{}/samples", self.base_url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, ListingError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(ListingError::MaterialHttp(err.to_string()));
                }
            }
        }
    }
}

impl RemoteSampleSource for MaterialHttpClient {
    fn fetch_samples(&self, subgroup_id: &str) -> Result<Value, ListingError> {
        let url = self.samples_url();
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[
                ("groupId", subgroup_id),
                ("page[limit]", "1000"),
                ("page[offset]", "0"),
            ])
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "sample request failed".to_string());
            return Err(ListingError::MaterialStatus { status, message });
        }

        let payload: Value = response
            .json()
            .map_err(|err| ListingError::MaterialHttp(err.to_string()))?;
        tracing::debug!(subgroup = %subgroup_id, "fetched sample snapshot");
        Ok(payload)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
