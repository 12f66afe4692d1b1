//! Discovery sources.
//!
//! Every source yields a flat list of candidate sites; the pipeline treats
//! them all the same once the list exists.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::fetch::{FetchOptions, Fetcher};

/// A candidate site, optionally already linked to its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSite {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl DiscoveredSite {
    pub fn new(url: &str, record_id: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            record_id: record_id.map(str::to_string),
        }
    }

    /// Key used to drop duplicates across sources: scheme and trailing
    /// slash are ignored.
    pub fn dedup_key(&self) -> String {
        let trimmed = self
            .url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        trimmed.to_ascii_lowercase()
    }
}

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<DiscoveredSite>, FetchError>;
}

/// Fixed list, usually from config.
pub struct StaticSource {
    sites: Vec<DiscoveredSite>,
}

impl StaticSource {
    pub fn new(sites: Vec<DiscoveredSite>) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> Result<Vec<DiscoveredSite>, FetchError> {
        Ok(self.sites.clone())
    }
}

/// Runs a configured SPARQL query selecting `?item` and `?url`.
pub struct QueryServiceSource {
    endpoint: String,
    query: String,
    fetcher: Arc<Fetcher>,
}

impl QueryServiceSource {
    pub fn new(endpoint: &str, query: &str, fetcher: Arc<Fetcher>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            query: query.to_string(),
            fetcher,
        }
    }
}

#[async_trait]
impl DiscoverySource for QueryServiceSource {
    fn name(&self) -> &str {
        "query-service"
    }

    async fn discover(&self) -> Result<Vec<DiscoveredSite>, FetchError> {
        let url = url::Url::parse_with_params(
            &self.endpoint,
            &[("query", self.query.as_str()), ("format", "json")],
        )
        .map_err(|_| FetchError::InvalidUrl(self.endpoint.clone()))?;
        let options = FetchOptions::get().header("Accept", "application/sparql-results+json");

        let response = self
            .fetcher
            .fetch(url.as_str(), &options)
            .await?
            .error_for_status()?;
        let body: Value = response.json()?;
        Ok(parse_bindings(&body))
    }
}

/// Rows without a `url` binding are skipped; `item` is optional and
/// reduced from an entity URI to its id.
pub fn parse_bindings(body: &Value) -> Vec<DiscoveredSite> {
    let Some(rows) = body.pointer("/results/bindings").and_then(Value::as_array) else {
        log::warn!("Discovery: query service response has no bindings");
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let url = row.pointer("/url/value")?.as_str()?;
            let record_id = row
                .pointer("/item/value")
                .and_then(Value::as_str)
                .and_then(|uri| uri.rsplit('/').next())
                .filter(|id| !id.is_empty());
            Some(DiscoveredSite::new(url, record_id))
        })
        .collect()
}
