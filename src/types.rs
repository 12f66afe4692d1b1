use serde::{Deserialize, Deserializer, Serialize};

use crate::pipeline::discovery::DiscoveredSite;

/// Configuration stored in ~/.worldsync/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub properties: PropertyConfig,
    /// Minimum |log10(new) - log10(old)| before a counter claim is rewritten.
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,
    /// DNS-over-HTTPS JSON endpoint used for reverse-DNS facts.
    #[serde(default = "default_dns_over_https_url")]
    pub dns_over_https_url: String,
    #[serde(default = "default_quiescence_poll_ms")]
    pub quiescence_poll_ms: u64,
    /// Log intended writes instead of performing them.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_significance_threshold() -> f64 {
    crate::engine::significance::DEFAULT_SIGNIFICANCE_THRESHOLD
}

fn default_dns_over_https_url() -> String {
    "https://dns.google/resolve".to_string()
}

fn default_quiescence_poll_ms() -> u64 {
    crate::queue::QUIESCENCE_POLL_INTERVAL.as_millis() as u64
}

// =============================================================================
// Record store
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// MediaWiki action API of the Wikibase, e.g. https://example.org/w/api.php
    pub api_url: String,
    /// OAuth 2 owner-only access token. `WORLDSYNC_TOKEN` takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_summary_prefix")]
    pub summary_prefix: String,
    #[serde(default = "default_maxlag")]
    pub maxlag: u32,
}

fn default_summary_prefix() -> String {
    "worldsync".to_string()
}

fn default_maxlag() -> u32 {
    5
}

// =============================================================================
// Queues
// =============================================================================

/// Concurrency per lane. Missing, non-positive or non-numeric values fall
/// back to the defaults (bulk 4, moderate 2, serial 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default, deserialize_with = "lenient_limit")]
    pub bulk_concurrency: Option<i64>,
    #[serde(default, deserialize_with = "lenient_limit")]
    pub moderate_concurrency: Option<i64>,
    #[serde(default, deserialize_with = "lenient_limit")]
    pub serial_concurrency: Option<i64>,
}

pub const DEFAULT_BULK_CONCURRENCY: usize = 4;
pub const DEFAULT_MODERATE_CONCURRENCY: usize = 2;
pub const DEFAULT_SERIAL_CONCURRENCY: usize = 1;

impl QueueConfig {
    pub fn bulk(&self) -> usize {
        positive_or(self.bulk_concurrency, DEFAULT_BULK_CONCURRENCY)
    }

    pub fn moderate(&self) -> usize {
        positive_or(self.moderate_concurrency, DEFAULT_MODERATE_CONCURRENCY)
    }

    pub fn serial(&self) -> usize {
        positive_or(self.serial_concurrency, DEFAULT_SERIAL_CONCURRENCY)
    }
}

fn positive_or(value: Option<i64>, default: usize) -> usize {
    match value {
        Some(v) if v > 0 => v as usize,
        _ => default,
    }
}

/// Parse a concurrency limit from a number or numeric string. Anything
/// else becomes None rather than failing the whole config.
pub fn parse_limit(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_limit<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_limit(&value))
}

// =============================================================================
// Fetch layer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default = "default_cache_max_age_hours")]
    pub cache_max_age_hours: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            cache_enabled: true,
            cache_dir: None,
            cache_max_age_hours: default_cache_max_age_hours(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    crate::fetch::REQUEST_TIMEOUT.as_secs()
}

fn default_rate_limit_backoff_secs() -> u64 {
    crate::fetch::RATE_LIMIT_BACKOFF.as_secs()
}

fn default_cache_max_age_hours() -> i64 {
    24
}

fn default_user_agent() -> String {
    format!("worldsync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Discovery
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Sites checked on every run.
    #[serde(default)]
    pub sites: Vec<DiscoveredSite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_service: Option<QueryServiceConfig>,
}

/// SPARQL endpoint plus a ready-made query selecting `?item` and `?url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryServiceConfig {
    pub endpoint: String,
    pub query: String,
}

// =============================================================================
// Property mapping
// =============================================================================

/// Property ids in the target Wikibase. A fact whose property is not
/// configured is fetched but never written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_count: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_count: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_in_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "store": { "apiUrl": "https://kb.example/w/api.php" } }"#)
                .unwrap();
        assert_eq!(config.queues.bulk(), 4);
        assert_eq!(config.queues.moderate(), 2);
        assert_eq!(config.queues.serial(), 1);
        assert_eq!(config.fetch.timeout_secs, 20);
        assert_eq!(config.fetch.rate_limit_backoff_secs, 10);
        assert!(config.fetch.cache_enabled);
        assert_eq!(config.store.summary_prefix, "worldsync");
        assert!(!config.dry_run);
        assert!((config.significance_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_queue_limits_fall_back() {
        let config: Config = serde_json::from_str(
            r#"{
                "store": { "apiUrl": "https://kb.example/w/api.php" },
                "queues": { "bulkConcurrency": "8", "moderateConcurrency": "lots", "serialConcurrency": -1 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.queues.bulk(), 8);
        assert_eq!(config.queues.moderate(), 2);
        assert_eq!(config.queues.serial(), 1);
    }

    #[test]
    fn test_discovery_sites_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "store": { "apiUrl": "https://kb.example/w/api.php" },
                "discovery": { "sites": [ { "url": "https://wiki.example/", "recordId": "Q7" } ] },
                "properties": { "pageCount": "P62" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.discovery.sites.len(), 1);
        assert_eq!(config.discovery.sites[0].record_id.as_deref(), Some("Q7"));
        assert_eq!(config.properties.page_count.as_deref(), Some("P62"));
        assert!(config.properties.edit_count.is_none());
    }
}
