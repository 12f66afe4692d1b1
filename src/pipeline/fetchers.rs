//! Fact fetchers.
//!
//! Each fetcher declares which context fields it needs (`ready`) and runs
//! its network call as a moderate-lane job when they are present. Only
//! the handful of fields processors use are parsed; everything is
//! optional.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::context::SiteContext;
use super::events::{FactData, FactKind};
use crate::error::{FetchError, JobError};
use crate::fetch::{FetchOptions, Fetcher};

#[async_trait]
pub trait FactFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> FactKind;

    /// Whether the context carries what this fetcher needs.
    fn ready(&self, context: &SiteContext) -> bool;

    /// `Ok(None)` means the fact does not exist for this site.
    async fn fetch(&self, context: &SiteContext) -> Result<Option<FactData>, JobError>;
}

// =============================================================================
// siteinfo
// =============================================================================

/// General info and statistics from `meta=siteinfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteInfo {
    /// The request URL, used as provenance.
    pub source_url: String,
    pub site_name: Option<String>,
    pub generator: Option<String>,
    /// MediaWiki version parsed from `generator`.
    pub version: Option<String>,
    pub pages: Option<u64>,
    pub articles: Option<u64>,
    pub edits: Option<u64>,
    pub users: Option<u64>,
    pub active_users: Option<u64>,
}

#[derive(Deserialize)]
struct SiteInfoResponse {
    query: Option<SiteInfoQuery>,
}

#[derive(Deserialize)]
struct SiteInfoQuery {
    #[serde(default)]
    general: Option<SiteInfoGeneral>,
    #[serde(default)]
    statistics: Option<SiteInfoStatistics>,
}

#[derive(Deserialize)]
struct SiteInfoGeneral {
    sitename: Option<String>,
    generator: Option<String>,
}

#[derive(Deserialize)]
struct SiteInfoStatistics {
    pages: Option<u64>,
    articles: Option<u64>,
    edits: Option<u64>,
    users: Option<u64>,
    activeusers: Option<u64>,
}

/// `MediaWiki 1.41.0` → `1.41.0`.
pub fn mediawiki_version(generator: &str) -> Option<String> {
    let version = generator.trim().strip_prefix("MediaWiki")?.trim();
    let version = version.split_whitespace().next()?;
    if version.chars().next()?.is_ascii_digit() {
        Some(version.to_string())
    } else {
        None
    }
}

pub fn parse_siteinfo(source_url: &str, body: &str) -> Result<SiteInfo, JobError> {
    let response: SiteInfoResponse = serde_json::from_str(body)
        .map_err(|e| JobError::DataShape(format!("siteinfo from {}: {}", source_url, e)))?;
    let query = response
        .query
        .ok_or_else(|| JobError::DataShape(format!("siteinfo from {} has no 'query'", source_url)))?;

    let mut info = SiteInfo {
        source_url: source_url.to_string(),
        ..SiteInfo::default()
    };
    if let Some(general) = query.general {
        info.version = general.generator.as_deref().and_then(mediawiki_version);
        info.site_name = general.sitename.filter(|s| !s.trim().is_empty());
        info.generator = general.generator;
    }
    if let Some(stats) = query.statistics {
        info.pages = stats.pages;
        info.articles = stats.articles;
        info.edits = stats.edits;
        info.users = stats.users;
        info.active_users = stats.activeusers;
    }
    Ok(info)
}

pub struct SiteInfoFetcher {
    fetcher: Arc<Fetcher>,
}

impl SiteInfoFetcher {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FactFetcher for SiteInfoFetcher {
    fn name(&self) -> &'static str {
        "siteinfo"
    }

    fn kind(&self) -> FactKind {
        FactKind::SiteInfo
    }

    fn ready(&self, context: &SiteContext) -> bool {
        context.action_api.is_some()
    }

    async fn fetch(&self, context: &SiteContext) -> Result<Option<FactData>, JobError> {
        let Some(api) = context.action_api.as_deref() else {
            return Ok(None);
        };
        let url = url::Url::parse_with_params(
            api,
            &[
                ("action", "query"),
                ("meta", "siteinfo"),
                ("siprop", "general|statistics"),
                ("format", "json"),
            ],
        )
        .map_err(|_| FetchError::InvalidUrl(api.to_string()))?;

        let response = self
            .fetcher
            .fetch_cached(url.as_str(), &FetchOptions::get())
            .await?
            .error_for_status()?;
        let info = parse_siteinfo(url.as_str(), &response.body)?;
        Ok(Some(FactData::SiteInfo(info)))
    }
}

// =============================================================================
// Wikibase manifest
// =============================================================================

/// Path of the Wikibase manifest below `rest.php`.
pub const MANIFEST_PATH: &str = "/wikibase-manifest/v0/manifest";

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub url: String,
    pub name: Option<String>,
    pub root_script_url: Option<String>,
}

#[derive(Deserialize)]
struct ManifestResponse {
    name: Option<String>,
    root_script_url: Option<String>,
}

pub struct ManifestFetcher {
    fetcher: Arc<Fetcher>,
}

impl ManifestFetcher {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FactFetcher for ManifestFetcher {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn kind(&self) -> FactKind {
        FactKind::Manifest
    }

    fn ready(&self, context: &SiteContext) -> bool {
        context.rest_api.is_some()
    }

    async fn fetch(&self, context: &SiteContext) -> Result<Option<FactData>, JobError> {
        let Some(rest) = context.rest_api.as_deref() else {
            return Ok(None);
        };
        let url = format!("{}{}", rest.trim_end_matches('/'), MANIFEST_PATH);
        let response = self.fetcher.fetch_cached(&url, &FetchOptions::get()).await?;
        // No manifest extension: not a Wikibase
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let parsed: ManifestResponse = response
            .json()
            .map_err(|e| JobError::DataShape(e.to_string()))?;
        Ok(Some(FactData::Manifest(Manifest {
            url,
            name: parsed.name,
            root_script_url: parsed.root_script_url,
        })))
    }
}

// =============================================================================
// Reverse DNS
// =============================================================================

const DNS_TYPE_A: u16 = 1;
const DNS_TYPE_PTR: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub ip: Ipv4Addr,
    /// PTR name without the trailing dot.
    pub ptr: Option<String>,
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    kind: u16,
    data: String,
}

/// `1.2.3.4` → `4.3.2.1.in-addr.arpa`.
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
}

/// Resolves the site's A records, then each address's PTR name, over
/// DNS-over-HTTPS (JSON API).
pub struct ReverseDnsFetcher {
    fetcher: Arc<Fetcher>,
    resolver_url: String,
}

impl ReverseDnsFetcher {
    pub fn new(fetcher: Arc<Fetcher>, resolver_url: &str) -> Self {
        Self {
            fetcher,
            resolver_url: resolver_url.to_string(),
        }
    }

    async fn query(&self, name: &str, kind: &str, wanted: u16) -> Result<Vec<String>, JobError> {
        let url = url::Url::parse_with_params(&self.resolver_url, &[("name", name), ("type", kind)])
            .map_err(|_| FetchError::InvalidUrl(self.resolver_url.clone()))?;
        let options = FetchOptions::get().header("Accept", "application/dns-json");
        let response = self
            .fetcher
            .fetch_cached(url.as_str(), &options)
            .await?
            .error_for_status()?;
        let parsed: DohResponse = response
            .json()
            .map_err(|e| JobError::DataShape(e.to_string()))?;
        Ok(parsed
            .answer
            .into_iter()
            .filter(|a| a.kind == wanted)
            .map(|a| a.data)
            .collect())
    }
}

#[async_trait]
impl FactFetcher for ReverseDnsFetcher {
    fn name(&self) -> &'static str {
        "reverse_dns"
    }

    fn kind(&self) -> FactKind {
        FactKind::ReverseDns
    }

    fn ready(&self, context: &SiteContext) -> bool {
        !context.domain.is_empty()
    }

    async fn fetch(&self, context: &SiteContext) -> Result<Option<FactData>, JobError> {
        let mut ips: Vec<Ipv4Addr> = self
            .query(&context.domain, "A", DNS_TYPE_A)
            .await?
            .iter()
            .filter_map(|data| data.parse().ok())
            .collect();
        ips.sort();
        ips.dedup();
        if ips.is_empty() {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(ips.len());
        for ip in ips {
            // A missing PTR is normal; a failed lookup only loses the name
            let ptr = match self.query(&reverse_name(ip), "PTR", DNS_TYPE_PTR).await {
                Ok(names) => names
                    .into_iter()
                    .next()
                    .map(|n| n.trim_end_matches('.').to_string()),
                Err(e) => {
                    log::debug!("ReverseDns: PTR lookup for {} failed: {}", ip, e);
                    None
                }
            };
            records.push(DnsRecord { ip, ptr });
        }
        Ok(Some(FactData::ReverseDns(records)))
    }
}
