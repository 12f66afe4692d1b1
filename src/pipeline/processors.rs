//! Fact processors.
//!
//! A processor turns one fetched fact into zero or more intents. It is a
//! pure function of the context and the payload; submitting the intents
//! is the pipeline's job. A processor whose property is not configured
//! produces nothing.

use chrono::NaiveDate;

use super::context::SiteContext;
use super::events::{FactData, FactKind};
use crate::engine::significance::needs_update;
use crate::engine::{ClaimIntent, TermIntent};
use crate::store::{ClaimValue, Reference, Snak};
use crate::types::PropertyConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Claim(ClaimIntent),
    Term(TermIntent),
}

pub trait FactProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> FactKind;

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent>;
}

fn record_id(context: &SiteContext, processor: &str) -> Option<String> {
    if context.record_id.is_none() {
        log::debug!("{}: {} has no record, skipping", processor, context.domain);
    }
    context.record_id.clone()
}

/// MediaWiki version as a string claim.
pub struct SoftwareVersionProcessor {
    properties: PropertyConfig,
}

impl SoftwareVersionProcessor {
    pub fn new(properties: PropertyConfig) -> Self {
        Self { properties }
    }
}

impl FactProcessor for SoftwareVersionProcessor {
    fn name(&self) -> &'static str {
        "software_version"
    }

    fn kind(&self) -> FactKind {
        FactKind::SiteInfo
    }

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent> {
        let FactData::SiteInfo(info) = data else {
            return Vec::new();
        };
        let (Some(property), Some(version)) = (&self.properties.software_version, &info.version) else {
            return Vec::new();
        };
        let Some(target) = record_id(context, self.name()) else {
            return Vec::new();
        };
        let mut intent = ClaimIntent::new(target, property, ClaimValue::string(version));
        if let Some(reference) = &self.properties.reference_url {
            intent = intent.with_reference(Reference::url(reference, &info.source_url));
        }
        vec![Intent::Claim(intent)]
    }
}

/// Page, edit and user counts, written only when they moved by a
/// significant factor since the stored value.
pub struct StatisticsProcessor {
    properties: PropertyConfig,
    threshold: f64,
    today: Option<NaiveDate>,
}

impl StatisticsProcessor {
    pub fn new(properties: PropertyConfig, threshold: f64) -> Self {
        Self {
            properties,
            threshold,
            today: None,
        }
    }

    /// Pin the point-in-time date instead of using the current day.
    pub fn with_date(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }
}

impl FactProcessor for StatisticsProcessor {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn kind(&self) -> FactKind {
        FactKind::SiteInfo
    }

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent> {
        let FactData::SiteInfo(info) = data else {
            return Vec::new();
        };
        let Some(target) = record_id(context, self.name()) else {
            return Vec::new();
        };
        // The stored values decide significance; without a snapshot every
        // counter would look new.
        let Some(record) = &context.record else {
            log::debug!("statistics: no snapshot of {}, skipping", target);
            return Vec::new();
        };
        let today = self.today.unwrap_or_else(|| chrono::Utc::now().date_naive());

        let counters = [
            (&self.properties.page_count, info.pages),
            (&self.properties.edit_count, info.edits),
            (&self.properties.user_count, info.users),
        ];

        let mut intents = Vec::new();
        for (property, value) in counters {
            let (Some(property), Some(value)) = (property, value) else {
                continue;
            };
            let Ok(amount) = i64::try_from(value) else {
                log::warn!("statistics: {} {} of {} does not fit a quantity, skipping", target, property, value);
                continue;
            };
            let stored = record
                .claims_for(property)
                .iter()
                .find_map(|c| c.value.as_number());
            if !needs_update(stored, value as f64, self.threshold) {
                log::debug!(
                    "statistics: {} {} {:?} -> {} below threshold",
                    target,
                    property,
                    stored,
                    value
                );
                continue;
            }

            let mut intent = ClaimIntent::new(target.clone(), property, ClaimValue::quantity(amount));
            if let Some(point_in_time) = &self.properties.point_in_time {
                intent = intent.with_qualifier(Snak::new(point_in_time, ClaimValue::day(today)));
            }
            if let Some(reference) = &self.properties.reference_url {
                intent = intent.with_reference(Reference::url(reference, &info.source_url));
            }
            intents.push(Intent::Claim(intent));
        }
        intents
    }
}

/// English label from the site name (or page title) when the record has
/// none. An existing label is never overwritten.
pub struct SiteLabelProcessor;

impl FactProcessor for SiteLabelProcessor {
    fn name(&self) -> &'static str {
        "site_label"
    }

    fn kind(&self) -> FactKind {
        FactKind::SiteInfo
    }

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent> {
        let FactData::SiteInfo(info) = data else {
            return Vec::new();
        };
        let Some(name) = info.site_name.as_deref().or(context.title.as_deref()) else {
            return Vec::new();
        };
        let Some(target) = record_id(context, self.name()) else {
            return Vec::new();
        };
        if context
            .record
            .as_ref()
            .is_some_and(|record| record.label("en").is_some())
        {
            return Vec::new();
        }
        vec![Intent::Term(TermIntent::label(&target, "en", name.trim()))]
    }
}

/// Records where a site's Wikibase manifest lives, which marks it as a
/// Wikibase.
pub struct WikibasePresenceProcessor {
    properties: PropertyConfig,
}

impl WikibasePresenceProcessor {
    pub fn new(properties: PropertyConfig) -> Self {
        Self { properties }
    }
}

impl FactProcessor for WikibasePresenceProcessor {
    fn name(&self) -> &'static str {
        "wikibase_presence"
    }

    fn kind(&self) -> FactKind {
        FactKind::Manifest
    }

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent> {
        let FactData::Manifest(manifest) = data else {
            return Vec::new();
        };
        let Some(property) = &self.properties.manifest_url else {
            return Vec::new();
        };
        let Some(target) = record_id(context, self.name()) else {
            return Vec::new();
        };
        vec![Intent::Claim(ClaimIntent::new(
            target,
            property,
            ClaimValue::string(&manifest.url),
        ))]
    }
}

/// Hosting IP address. With several A records the lowest address wins,
/// so repeated runs propose the same value.
pub struct IpAddressProcessor {
    properties: PropertyConfig,
}

impl IpAddressProcessor {
    pub fn new(properties: PropertyConfig) -> Self {
        Self { properties }
    }
}

impl FactProcessor for IpAddressProcessor {
    fn name(&self) -> &'static str {
        "ip_address"
    }

    fn kind(&self) -> FactKind {
        FactKind::ReverseDns
    }

    fn process(&self, context: &SiteContext, data: &FactData) -> Vec<Intent> {
        let FactData::ReverseDns(records) = data else {
            return Vec::new();
        };
        let Some(property) = &self.properties.ip_address else {
            return Vec::new();
        };
        let Some(ip) = records.iter().map(|r| r.ip).min() else {
            return Vec::new();
        };
        let Some(target) = record_id(context, self.name()) else {
            return Vec::new();
        };
        vec![Intent::Claim(ClaimIntent::new(
            target,
            property,
            ClaimValue::string(ip.to_string()),
        ))]
    }
}
