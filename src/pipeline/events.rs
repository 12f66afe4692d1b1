//! Pipeline events. The topic of an event is derived from its variant,
//! so a payload can never be emitted under the wrong topic.

use std::sync::Arc;

use super::context::SiteContext;
use super::discovery::DiscoveredSite;
use super::fetchers::{DnsRecord, Manifest, SiteInfo};
use crate::bus::BusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactKind {
    SiteInfo,
    Manifest,
    ReverseDns,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::SiteInfo => "siteinfo",
            FactKind::Manifest => "manifest",
            FactKind::ReverseDns => "reverse_dns",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    SiteDiscovered,
    SiteAlive,
    SiteDead,
    ContextReady,
    Data(FactKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactData {
    SiteInfo(SiteInfo),
    Manifest(Manifest),
    ReverseDns(Vec<DnsRecord>),
}

impl FactData {
    pub fn kind(&self) -> FactKind {
        match self {
            FactData::SiteInfo(_) => FactKind::SiteInfo,
            FactData::Manifest(_) => FactKind::Manifest,
            FactData::ReverseDns(_) => FactKind::ReverseDns,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SiteDiscovered(DiscoveredSite),
    SiteAlive(Arc<SiteContext>),
    SiteDead { site: DiscoveredSite, reason: String },
    ContextReady(Arc<SiteContext>),
    Data {
        context: Arc<SiteContext>,
        data: Arc<FactData>,
    },
}

impl BusEvent for PipelineEvent {
    type Topic = Topic;

    fn topic(&self) -> Topic {
        match self {
            PipelineEvent::SiteDiscovered(_) => Topic::SiteDiscovered,
            PipelineEvent::SiteAlive(_) => Topic::SiteAlive,
            PipelineEvent::SiteDead { .. } => Topic::SiteDead,
            PipelineEvent::ContextReady(_) => Topic::ContextReady,
            PipelineEvent::Data { data, .. } => Topic::Data(data.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_topic_follows_payload() {
        let context = Arc::new(SiteContext::default());
        let event = PipelineEvent::Data {
            context,
            data: Arc::new(FactData::ReverseDns(Vec::new())),
        };
        assert_eq!(event.topic(), Topic::Data(FactKind::ReverseDns));
    }

    #[test]
    fn test_dead_topic() {
        let event = PipelineEvent::SiteDead {
            site: DiscoveredSite::new("https://dead.example/", None),
            reason: "timeout".to_string(),
        };
        assert_eq!(event.topic(), Topic::SiteDead);
    }
}
