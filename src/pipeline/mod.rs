//! Pipeline orchestrator.
//!
//! Per site: `SiteDiscovered` → liveness → `SiteAlive` | `SiteDead`;
//! `SiteAlive` → context build → `ContextReady`; `ContextReady` fans out
//! to every registered fetcher whose gate passes, each emitting a `Data`
//! event; processors subscribed to that data submit intents to the
//! engine.
//!
//! Handlers never do I/O themselves. The liveness and context stages run
//! as a single bulk-lane job that awaits each stage in turn, fetchers run
//! as moderate-lane jobs, and every write lands on the serial lane through
//! the engine.

pub mod context;
pub mod discovery;
pub mod events;
pub mod fetchers;
pub mod processors;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;

use self::context::SiteContext;
use self::discovery::{DiscoveredSite, DiscoverySource};
use self::events::{PipelineEvent, Topic};
use self::fetchers::{FactFetcher, ManifestFetcher, ReverseDnsFetcher, SiteInfoFetcher};
use self::processors::{
    FactProcessor, Intent, IpAddressProcessor, SiteLabelProcessor, SoftwareVersionProcessor,
    StatisticsProcessor, WikibasePresenceProcessor,
};
use crate::bus::{BusEvent, EventBus};
use crate::engine::retry::retry_rate_limited;
use crate::engine::ClaimEngine;
use crate::error::JobError;
use crate::fetch::{FetchOptions, Fetcher};
use crate::queue::JobQueues;
use crate::store::RecordStore;
use crate::types::Config;

type Bus = EventBus<PipelineEvent>;

/// Totals for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub discovered: usize,
    pub alive: usize,
    pub dead: usize,
    /// Facts fetched successfully.
    pub facts: usize,
    /// Intents handed to the engine.
    pub intents: usize,
}

#[derive(Default)]
struct RunCounters {
    alive: AtomicUsize,
    dead: AtomicUsize,
    facts: AtomicUsize,
    intents: AtomicUsize,
}

impl RunCounters {
    fn snapshot(&self, discovered: usize) -> RunStats {
        RunStats {
            discovered,
            alive: self.alive.load(Ordering::SeqCst),
            dead: self.dead.load(Ordering::SeqCst),
            facts: self.facts.load(Ordering::SeqCst),
            intents: self.intents.load(Ordering::SeqCst),
        }
    }
}

pub struct Pipeline {
    bus: Arc<Bus>,
    queues: Arc<JobQueues>,
    engine: ClaimEngine,
    fetcher: Arc<Fetcher>,
    counters: Arc<RunCounters>,
    poll_interval: Duration,
}

impl Pipeline {
    pub fn new(
        queues: Arc<JobQueues>,
        engine: ClaimEngine,
        fetcher: Arc<Fetcher>,
        poll_interval: Duration,
    ) -> Self {
        let pipeline = Self {
            bus: Arc::new(Bus::new()),
            queues,
            engine,
            fetcher,
            counters: Arc::new(RunCounters::default()),
            poll_interval,
        };
        pipeline.wire_site_stages();
        pipeline
    }

    /// Register the built-in fetchers and processors.
    pub fn with_default_facts(self, config: &Config) -> Self {
        let properties = config.properties.clone();
        self.register_fetcher(Arc::new(SiteInfoFetcher::new(self.fetcher.clone())));
        self.register_fetcher(Arc::new(ManifestFetcher::new(self.fetcher.clone())));
        self.register_fetcher(Arc::new(ReverseDnsFetcher::new(
            self.fetcher.clone(),
            &config.dns_over_https_url,
        )));

        self.register_processor(Arc::new(SoftwareVersionProcessor::new(properties.clone())));
        self.register_processor(Arc::new(StatisticsProcessor::new(
            properties.clone(),
            config.significance_threshold,
        )));
        self.register_processor(Arc::new(SiteLabelProcessor));
        self.register_processor(Arc::new(WikibasePresenceProcessor::new(properties.clone())));
        self.register_processor(Arc::new(IpAddressProcessor::new(properties)));
        self
    }

    pub fn queues(&self) -> &Arc<JobQueues> {
        &self.queues
    }

    pub fn handlers(&self, topic: Topic) -> Vec<String> {
        self.bus.handlers(topic)
    }

    pub fn registered_topics(&self) -> Vec<Topic> {
        self.bus.registered_topics()
    }

    fn wire_site_stages(&self) {
        let bus = Arc::downgrade(&self.bus);
        let queues = self.queues.clone();
        let fetcher = self.fetcher.clone();
        let store = self.engine.store().clone();
        self.bus.register(Topic::SiteDiscovered, "site_check", move |event| {
            let PipelineEvent::SiteDiscovered(site) = event else {
                return;
            };
            let site = site.clone();
            let bus = bus.clone();
            let fetcher = fetcher.clone();
            let store = store.clone();
            queues.bulk.add(format!("check {}", site.url), async move {
                check_site(&bus, &fetcher, store.as_ref(), site).await
            });
        });

        let counters = self.counters.clone();
        self.bus.register(Topic::SiteAlive, "count_alive", move |_| {
            counters.alive.fetch_add(1, Ordering::SeqCst);
        });

        let counters = self.counters.clone();
        self.bus.register(Topic::SiteDead, "log_dead", move |event| {
            if let PipelineEvent::SiteDead { site, reason } = event {
                log::info!("Pipeline: {} is dead: {}", site.url, reason);
                counters.dead.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    /// Subscribe a fetcher to `ContextReady`. It runs as a moderate-lane
    /// job for every context that passes its gate.
    pub fn register_fetcher(&self, fact_fetcher: Arc<dyn FactFetcher>) {
        let bus = Arc::downgrade(&self.bus);
        let queues = self.queues.clone();
        let counters = self.counters.clone();
        let name = fact_fetcher.name();
        self.bus.register(Topic::ContextReady, name, move |event| {
            let PipelineEvent::ContextReady(context) = event else {
                return;
            };
            if !fact_fetcher.ready(context) {
                log::debug!("Pipeline: {} skipped for {}", name, context.domain);
                return;
            }
            let fact_fetcher = fact_fetcher.clone();
            let context = context.clone();
            let bus = bus.clone();
            let counters = counters.clone();
            queues.moderate.add(format!("{} {}", name, context.label()), async move {
                match fact_fetcher.fetch(&context).await? {
                    Some(data) => {
                        counters.facts.fetch_add(1, Ordering::SeqCst);
                        emit(
                            &bus,
                            PipelineEvent::Data {
                                context,
                                data: Arc::new(data),
                            },
                        );
                    }
                    None => log::debug!("Pipeline: no {} for {}", name, context.domain),
                }
                Ok(())
            });
        });
    }

    /// Subscribe a processor to its data topic. Its intents go straight to
    /// the engine, which queues them on the serial lane.
    pub fn register_processor(&self, processor: Arc<dyn FactProcessor>) {
        let engine = self.engine.clone();
        let counters = self.counters.clone();
        let topic = Topic::Data(processor.kind());
        self.bus.register(topic, processor.name(), move |event| {
            let PipelineEvent::Data { context, data } = event else {
                return;
            };
            for intent in processor.process(context, data) {
                counters.intents.fetch_add(1, Ordering::SeqCst);
                match intent {
                    Intent::Claim(claim) => engine.ensure(claim),
                    Intent::Term(term) => engine.ensure_term(term),
                }
            }
        });
    }

    /// Collect candidates from every source. A failing source is logged
    /// and skipped. Duplicate URLs collapse onto the first occurrence,
    /// picking up a record id from a later one if needed.
    pub async fn discover(&self, sources: &[Arc<dyn DiscoverySource>]) -> Vec<DiscoveredSite> {
        let mut sites: Vec<DiscoveredSite> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for source in sources {
            let found = match source.discover().await {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("Pipeline: discovery source '{}' failed: {}", source.name(), e);
                    continue;
                }
            };
            log::info!("Pipeline: '{}' returned {} site(s)", source.name(), found.len());
            for site in found {
                let key = site.dedup_key();
                if let Some(&index) = seen.get(&key) {
                    if sites[index].record_id.is_none() {
                        sites[index].record_id = site.record_id;
                    }
                } else {
                    seen.insert(key, sites.len());
                    sites.push(site);
                }
            }
        }
        sites
    }

    /// Discover, run every site through the pipeline and return once all
    /// lanes are quiescent. The bus is cleared afterwards, so a pipeline
    /// runs exactly one batch.
    pub async fn run_batch(self, sources: &[Arc<dyn DiscoverySource>]) -> RunStats {
        let sites = self.discover(sources).await;
        log::info!("Pipeline: {} site(s) to check", sites.len());

        for site in &sites {
            self.bus.emit(PipelineEvent::SiteDiscovered(site.clone()));
        }
        self.queues.wait_for_quiescence(self.poll_interval).await;
        self.bus.clear();

        let stats = self.counters.snapshot(sites.len());
        log::info!(
            "Pipeline: done. {} discovered, {} alive, {} dead, {} facts, {} intents",
            stats.discovered,
            stats.alive,
            stats.dead,
            stats.facts,
            stats.intents
        );
        stats
    }
}

fn emit(bus: &Weak<Bus>, event: PipelineEvent) {
    match bus.upgrade() {
        Some(bus) => {
            bus.emit(event);
        }
        None => log::debug!("Pipeline: bus gone, dropping {:?}", event.topic()),
    }
}

/// Liveness probe: an uncached GET of the site URL. 2xx and 3xx count as
/// alive. Returns the base context and the home page body.
pub async fn probe(fetcher: &Fetcher, site: &DiscoveredSite) -> Result<(SiteContext, String), String> {
    let context = SiteContext::from_site(site).map_err(|e| e.to_string())?;
    let response = fetcher
        .fetch(&site.url, &FetchOptions::get())
        .await
        .map_err(|e| e.to_string())?;
    if !(200..400).contains(&response.status) {
        return Err(format!("HTTP {}", response.status));
    }
    Ok((context, response.body))
}

/// Context build: endpoints and metadata from the home page, then the
/// record snapshot when the site has a record. A rate-limited snapshot
/// read is retried every `backoff`; any other failure leaves the context
/// without one.
pub async fn build_context(
    store: &dyn RecordStore,
    context: SiteContext,
    home_page: &str,
    backoff: Duration,
) -> SiteContext {
    let context = context.with_home_page(home_page);
    let Some(id) = context.record_id.clone() else {
        return context;
    };
    let record_id = id.as_str();
    match retry_rate_limited(backoff, "snapshot", move || store.get_entity(record_id)).await {
        Ok(record) => context.with_record(record),
        Err(e) => {
            log::warn!("Pipeline: no snapshot of {} for {}: {}", id, context.domain, e);
            context
        }
    }
}

async fn check_site(
    bus: &Weak<Bus>,
    fetcher: &Fetcher,
    store: &dyn RecordStore,
    site: DiscoveredSite,
) -> Result<(), JobError> {
    let (context, home_page) = match probe(fetcher, &site).await {
        Ok(alive) => alive,
        Err(reason) => {
            emit(bus, PipelineEvent::SiteDead { site, reason });
            return Ok(());
        }
    };
    emit(bus, PipelineEvent::SiteAlive(Arc::new(context.clone())));

    let context = build_context(store, context, &home_page, fetcher.policy().backoff).await;
    log::debug!(
        "Pipeline: context for {}: api={:?} rest={:?} generator={:?}",
        context.label(),
        context.action_api,
        context.rest_api,
        context.generator
    );
    emit(bus, PipelineEvent::ContextReady(Arc::new(context)));
    Ok(())
}
