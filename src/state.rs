use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{ClaimEngine, EngineConfig};
use crate::error::ConfigError;
use crate::fetch::{FetchPolicy, Fetcher, ReqwestTransport, ResponseCache};
use crate::pipeline::discovery::{DiscoverySource, QueryServiceSource, StaticSource};
use crate::pipeline::Pipeline;
use crate::queue::JobQueues;
use crate::store::{RecordStore, WikibaseStore};
use crate::types::Config;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "WORLDSYNC_CONFIG";

/// Store access token; takes precedence over the config file.
pub const TOKEN_ENV: &str = "WORLDSYNC_TOKEN";

/// Everything one run needs, built once from config and injected into the
/// pipeline.
pub struct AppState {
    pub config: Config,
    pub fetcher: Arc<Fetcher>,
    pub store: Arc<dyn RecordStore>,
    pub queues: Arc<JobQueues>,
    pub engine: ClaimEngine,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(&config.fetch.user_agent)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let policy = FetchPolicy {
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            backoff: Duration::from_secs(config.fetch.rate_limit_backoff_secs),
        };

        let mut fetcher = Fetcher::new(Arc::new(transport), policy.clone());
        if config.fetch.cache_enabled {
            let dir = config
                .fetch
                .cache_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(ResponseCache::default_dir);
            log::info!("Fetch: caching responses in {}", dir.display());
            fetcher = fetcher.with_cache(ResponseCache::new(
                dir,
                chrono::Duration::hours(config.fetch.cache_max_age_hours),
            ));
        }
        let fetcher = Arc::new(fetcher);

        let store: Arc<dyn RecordStore> = Arc::new(WikibaseStore::new(
            &config.store.api_url,
            fetcher.clone(),
            config.store.token.clone(),
            config.store.maxlag,
        ));

        let queues = Arc::new(JobQueues::new(&config.queues));
        let engine = ClaimEngine::new(
            store.clone(),
            queues.serial.clone(),
            EngineConfig {
                backoff: policy.backoff,
                summary_prefix: config.store.summary_prefix.clone(),
                dry_run: config.dry_run,
            },
        );

        Ok(Self {
            config,
            fetcher,
            store,
            queues,
            engine,
        })
    }

    /// Discovery sources named in config.
    pub fn discovery_sources(&self) -> Vec<Arc<dyn DiscoverySource>> {
        let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();
        if !self.config.discovery.sites.is_empty() {
            sources.push(Arc::new(StaticSource::new(self.config.discovery.sites.clone())));
        }
        if let Some(query_service) = &self.config.discovery.query_service {
            sources.push(Arc::new(QueryServiceSource::new(
                &query_service.endpoint,
                &query_service.query,
                self.fetcher.clone(),
            )));
        }
        sources
    }

    /// A pipeline with the built-in facts, ready for one batch.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.queues.clone(),
            self.engine.clone(),
            self.fetcher.clone(),
            Duration::from_millis(self.config.quiescence_poll_ms),
        )
        .with_default_facts(&self.config)
    }
}

/// Get the state directory (~/.worldsync)
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".worldsync"))
}

/// Config file path: `$WORLDSYNC_CONFIG`, else ~/.worldsync/config.json
pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(state_dir()?.join("config.json"))
}

/// Load and validate configuration, applying `$WORLDSYNC_TOKEN`.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = config_path()?;
    load_config_from(&path, std::env::var(TOKEN_ENV).ok())
}

pub fn load_config_from(path: &Path, env_token: Option<String>) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = serde_json::from_str(&content)?;

    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        config.store.token = Some(token);
    }

    validate(&config)?;
    Ok(config)
}

/// Reject configs that cannot run. Missing credentials are only fatal
/// when writes would actually be issued.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    url::Url::parse(&config.store.api_url)
        .map_err(|_| ConfigError::Invalid(format!("store.apiUrl is not a URL: {}", config.store.api_url)))?;

    let has_token = config
        .store
        .token
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    if !has_token && !config.dry_run {
        return Err(ConfigError::MissingCredentials(format!(
            "no store token; set store.token or {}",
            TOKEN_ENV
        )));
    }

    if config.fetch.timeout_secs == 0 {
        return Err(ConfigError::Invalid("fetch.timeoutSecs must be positive".to_string()));
    }

    if let Some(query_service) = &config.discovery.query_service {
        url::Url::parse(&query_service.endpoint).map_err(|_| {
            ConfigError::Invalid(format!(
                "discovery.queryService.endpoint is not a URL: {}",
                query_service.endpoint
            ))
        })?;
    }

    for site in &config.discovery.sites {
        if url::Url::parse(&site.url).is_err() {
            return Err(ConfigError::Invalid(format!("discovery site is not a URL: {}", site.url)));
        }
    }

    Ok(())
}
