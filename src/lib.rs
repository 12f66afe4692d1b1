pub mod bus;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod store;
pub mod types;

use std::process::ExitCode;

use state::AppState;

/// Load config, run one discovery batch and report what happened.
pub async fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match state::load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if config.dry_run {
        log::info!("Dry run: writes will be logged, not performed");
    }

    let app = match AppState::from_config(config) {
        Ok(app) => app,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let sources = app.discovery_sources();
    if sources.is_empty() {
        log::warn!("No discovery sources configured; nothing to do");
        return ExitCode::SUCCESS;
    }

    let stats = app.pipeline().run_batch(&sources).await;
    match serde_json::to_string(&stats) {
        Ok(json) => log::info!("Run stats: {}", json),
        Err(e) => log::warn!("Could not serialize run stats: {}", e),
    }
    ExitCode::SUCCESS
}
