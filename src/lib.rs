pub mod core;
pub mod fallback;
pub mod providers;
pub mod refresh;
pub mod response;

pub use crate::core::{
    Clock, ProviderError, RateMap, RateSnapshot, RateSource, RatesConfig, RatesProvider,
    RefreshTimeout, SystemClock,
};
pub use fallback::FallbackOrchestrator;
pub use refresh::{RateService, RefreshPolicy};
pub use response::RateResponse;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

pub enum AppCommand {
    Show,
}

/// Wires the BOT and open exchange-rate adapters, the static table and the
/// refresh scheduler from `config`.
pub fn build_service(config: &RatesConfig) -> Result<RateService> {
    config.validate()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timeout = config.request_timeout();
    let primary =
        providers::BotProvider::new(&config.providers.bot, timeout, Arc::clone(&clock))?;
    let secondary = providers::OpenErProvider::new(&config.providers.open_er, timeout)?;

    let orchestrator = FallbackOrchestrator::new(
        Arc::new(primary),
        Arc::new(secondary),
        providers::static_rates(),
        config.retry,
        Arc::clone(&clock),
    );
    Ok(RateService::new(
        orchestrator,
        clock,
        RefreshPolicy::from(config),
    ))
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => RatesConfig::load_from_path(path)?,
        None => RatesConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let service = build_service(&config)?;
    match command {
        AppCommand::Show => {
            let snapshot = service.ensure_fresh().await;
            info!(source = %snapshot.source(), "Current exchange rates");
            let response = RateResponse::from(snapshot.as_ref());
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
