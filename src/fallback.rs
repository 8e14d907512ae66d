//! Tiered rate acquisition: primary, then secondary, then the static table.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::config::RetryConfig;
use crate::core::error::ProviderError;
use crate::core::rates::{RateMap, RateSnapshot, RateSource, RatesProvider};
use crate::providers::util::with_retry;

/// Result of asking one live tier for rates, after retries.
#[derive(Debug)]
pub enum TierOutcome {
    Success(RateMap),
    /// Still unavailable or rate limited once the retries ran out.
    TransientFailure(ProviderError),
    /// Malformed payload; never retried.
    PermanentFailure(ProviderError),
}

impl From<Result<RateMap, ProviderError>> for TierOutcome {
    fn from(result: Result<RateMap, ProviderError>) -> Self {
        match result {
            Ok(rates) => TierOutcome::Success(rates),
            Err(e) if e.is_transient() => TierOutcome::TransientFailure(e),
            Err(e) => TierOutcome::PermanentFailure(e),
        }
    }
}

pub struct FallbackOrchestrator {
    primary: Arc<dyn RatesProvider>,
    secondary: Arc<dyn RatesProvider>,
    static_rates: RateMap,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl FallbackOrchestrator {
    pub fn new(
        primary: Arc<dyn RatesProvider>,
        secondary: Arc<dyn RatesProvider>,
        static_rates: RateMap,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            secondary,
            static_rates,
            retry,
            clock,
        }
    }

    /// Snapshot of the static table stamped with the current time. Used
    /// both to seed the cache and as the terminal fallback.
    pub fn static_snapshot(&self) -> RateSnapshot {
        RateSnapshot::new(
            self.static_rates.clone(),
            RateSource::Static,
            self.clock.now(),
        )
    }

    async fn try_tier(&self, provider: &dyn RatesProvider) -> TierOutcome {
        with_retry(
            || provider.fetch_rates(),
            self.retry.retries,
            self.retry.delay_ms,
        )
        .await
        .into()
    }

    /// Produces one authoritative snapshot. Never fails: when both live
    /// tiers are down the static table is returned.
    pub async fn fetch(&self) -> RateSnapshot {
        let tiers: [(RateSource, &dyn RatesProvider); 2] = [
            (RateSource::Primary, self.primary.as_ref()),
            (RateSource::Secondary, self.secondary.as_ref()),
        ];

        for (source, provider) in tiers {
            match self.try_tier(provider).await {
                TierOutcome::Success(rates) => {
                    info!(
                        %source,
                        provider = provider.name(),
                        count = rates.len(),
                        "Fetched exchange rates"
                    );
                    return RateSnapshot::new(rates, source, self.clock.now());
                }
                TierOutcome::TransientFailure(e) => {
                    warn!(%source, provider = provider.name(), error = %e, "Rate tier unavailable");
                }
                TierOutcome::PermanentFailure(e) => {
                    warn!(%source, provider = provider.name(), error = %e, "Rate tier returned unusable data");
                }
            }
        }

        warn!("All live rate tiers failed, serving static rates");
        self.static_snapshot()
    }
}
