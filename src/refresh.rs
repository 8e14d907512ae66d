//! Refresh scheduling: staleness policy, single-flight coalescing and the
//! refresh-ahead background tick.
//!
//! Foreground callers use the block-until-fresh policy with a bounded
//! wait. A caller whose wait expires falls back to the snapshot already
//! in the cache; the refresh it joined keeps running for everyone else.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::core::cache::RateCache;
use crate::core::clock::Clock;
use crate::core::config::RatesConfig;
use crate::core::error::RefreshTimeout;
use crate::core::rates::RateSnapshot;
use crate::fallback::FallbackOrchestrator;

type PendingRefresh = Shared<BoxFuture<'static, Arc<RateSnapshot>>>;

/// Timing knobs for [`RateService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Snapshots older than this are stale and trigger a refresh on read.
    pub ttl: Duration,
    /// The background tick refreshes snapshots older than this.
    pub refresh_ahead_age: Duration,
    pub tick: Duration,
    /// Longest a foreground caller waits for an in-flight refresh.
    pub wait_timeout: Duration,
}

impl From<&RatesConfig> for RefreshPolicy {
    fn from(config: &RatesConfig) -> Self {
        Self {
            ttl: config.ttl(),
            refresh_ahead_age: config.refresh_ahead_age(),
            tick: config.tick(),
            wait_timeout: config.wait_timeout(),
        }
    }
}

struct Inner {
    cache: RateCache,
    orchestrator: FallbackOrchestrator,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    in_flight: Mutex<Option<PendingRefresh>>,
    /// Startup static snapshot; due for refresh until replaced whatever
    /// its age. Held here so its address stays unique.
    seed: Option<Arc<RateSnapshot>>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<PendingRefresh>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_seed(&self, snapshot: &RateSnapshot) -> bool {
        self.seed
            .as_ref()
            .is_some_and(|seed| std::ptr::eq(seed.as_ref(), snapshot))
    }

    fn due(&self, snapshot: &RateSnapshot, max_age: Duration) -> bool {
        if self.is_seed(snapshot) {
            return true;
        }
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        snapshot.age(self.clock.now()) > max_age
    }
}

/// Clears the in-flight slot when the refresh task ends, including when
/// it panics, so a failed run never wedges later refreshes.
struct ClearInFlight(Arc<Inner>);

impl Drop for ClearInFlight {
    fn drop(&mut self) {
        *self.0.slot() = None;
    }
}

/// Process-scoped exchange-rate service: the cache plus the scheduler that
/// keeps it fresh. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RateService {
    inner: Arc<Inner>,
}

impl RateService {
    /// Seeds the cache with the static table, stamped at construction,
    /// before any network call. The seed counts as stale until the first
    /// refresh replaces it, so the first read refreshes.
    pub fn new(
        orchestrator: FallbackOrchestrator,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
    ) -> Self {
        let seed = Arc::new(orchestrator.static_snapshot());
        Self::build(orchestrator, clock, policy, Arc::clone(&seed), Some(seed))
    }

    /// Starts from a known snapshot instead of the static seed. It is
    /// judged by age like any refreshed snapshot.
    pub fn with_snapshot(
        orchestrator: FallbackOrchestrator,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
        snapshot: RateSnapshot,
    ) -> Self {
        Self::build(orchestrator, clock, policy, Arc::new(snapshot), None)
    }

    fn build(
        orchestrator: FallbackOrchestrator,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
        initial: Arc<RateSnapshot>,
        seed: Option<Arc<RateSnapshot>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: RateCache::new(initial),
                orchestrator,
                clock,
                policy,
                in_flight: Mutex::new(None),
                seed,
            }),
        }
    }

    /// The cached snapshot, fresh or not. Never blocks.
    pub fn current(&self) -> Arc<RateSnapshot> {
        self.inner.cache.read()
    }

    pub fn is_stale(&self, snapshot: &RateSnapshot) -> bool {
        self.inner.due(snapshot, self.inner.policy.ttl)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.slot().is_some()
    }

    /// Returns a fresh snapshot, waiting up to the configured bound for a
    /// refresh. On timeout the current, possibly stale, snapshot is served.
    pub async fn ensure_fresh(&self) -> Arc<RateSnapshot> {
        match self.ensure_fresh_within(self.inner.policy.wait_timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let current = self.current();
                warn!(
                    error = %e,
                    source = %current.source(),
                    fetched_at = %current.fetched_at(),
                    "Serving stale exchange rates"
                );
                current
            }
        }
    }

    /// Like [`ensure_fresh`](Self::ensure_fresh) but surfaces the timeout.
    /// Abandoning the wait does not cancel the refresh.
    pub async fn ensure_fresh_within(
        &self,
        timeout: Duration,
    ) -> Result<Arc<RateSnapshot>, RefreshTimeout> {
        let current = self.current();
        if !self.is_stale(&current) {
            return Ok(current);
        }

        debug!(fetched_at = %current.fetched_at(), "Cached rates are stale");
        let pending = self.pending_refresh(false);
        tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| RefreshTimeout { waited: timeout })
    }

    /// Refreshes regardless of staleness, joining any refresh already in
    /// flight.
    pub async fn refresh(&self) -> Arc<RateSnapshot> {
        self.pending_refresh(true).await
    }

    /// Returns the in-flight refresh, starting one if none is running.
    /// Unless `force` is set, a cache refreshed since the caller last
    /// looked is returned as is.
    fn pending_refresh(&self, force: bool) -> PendingRefresh {
        let mut slot = self.inner.slot();
        if let Some(pending) = slot.as_ref() {
            debug!("Joining in-flight rate refresh");
            return pending.clone();
        }

        if !force {
            let current = self.current();
            if !self.is_stale(&current) {
                return futures::future::ready(current).boxed().shared();
            }
        }

        debug!("Starting rate refresh");
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let guard = ClearInFlight(inner);
            let snapshot = Arc::new(guard.0.orchestrator.fetch().await);
            guard.0.cache.write(Arc::clone(&snapshot));
            snapshot
        });

        let inner = Arc::clone(&self.inner);
        let pending = async move {
            match task.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(error = %e, "Rate refresh task failed");
                    inner.cache.read()
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(pending.clone());
        pending
    }

    /// Spawns the refresh-ahead tick. Snapshots older than the policy's
    /// refresh-ahead age are refreshed in the background so foreground
    /// reads rarely see staleness. Abort the handle to stop it.
    pub fn spawn_refresh_ahead(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.inner.policy.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let current = service.current();
                if !service
                    .inner
                    .due(&current, service.inner.policy.refresh_ahead_age)
                {
                    continue;
                }
                let snapshot = service.refresh().await;
                debug!(source = %snapshot.source(), "Background rate refresh finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::testing::ManualClock;
    use crate::core::config::RetryConfig;
    use crate::core::error::ProviderError;
    use crate::core::rates::RateSource;
    use crate::fallback::tests::{ScriptedProvider, rates};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn policy() -> RefreshPolicy {
        RefreshPolicy {
            ttl: TTL,
            refresh_ahead_age: Duration::from_secs(25 * 60),
            tick: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        primary: Arc<ScriptedProvider>,
        secondary: Arc<ScriptedProvider>,
    }

    impl Fixture {
        fn new(primary: ScriptedProvider, secondary: ScriptedProvider) -> Self {
            Self {
                clock: Arc::new(ManualClock::new(
                    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
                )),
                primary: Arc::new(primary),
                secondary: Arc::new(secondary),
            }
        }

        fn orchestrator(&self) -> FallbackOrchestrator {
            FallbackOrchestrator::new(
                self.primary.clone(),
                self.secondary.clone(),
                rates(&[("USD", dec!(36.0)), ("EUR", dec!(39.0))]),
                RetryConfig {
                    retries: 1,
                    delay_ms: 0,
                },
                self.clock.clone(),
            )
        }

        fn service(&self) -> RateService {
            RateService::new(self.orchestrator(), self.clock.clone(), policy())
        }

        fn service_with(&self, age: chrono::Duration, source: RateSource) -> RateService {
            let snapshot = RateSnapshot::new(
                rates(&[("USD", dec!(35.0))]),
                source,
                self.clock.now() - age,
            );
            RateService::with_snapshot(self.orchestrator(), self.clock.clone(), policy(), snapshot)
        }
    }

    fn primary_rates() -> Result<crate::core::rates::RateMap, ProviderError> {
        Ok(rates(&[("USD", dec!(36.5)), ("EUR", dec!(39.2))]))
    }

    fn unavailable() -> Result<crate::core::rates::RateMap, ProviderError> {
        Err(ProviderError::Unavailable("timeout".into()))
    }

    #[tokio::test]
    async fn test_seeded_from_static_table() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        let seed = service.current();
        assert_eq!(seed.source(), RateSource::Static);
        assert_eq!(seed.rates(), &rates(&[("USD", dec!(36.0)), ("EUR", dec!(39.0))]));
        assert_eq!(seed.fetched_at(), fx.clock.now());
        // stale by construction, not by age
        assert!(service.is_stale(&seed));
        assert_eq!(fx.primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_seed_served_on_timeout_carries_start_time() {
        let fx = Fixture::new(
            ScriptedProvider::with_delay(vec![primary_rates()], Duration::from_millis(300)),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let started = fx.clock.now();
        let service = RateService::new(
            fx.orchestrator(),
            fx.clock.clone(),
            RefreshPolicy {
                wait_timeout: Duration::from_millis(20),
                ..policy()
            },
        );

        let served = service.ensure_fresh().await;
        assert_eq!(served.source(), RateSource::Static);
        let response = crate::response::RateResponse::from(served.as_ref());
        assert_eq!(response.last_updated, started);
        assert!(service.is_refreshing());
    }

    #[tokio::test]
    async fn test_static_result_of_failed_refresh_is_not_the_seed() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![unavailable()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        let refreshed = service.ensure_fresh().await;
        assert_eq!(refreshed.source(), RateSource::Static);
        assert!(!service.is_stale(&refreshed));
        service.ensure_fresh().await;
        assert_eq!(fx.primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_fresh_cache_served_without_upstream_call() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service_with(chrono::Duration::minutes(29), RateSource::Primary);

        let snapshot = service.ensure_fresh().await;
        assert_eq!(snapshot.rate("USD"), Some(dec!(35.0)));
        assert_eq!(fx.primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_primary_snapshot_refreshed() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service_with(chrono::Duration::minutes(31), RateSource::Primary);

        let snapshot = service.ensure_fresh().await;
        assert_eq!(snapshot.source(), RateSource::Primary);
        assert_eq!(
            snapshot.rates(),
            &rates(&[("USD", dec!(36.5)), ("EUR", dec!(39.2))])
        );
        assert_eq!(snapshot.fetched_at(), fx.clock.now());
        assert!(Arc::ptr_eq(&snapshot, &service.current()));
        assert!(!service.is_refreshing());
    }

    #[tokio::test]
    async fn test_second_call_performs_no_upstream_call() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        let first = service.ensure_fresh().await;
        let second = service.ensure_fresh().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.primary.calls(), 1);
        assert_eq!(fx.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_both_tiers_down_serves_static_without_error() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![unavailable()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        let snapshot = service
            .ensure_fresh_within(Duration::from_secs(1))
            .await
            .expect("static fallback never times out here");
        assert_eq!(snapshot.source(), RateSource::Static);
        assert_eq!(
            snapshot.rates(),
            &rates(&[("USD", dec!(36.0)), ("EUR", dec!(39.0))])
        );
        assert_eq!(snapshot.fetched_at(), fx.clock.now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let fx = Fixture::new(
            ScriptedProvider::with_delay(vec![primary_rates()], Duration::from_millis(100)),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.ensure_fresh().await })
            })
            .collect();
        let results: Vec<Arc<RateSnapshot>> = futures::future::join_all(callers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(fx.primary.calls(), 1);
        let first = &results[0];
        assert_eq!(first.source(), RateSource::Primary);
        for snapshot in &results {
            assert!(Arc::ptr_eq(snapshot, first));
            assert_eq!(snapshot.fetched_at(), first.fetched_at());
        }
    }

    #[tokio::test]
    async fn test_wait_timeout_does_not_cancel_refresh() {
        let fx = Fixture::new(
            ScriptedProvider::with_delay(vec![primary_rates()], Duration::from_millis(200)),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service_with(chrono::Duration::minutes(45), RateSource::Secondary);

        let result = service
            .ensure_fresh_within(Duration::from_millis(20))
            .await;
        assert_eq!(
            result.unwrap_err(),
            RefreshTimeout {
                waited: Duration::from_millis(20)
            }
        );
        assert!(service.is_refreshing());
        // The caller falls back to what is cached
        assert_eq!(service.current().source(), RateSource::Secondary);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!service.is_refreshing());
        let snapshot = service.ensure_fresh().await;
        assert_eq!(snapshot.source(), RateSource::Primary);
        assert_eq!(fx.primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_ensure_fresh_serves_stale_on_timeout() {
        let fx = Fixture::new(
            ScriptedProvider::with_delay(vec![primary_rates()], Duration::from_millis(300)),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let clock = fx.clock.clone();
        let snapshot = RateSnapshot::new(
            rates(&[("USD", dec!(35.0))]),
            RateSource::Primary,
            clock.now() - chrono::Duration::hours(2),
        );
        let service = RateService::with_snapshot(
            fx.orchestrator(),
            clock,
            RefreshPolicy {
                wait_timeout: Duration::from_millis(20),
                ..policy()
            },
            snapshot,
        );

        let served = service.ensure_fresh().await;
        assert_eq!(served.rate("USD"), Some(dec!(35.0)));
        assert_eq!(served.source(), RateSource::Primary);
    }

    #[tokio::test]
    async fn test_staleness_follows_clock() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![
                primary_rates(),
                Ok(rates(&[("USD", dec!(36.7))])),
            ]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service();

        service.ensure_fresh().await;
        fx.clock.advance(chrono::Duration::minutes(30));
        // exactly at the TTL is still fresh
        assert_eq!(service.ensure_fresh().await.rate("USD"), Some(dec!(36.5)));
        fx.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(service.ensure_fresh().await.rate("USD"), Some(dec!(36.7)));
        assert_eq!(fx.primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_forced_refresh_ignores_staleness() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let service = fx.service_with(chrono::Duration::minutes(1), RateSource::Primary);

        let snapshot = service.refresh().await;
        assert_eq!(snapshot.rate("USD"), Some(dec!(36.5)));
        assert_eq!(fx.primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_ahead_tick() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        // older than the refresh-ahead age but not yet stale
        let service = fx.service_with(chrono::Duration::minutes(26), RateSource::Secondary);
        assert!(!service.is_stale(&service.current()));

        let ticker = service.spawn_refresh_ahead();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ticker.abort();

        assert_eq!(fx.primary.calls(), 1);
        assert_eq!(service.current().source(), RateSource::Primary);
        assert_eq!(service.current().rate("EUR"), Some(dec!(39.2)));
    }

    #[tokio::test]
    async fn test_refresh_ahead_lead_as_long_as_ttl_does_not_refresh_every_tick() {
        let fx = Fixture::new(
            ScriptedProvider::new(vec![primary_rates()]),
            ScriptedProvider::new(vec![unavailable()]),
        );
        let config = RatesConfig {
            ttl_secs: 1800,
            refresh_ahead_secs: 1800,
            ..RatesConfig::default()
        };
        let service = RateService::with_snapshot(
            fx.orchestrator(),
            fx.clock.clone(),
            RefreshPolicy {
                tick: Duration::from_millis(10),
                ..RefreshPolicy::from(&config)
            },
            RateSnapshot::new(
                rates(&[("USD", dec!(35.0))]),
                RateSource::Primary,
                fx.clock.now() - chrono::Duration::seconds(1),
            ),
        );

        let ticker = service.spawn_refresh_ahead();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ticker.abort();

        assert_eq!(fx.primary.calls(), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RatesConfig::default();
        let policy = RefreshPolicy::from(&config);
        assert_eq!(policy.ttl, TTL);
        assert_eq!(policy.refresh_ahead_age, Duration::from_secs(25 * 60));
        assert_eq!(policy.tick, Duration::from_secs(60));
        assert_eq!(policy.wait_timeout, Duration::from_secs(5));
    }
}
