//! Rate snapshot types and the provider abstraction

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

use super::error::ProviderError;

/// The fixed domestic currency every rate is quoted against.
pub const BASE_CURRENCY: &str = "THB";

/// Currency code → THB per one unit of that currency. Never contains THB.
pub type RateMap = BTreeMap<String, Decimal>;

/// Tier that produced a snapshot, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateSource {
    #[serde(rename = "BOT")]
    Primary,
    #[serde(rename = "FALLBACK")]
    Secondary,
    #[serde(rename = "STATIC")]
    Static,
}

impl RateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateSource::Primary => "BOT",
            RateSource::Secondary => "FALLBACK",
            RateSource::Static => "STATIC",
        }
    }
}

impl Display for RateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable, timestamped, source-tagged set of conversion rates.
///
/// Shared behind an `Arc`; a refresh builds a new snapshot and swaps the
/// reference instead of touching this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSnapshot {
    rates: RateMap,
    fetched_at: DateTime<Utc>,
    source: RateSource,
}

impl RateSnapshot {
    pub fn new(rates: RateMap, source: RateSource, fetched_at: DateTime<Utc>) -> Self {
        Self {
            rates,
            fetched_at,
            source,
        }
    }

    pub fn rates(&self) -> &RateMap {
        &self.rates
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn source(&self) -> RateSource {
        self.source
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }

    /// Rate for `code`; the base currency is always 1.
    pub fn rate(&self, code: &str) -> Option<Decimal> {
        let code = code.trim().to_ascii_uppercase();
        if code == BASE_CURRENCY {
            return Some(Decimal::ONE);
        }
        self.rates.get(&code).copied()
    }

    /// Converts an amount in `code` into THB.
    pub fn to_base(&self, amount: Decimal, code: &str) -> Option<Decimal> {
        self.rate(code).map(|rate| amount * rate)
    }

    /// Converts a THB amount into `code`. A zero rate cannot be divided into.
    pub fn from_base(&self, amount: Decimal, code: &str) -> Option<Decimal> {
        self.rate(code)
            .filter(|rate| !rate.is_zero())
            .map(|rate| amount / rate)
    }
}

/// Uniform "fetch current rates" capability of an upstream adapter.
///
/// Adapters do not retry; that policy belongs to the fallback chain.
#[async_trait]
pub trait RatesProvider: Send + Sync {
    async fn fetch_rates(&self) -> Result<RateMap, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Validates raw `(code, rate)` pairs from an upstream payload into a
/// [`RateMap`]. Codes are upper-cased, the base currency is dropped and an
/// empty result is rejected.
pub fn normalize_rates<I, S>(entries: I) -> Result<RateMap, ProviderError>
where
    I: IntoIterator<Item = (S, Decimal)>,
    S: AsRef<str>,
{
    let mut rates = RateMap::new();
    for (code, rate) in entries {
        let code = code.as_ref().trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ProviderError::Malformed(format!(
                "invalid currency code: {code:?}"
            )));
        }
        if rate.is_sign_negative() && !rate.is_zero() {
            return Err(ProviderError::Malformed(format!(
                "negative rate {rate} for {code}"
            )));
        }
        if code == BASE_CURRENCY {
            continue;
        }
        if rates.insert(code.clone(), rate).is_some() {
            return Err(ProviderError::Malformed(format!(
                "duplicate currency code: {code}"
            )));
        }
    }

    if rates.is_empty() {
        return Err(ProviderError::Malformed("no usable rates".to_string()));
    }
    Ok(rates)
}
