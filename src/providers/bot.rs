//! Primary tier: Bank of Thailand daily weighted-average interbank rates.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::clock::Clock;
use crate::core::config::BotProviderConfig;
use crate::core::error::ProviderError;
use crate::core::rates::{RateMap, RatesProvider, normalize_rates};

const RATES_PATH: &str = "/Stat-ExchangeRate/v2/DAILY_AVG_EXG_RATE/";

// Weekends and bank holidays publish nothing; look back far enough to
// always cover the last business day.
const LOOKBACK_DAYS: u64 = 7;

pub struct BotProvider {
    base_url: String,
    client_id: Option<String>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl BotProvider {
    pub fn new(
        config: &BotProviderConfig,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("thb-rates/0.1")
            .timeout(timeout)
            .build()?;
        Ok(BotProvider {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client,
            clock,
        })
    }

    /// Publication dates follow Bangkok time.
    fn today(&self) -> NaiveDate {
        let now = self.clock.now();
        FixedOffset::east_opt(7 * 3600)
            .map(|bangkok| now.with_timezone(&bangkok).date_naive())
            .unwrap_or_else(|| now.date_naive())
    }
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    result: BotResult,
}

#[derive(Debug, Deserialize)]
struct BotResult {
    data: BotData,
}

#[derive(Debug, Deserialize)]
struct BotData {
    data_detail: Vec<BotRateRow>,
}

#[derive(Debug, Deserialize)]
struct BotRateRow {
    period: String,
    currency_id: String,
    #[serde(default)]
    mid_rate: Option<String>,
}

/// Keeps the most recent period and turns its rows into a rate map.
/// Rows without a published mid rate are skipped.
fn extract_latest_rates(rows: Vec<BotRateRow>) -> Result<RateMap, ProviderError> {
    let latest = rows
        .iter()
        .map(|row| row.period.as_str())
        .max()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Malformed("BOT returned no rate rows".to_string()))?;

    let mut entries = Vec::new();
    for row in rows.into_iter().filter(|row| row.period == latest) {
        let Some(mid) = row.mid_rate.as_deref().map(str::trim).filter(|m| !m.is_empty()) else {
            continue;
        };
        let rate = Decimal::from_str(mid).map_err(|e| {
            ProviderError::Malformed(format!(
                "invalid mid_rate {mid:?} for {}: {e}",
                row.currency_id
            ))
        })?;
        entries.push((row.currency_id, rate));
    }
    debug!(period = %latest, count = entries.len(), "Parsed BOT rates");
    normalize_rates(entries)
}

#[async_trait]
impl RatesProvider for BotProvider {
    #[instrument(name = "BotRatesFetch", skip(self))]
    async fn fetch_rates(&self) -> Result<RateMap, ProviderError> {
        let end = self.today();
        let start = end.checked_sub_days(Days::new(LOOKBACK_DAYS)).unwrap_or(end);
        let url = format!(
            "{}{}?start_period={}&end_period={}",
            self.base_url,
            RATES_PATH,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        debug!("Requesting BOT rates from {}", url);

        let mut request = self.client.get(&url);
        if let Some(client_id) = &self.client_id {
            request = request.header("X-IBM-Client-Id", client_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::from_status(response.status(), self.name()));
        }

        let text = response.text().await?;
        let data: BotResponse = serde_json::from_str(&text)?;
        extract_latest_rates(data.result.data.data_detail)
    }

    fn name(&self) -> &'static str {
        "bot"
    }
}
