//! Secondary tier: open exchange-rate API quoting from a THB base.
//!
//! The API answers "units of X per 1 THB", so quotes are inverted into
//! THB per unit of X before they leave the adapter. The full quotient is
//! kept: weak currencies quote in the thousands per THB and any fixed
//! decimal-place rounding would strip most of their significant digits.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::config::OpenErProviderConfig;
use crate::core::error::ProviderError;
use crate::core::rates::{BASE_CURRENCY, RateMap, RatesProvider, normalize_rates};

pub struct OpenErProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OpenErProvider {
    pub fn new(config: &OpenErProviderConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("thb-rates/0.1")
            .timeout(timeout)
            .build()?;
        Ok(OpenErProvider {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenErResponse {
    result: String,
    #[serde(rename = "error-type")]
    error_type: Option<String>,
    base_code: Option<String>,
    #[serde(default)]
    rates: HashMap<String, Decimal>,
}

fn invert_quotes(quotes: HashMap<String, Decimal>) -> Result<RateMap, ProviderError> {
    let mut entries = Vec::with_capacity(quotes.len());
    for (code, quote) in quotes {
        if quote.is_sign_negative() && !quote.is_zero() {
            return Err(ProviderError::Malformed(format!(
                "negative quote {quote} for {code}"
            )));
        }
        match Decimal::ONE.checked_div(quote) {
            Some(rate) if !quote.is_zero() => entries.push((code, rate.normalize())),
            _ => warn!(currency = %code, "Skipping quote that cannot be inverted"),
        }
    }
    normalize_rates(entries)
}

#[async_trait]
impl RatesProvider for OpenErProvider {
    #[instrument(name = "OpenErRatesFetch", skip(self))]
    async fn fetch_rates(&self) -> Result<RateMap, ProviderError> {
        let url = format!("{}/v6/latest/{}", self.base_url, BASE_CURRENCY);
        debug!("Requesting fallback rates from {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::from_status(response.status(), self.name()));
        }

        let text = response.text().await?;
        let data: OpenErResponse = serde_json::from_str(&text)?;

        if data.result != "success" {
            let error_type = data.error_type.unwrap_or_default();
            return Err(match error_type.as_str() {
                "quota-reached" => ProviderError::RateLimited(error_type),
                _ => ProviderError::Malformed(format!(
                    "{} reported error: {error_type}",
                    self.name()
                )),
            });
        }
        if let Some(base) = data.base_code.as_deref() {
            if !base.eq_ignore_ascii_case(BASE_CURRENCY) {
                return Err(ProviderError::Malformed(format!(
                    "expected {BASE_CURRENCY} base, got {base}"
                )));
            }
        }

        invert_quotes(data.rates)
    }

    fn name(&self) -> &'static str {
        "open_er"
    }
}
