//! External rate response shape.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

use crate::core::rates::{RateMap, RateSnapshot, RateSource};

/// What pricing and checkout collaborators receive. Rates serialise as
/// JSON numbers; `lastUpdated` is RFC 3339.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateResponse {
    #[serde(serialize_with = "rates_as_numbers")]
    pub rates: RateMap,
    pub last_updated: DateTime<Utc>,
    pub source: RateSource,
}

struct NumericRate<'a>(&'a Decimal);

impl Serialize for NumericRate<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        rust_decimal::serde::float::serialize(self.0, serializer)
    }
}

fn rates_as_numbers<S: Serializer>(rates: &RateMap, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(rates.iter().map(|(code, rate)| (code, NumericRate(rate))))
}

impl From<&RateSnapshot> for RateResponse {
    fn from(snapshot: &RateSnapshot) -> Self {
        Self {
            rates: snapshot.rates().clone(),
            last_updated: snapshot.fetched_at(),
            source: snapshot.source(),
        }
    }
}
