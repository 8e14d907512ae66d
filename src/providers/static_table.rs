//! Hand-maintained THB rates, served only when every live tier is down.
//!
//! Update these when the market drifts far enough that STATIC-tagged
//! checkouts would be priced noticeably wrong.

use rust_decimal::Decimal;

use crate::core::rates::RateMap;

const STATIC_RATES: &[(&str, i64, u32)] = &[
    // (code, mantissa, scale): THB per one unit
    ("USD", 3600, 2),
    ("EUR", 3900, 2),
    ("GBP", 4550, 2),
    ("JPY", 2400, 4),
    ("CNY", 500, 2),
    ("SGD", 2700, 2),
    ("HKD", 460, 2),
    ("AUD", 2350, 2),
    ("KRW", 260, 4),
    ("MYR", 780, 2),
];

/// The compiled-in table as a rate map.
pub fn static_rates() -> RateMap {
    STATIC_RATES
        .iter()
        .map(|&(code, mantissa, scale)| (code.to_string(), Decimal::new(mantissa, scale)))
        .collect()
}
