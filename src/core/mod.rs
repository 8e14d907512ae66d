//! Core rate abstractions

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod log;
pub mod rates;

// Re-export main types for cleaner imports
pub use cache::RateCache;
pub use clock::{Clock, SystemClock};
pub use config::RatesConfig;
pub use error::{ProviderError, RefreshTimeout};
pub use rates::{BASE_CURRENCY, RateMap, RateSnapshot, RateSource, RatesProvider};
