pub mod bot;
pub mod open_er;
pub mod static_table;
pub mod util;

pub use bot::BotProvider;
pub use open_er::OpenErProvider;
pub use static_table::static_rates;
