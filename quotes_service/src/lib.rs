pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fetch;
pub mod gaps;
pub mod proto;
pub mod series;
pub mod service;
pub mod store;
pub mod timeframe;
pub mod timeutil;

pub use client::QuotesClient;
pub use error::QuotesError;
pub use series::{Bar, BarSeries};
pub use timeframe::Timeframe;
