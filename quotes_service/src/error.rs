use thiserror::Error;

/// Errors surfaced by the market-data subsystem.
///
/// `DataNotReceived` is the client-facing failure for both reply timeouts and
/// error packets; everything upstream of it stays specific so the service can
/// put a meaningful string into the reply metadata.
#[derive(Debug, Error)]
pub enum QuotesError {
    #[error("no market for symbol {0}")]
    NoMarket(String),

    #[error("data not received for {symbol} [{start} .. {end}]: {reason}")]
    DataNotReceived {
        symbol: String,
        start: String,
        end: String,
        reason: String,
    },

    #[error("duplicate bars rejected: {0}")]
    DuplicateBars(String),

    #[error("unknown timeframe '{0}'")]
    BadTimeframe(String),

    #[error("bad time range: {0}")]
    BadRange(String),

    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
