use thiserror::Error;

/// Error kinds for the trading core.
///
/// Propagation policy: `Config` aborts startup; `BrokerCall` is recovered
/// per monitoring cycle; order-path errors never advance the strategy
/// state machine.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credentials or parameters.
    #[error("config error: {0}")]
    Config(String),

    /// Transient network/API failure talking to the broker.
    #[error("broker call failed: {0}")]
    BrokerCall(String),

    /// The broker refused an order (margin, circuit limits, bad symbol).
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Storage failure while persisting to the historical cache.
    #[error("cache write failed: {0}")]
    CacheWrite(#[source] sqlx::Error),

    /// Storage failure while reading from the historical cache.
    #[error("cache read failed: {0}")]
    CacheRead(#[source] sqlx::Error),

    /// Notification delivery failure. Always tolerated by callers.
    #[error("notification failed: {0}")]
    Notify(String),
}

impl Error {
    pub fn broker_call(msg: impl std::fmt::Display) -> Self {
        Error::BrokerCall(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::BrokerCall(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
