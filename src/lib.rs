// Core modules
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod models;
pub mod notify;
pub mod strategy;

// Re-export commonly used types
pub use broker::Broker;
pub use error::{Error, Result};
pub use models::*;
pub use strategy::Strategy;
