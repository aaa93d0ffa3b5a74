//! Error types for registry operations
//!
//! A single public error enum covers the whole API surface: configuration
//! errors are synchronous, connect-path errors are returned to the caller
//! (never a process abort), and registry misses are a distinct recoverable
//! variant.

use crate::config::ConfigError;
use crate::session::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("No connection registered under key {0:?}")]
    UnknownClient(String),

    #[error("Client request failed")]
    ClientRequest(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RegistryError {
    /// Wrap an underlying client-library error
    pub(crate) fn client<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ClientRequest(Box::new(err))
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
