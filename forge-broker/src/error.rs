//! Error types for the broker layer

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Protocol or transport error reported by the AMQP client
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Could not open a connection
    #[error("Failed to connect to {uri}: {message}")]
    ConnectFailed {
        /// Broker URI (credentials included as configured)
        uri: String,
        /// Underlying failure
        message: String,
    },

    /// Every reconnect attempt failed
    #[error("Reconnect retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// Session setup failed after connecting
    #[error("Session setup failed: {0}")]
    Setup(String),
}
