//! Common error types for SwapServe
//!
//! One taxonomy for the whole fleet: configuration problems, channel
//! and worker failures, collective-group misuse, and engine errors.
//! Errors surface at the HTTP boundary as structured failures; the
//! only silently swallowed case is closing a communicator whose peer
//! is already gone.

use thiserror::Error;

/// Main error type for SwapServe
#[derive(Error, Debug)]
pub enum SwapServeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Control-channel errors (framing, closed peer)
    #[error("Channel error: {0}")]
    Channel(String),

    /// A shard process crashed or became unreachable
    #[error("Worker failure: {0}")]
    Worker(String),

    /// Collective-group state misuse (double init, use before init)
    #[error("Group state error: {0}")]
    GroupState(String),

    /// Collective-group transport failure (rendezvous, broadcast, barrier)
    #[error("Collective error: {0}")]
    Collective(String),

    /// Bounded wait expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tensor codec errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Engine capability errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<candle_core::Error> for SwapServeError {
    fn from(err: candle_core::Error) -> Self {
        SwapServeError::Tensor(err.to_string())
    }
}

impl SwapServeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SwapServeError::Config(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        SwapServeError::Channel(msg.into())
    }

    /// Create a worker failure error
    pub fn worker(msg: impl Into<String>) -> Self {
        SwapServeError::Worker(msg.into())
    }

    /// Create a group-state misuse error
    pub fn group_state(msg: impl Into<String>) -> Self {
        SwapServeError::GroupState(msg.into())
    }

    /// Create a collective transport error
    pub fn collective(msg: impl Into<String>) -> Self {
        SwapServeError::Collective(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        SwapServeError::Timeout(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SwapServeError::InvalidInput(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        SwapServeError::Tensor(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        SwapServeError::Engine(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        SwapServeError::Internal(msg.into())
    }
}

/// Result type alias for SwapServe operations
pub type Result<T> = std::result::Result<T, SwapServeError>;
