//! Trainer-client error types
//!
//! Callers need to tell connectivity failures (retry later), protocol
//! failures (inspect status and body), and state misuse (abort) apart,
//! so each is its own variant.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The coordinator could not be reached within the configured
    /// timeout. Recoverable by retrying later.
    #[error("Cannot reach coordinator at {host}:{port}: {message}")]
    Connectivity {
        host: String,
        port: u16,
        message: String,
    },

    /// An HTTP call returned a non-success status. Not retried.
    #[error("Request failed: {status}, {body}")]
    Protocol { status: u16, body: String },

    /// Communicator used in the wrong state (double init, update
    /// before init). Fatal configuration error.
    #[error("Communicator state error: {0}")]
    GroupState(String),

    /// Collective-group transport failure during broadcast or barrier.
    #[error("Collective error: {0}")]
    Collective(String),

    /// Tensor serialization failure on the client side.
    #[error("Tensor error: {0}")]
    Tensor(String),
}

/// Result type alias for trainer-client operations
pub type Result<T> = std::result::Result<T, ClientError>;
