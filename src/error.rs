//! Error types for the call router

use thiserror::Error;

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Error kinds surfaced by the router and its call workers
#[derive(Error, Debug)]
pub enum RouterError {
    /// Application is not registered with the directory
    #[error("Application {0} is not registered")]
    UnknownSipApp(String),

    /// Admission denied: the live-call limit has been reached
    #[error("Too many concurrent calls")]
    TooManyCalls,

    /// Synchronous work exceeded its round-trip deadline
    #[error("Operation timed out")]
    Timeout,

    /// Dialog cannot be resolved
    #[error("Dialog {0} not found")]
    UnknownDialog(String),

    /// Request is not known to the call worker
    #[error("Request {0} not found")]
    UnknownRequest(String),

    /// SIP message is not known to the call worker
    #[error("SIP message {0} not found")]
    UnknownSipMsg(String),

    /// Transaction is not known to the call worker
    #[error("Transaction {0} not found")]
    UnknownTransaction(String),

    /// Malformed call, message, or dialog reference
    #[error("Invalid call reference: {0}")]
    InvalidCall(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Internal error (broken channel, lost shard)
    #[error("Internal error: {0}")]
    Internal(String),
}
