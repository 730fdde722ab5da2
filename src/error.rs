//! Error types and result aliases for the runtrace library.
//!
//! This module defines the core error type [`TraceError`] and the [`Result`] type alias
//! used throughout the library. Errors raised by instrumented application code are
//! never converted into `TraceError`; they are handed back to the caller unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Feedback error: {0}")]
    FeedbackError(String),

    #[error("Thread error: {0}")]
    ThreadError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

pub type Result<T> = std::result::Result<T, TraceError>;
