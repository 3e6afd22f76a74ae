//! Error taxonomy for the query endpoint.
//!
//! Failures split on one line: whether any response byte has been
//! committed yet. [`CollectError`] and [`QueryError`] happen before the
//! status line is chosen and become clean JSON error responses built from
//! an [`ErrorEnvelope`]. [`StreamError`] happens after `[` is on the wire;
//! it can only release resources and be logged.

use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

/// Message returned with a 413 when the request body is over the limit.
pub const QUERY_TOO_LONG: &str = "The query was too long.";

/// Failure while reading the request body.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{}", QUERY_TOO_LONG)]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Body(String),
}

/// Failure raised by a query executor before any result was produced.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct QueryError(pub String);

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

/// Failure after the response has started streaming.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("result sequence failed: {0}")]
    Fetch(String),
    #[error("response write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("response write timed out after {0:?}")]
    WriteTimeout(Duration),
}

/// JSON body of every error response: `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

impl ErrorEnvelope {
    pub fn from_error(err: &impl Display) -> Self {
        Self {
            error: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // A lone string field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
