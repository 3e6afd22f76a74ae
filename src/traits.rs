//! Collaborator seams of the query endpoint.
//!
//! The endpoint only knows three things about the world around it:
//!
//! ```text
//!   query text ──▶ QueryExecutor ──▶ ResultSequence ──▶ StreamingArrayWriter ──▶ ResponseSink
//! ```
//!
//! [`QueryExecutor`] turns a query into a lazy [`ResultSequence`]; the
//! writer drains that sequence into a [`ResponseSink`] one record at a
//! time. The SQLite index in [`crate::index`] implements the first two,
//! [`crate::stream::ChannelSink`] implements the last one for HTTP.

use async_trait::async_trait;
use axum::body::Bytes;
use serde::Serialize;

use crate::error::QueryError;

/// Runs a query against an index.
///
/// Implementations must support concurrent independent queries: the
/// endpoint shares one executor across every connection.
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    type Sequence: ResultSequence;

    /// Starts a query. Failures returned here are reported to the client
    /// as a 400 before any response byte is committed.
    async fn execute(&self, query: &str) -> Result<Self::Sequence, QueryError>;
}

/// A lazy, forward-only, one-shot sequence of matches.
///
/// The sequence may hold a backend resource (a connection, a snapshot)
/// until [`release`](ResultSequence::release) is called. Callers must call
/// it exactly once; implementations should treat a second call as a no-op.
#[async_trait]
pub trait ResultSequence: Send + 'static {
    type Record: Serialize + Send;

    /// Pulls the next record, or `None` once the sequence is exhausted.
    async fn next_record(&mut self) -> anyhow::Result<Option<Self::Record>>;

    /// Frees the backend resource held by this sequence.
    fn release(&mut self);
}

/// Destination for the bytes of one streamed response body.
#[async_trait]
pub trait ResponseSink: Send {
    /// Hands `chunk` to the transport and resolves once it has been
    /// accepted. At most one write per sink is ever in flight.
    async fn write(&mut self, chunk: Bytes) -> std::io::Result<()>;

    /// Ends the body without clean framing, so the client sees a broken
    /// transfer rather than a short but well-formed one.
    async fn abort(&mut self, reason: &str);
}
