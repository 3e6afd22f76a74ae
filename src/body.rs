//! Bounded request body collection.
//!
//! The query arrives as the raw request body. Chunks are appended to a
//! buffer until the stream ends; the moment the running total exceeds the
//! limit the stream is dropped, so nothing more is read or buffered, and
//! the request fails with [`CollectError::TooLarge`]. This holds even when
//! the oversized chunk is the last one.

use futures::{Stream, StreamExt};
use std::fmt::Display;

use crate::error::CollectError;

/// Accumulates body chunks into a query of at most `limit` bytes.
#[derive(Debug)]
pub struct BodyCollector {
    limit: usize,
    buf: Vec<u8>,
}

impl BodyCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
        }
    }

    /// Appends one chunk. Fails as soon as the total goes over the limit;
    /// the rejected chunk is not kept.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), CollectError> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(CollectError::TooLarge { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Finishes collection and decodes the body as text. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn into_query(self) -> String {
        match String::from_utf8(self.buf) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }

    /// Drains `body` until it ends or overflows. The stream is consumed by
    /// value and dropped on return, which detaches from the connection.
    pub async fn collect<S, B, E>(mut self, body: S) -> Result<String, CollectError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| CollectError::Body(e.to_string()))?;
            self.push(chunk.as_ref())?;
        }
        Ok(self.into_query())
    }
}
