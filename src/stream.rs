//! Streaming JSON array responder.
//!
//! Turns a [`ResultSequence`] into one JSON array written to a
//! [`ResponseSink`], one record per write:
//!
//! ```text
//! [                 ← written once the 200 has been decided
//! \n{record 1}      ← first item: no comma
//! ,\n{record 2}     ← every later item
//! \n]               ← after the sequence is exhausted
//! ```
//!
//! An empty sequence therefore yields `[\n]`.
//!
//! # Backpressure
//!
//! The writer awaits each write before it pulls the next record, so a
//! response never has more than one chunk in flight and a slow client
//! throttles the index cursor directly. [`ChannelSink`] backs this with a
//! zero-capacity channel feeding the HTTP body: a send only resolves once
//! the HTTP stack has taken the chunk.
//!
//! An abort travels on its own one-shot path that the body polls ahead of
//! the data channel. A chunk still parked in the channel when a write times
//! out is therefore dropped, and the client always sees the body end in an
//! error rather than a clean end-of-stream.
//!
//! # Failure after commit
//!
//! Once `[` is out, no error can be expressed in the body. A record that
//! fails to serialize, a failing cursor, or a failed write (client gone,
//! write timeout) moves the stream to [`StreamState::Aborted`]: the
//! sequence is released, the sink is aborted, nothing else is written and
//! the failure is logged.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use futures::channel::{mpsc, oneshot};
use futures::stream::{self, PollNext};
use futures::{future, FutureExt, SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tracing::warn;

use crate::error::StreamError;
use crate::traits::{ResponseSink, ResultSequence};

/// Per-response framing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    FirstItemPending,
    ItemsFlowing,
    Finalized,
    Aborted,
}

/// Result of draining one sequence.
#[derive(Debug)]
pub struct StreamOutcome {
    pub state: StreamState,
    /// Records fully written.
    pub items: usize,
    /// Body bytes accepted by the sink.
    pub bytes: u64,
    pub error: Option<StreamError>,
}

/// Owns a sequence and releases it exactly once, at the latest on drop.
struct Lease<S: ResultSequence> {
    seq: S,
    released: bool,
}

impl<S: ResultSequence> Lease<S> {
    fn new(seq: S) -> Self {
        Self {
            seq,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.seq.release();
        }
    }
}

impl<S: ResultSequence> Drop for Lease<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Writes one JSON array per response. Not shared across responses.
pub struct StreamingArrayWriter<W> {
    sink: W,
    state: StreamState,
    write_timeout: Option<Duration>,
    items: usize,
    bytes: u64,
}

impl<W: ResponseSink> StreamingArrayWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            state: StreamState::NotStarted,
            write_timeout: None,
            items: 0,
            bytes: 0,
        }
    }

    /// Bounds every individual write; an expired write aborts the stream.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Drains `seq` into the sink and returns how far it got.
    ///
    /// The sequence is released exactly once whatever the outcome, and
    /// also if this future is dropped before completion.
    pub async fn stream<S: ResultSequence>(mut self, seq: S) -> StreamOutcome {
        let mut lease = Lease::new(seq);

        let error = match self.drain(&mut lease).await {
            Ok(()) => None,
            Err(err) => {
                lease.release();
                self.state = StreamState::Aborted;
                self.sink.abort(&err.to_string()).await;
                warn!(
                    items = self.items,
                    bytes = self.bytes,
                    error = %err,
                    "response aborted mid-stream"
                );
                Some(err)
            }
        };
        drop(lease);

        StreamOutcome {
            state: self.state,
            items: self.items,
            bytes: self.bytes,
            error,
        }
    }

    async fn drain<S: ResultSequence>(&mut self, lease: &mut Lease<S>) -> Result<(), StreamError> {
        self.send(Bytes::from_static(b"[")).await?;
        self.state = StreamState::FirstItemPending;

        loop {
            let record = lease
                .seq
                .next_record()
                .await
                .map_err(|e| StreamError::Fetch(e.to_string()))?;

            let Some(record) = record else { break };

            let json = serde_json::to_string_pretty(&record)?;
            let separator = match self.state {
                StreamState::FirstItemPending => "\n",
                _ => ",\n",
            };

            let mut chunk = String::with_capacity(separator.len() + json.len());
            chunk.push_str(separator);
            chunk.push_str(&json);
            self.send(Bytes::from(chunk)).await?;

            self.items += 1;
            self.state = StreamState::ItemsFlowing;
        }

        // Exhausted: release before closing the array.
        lease.release();
        self.send(Bytes::from_static(b"\n]")).await?;
        self.state = StreamState::Finalized;
        Ok(())
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        let len = chunk.len() as u64;
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sink.write(chunk))
                .await
                .map_err(|_| StreamError::WriteTimeout(limit))??,
            None => self.sink.write(chunk).await?,
        }
        self.bytes += len;
        Ok(())
    }
}

type BodyItem = Result<Bytes, io::Error>;

/// [`ResponseSink`] feeding an HTTP response body.
pub struct ChannelSink {
    tx: mpsc::Sender<BodyItem>,
    abort: Option<oneshot::Sender<io::Error>>,
}

impl ChannelSink {
    /// Creates a sink and the streaming body it writes into.
    pub fn channel() -> (Self, Body) {
        let (sink, body) = Self::pair();
        (sink, Body::from_stream(body))
    }

    fn pair() -> (Self, impl futures::Stream<Item = BodyItem> + Send + 'static) {
        let (tx, rx) = mpsc::channel::<BodyItem>(0);
        let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();

        // Ends without an item when the sink is dropped unaborted.
        let aborted = abort_rx
            .into_stream()
            .filter_map(|res| future::ready(res.ok().map(Err::<Bytes, io::Error>)));
        let body = stream::select_with_strategy(aborted, rx, |_: &mut ()| PollNext::Left)
            // Nothing follows an error, not even a chunk still parked in `rx`.
            .scan(false, |failed, item: BodyItem| {
                let next = (!*failed).then(|| {
                    *failed = item.is_err();
                    item
                });
                future::ready(next)
            });

        let sink = Self {
            tx,
            abort: Some(abort_tx),
        };
        (sink, body)
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    async fn abort(&mut self, reason: &str) {
        if let Some(abort) = self.abort.take() {
            // Fails only when the body has already been dropped.
            let _ = abort.send(io::Error::other(reason.to_string()));
        }
        self.tx.close_channel();
    }
}
