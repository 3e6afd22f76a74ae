//! # indexserve
//!
//! Serves a full-text index of JSON documents over HTTP. A client `POST`s
//! a raw query and receives the matching documents as a JSON array that is
//! streamed one record at a time, paced by how fast the client reads.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │ HTTP POST  │──▶│ BodyCollector│──▶│ SqliteIndex  │──▶│ StreamingArrayWriter│──▶ client
//! │ (axum)     │   │ ≤ 4 KiB      │   │ FTS5 cursor  │   │ `[`, items, `]`     │
//! └────────────┘   └──────────────┘   └──────────────┘   └─────────────────────┘
//!        └──────────────────────── access log ◀───────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! indexserve ./data/books.sqlite --load books.jsonl
//! curl -X POST --data 'tolkien' http://127.0.0.1:3000/
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and the JSON error envelope |
//! | [`traits`] | Executor, result sequence and response sink seams |
//! | [`body`] | Bounded request body collection |
//! | [`stream`] | Streaming JSON array writer |
//! | [`index`] | SQLite FTS5 index and its cursor |
//! | [`models`] | Stored document records |
//! | [`access_log`] | Access log formatting |
//! | [`server`] | HTTP endpoint |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod access_log;
pub mod body;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod migrate;
pub mod models;
pub mod server;
pub mod stream;
pub mod traits;
