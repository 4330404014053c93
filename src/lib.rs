//! EmberKV: a durable, network-accessible key-value store backed by a
//! log-structured merge engine.
//!
//! Writes land in a write-ahead log and an in-memory [`MemStore`]; full
//! MemStores are frozen and flushed to immutable sorted segment files, which
//! a background worker periodically compacts. Reads probe the layers newest
//! to oldest. The [`Server`] exposes the engine over a `\r`-framed TCP line
//! protocol.

pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod memstore;
pub mod scheduler;
pub mod segment;
pub mod server;
pub mod wal;

pub use config::Config;
pub use engine::{Engine, Stats};
pub use error::{Error, Result};
pub use memstore::{MemStore, Record};
pub use server::Server;
