//! An append-only, totally ordered log of immutable chunks grouped into
//! per-partition streams.
//!
//! The crate is organized around the [`Persistence`] contract: a backend
//! stores chunks, enforces `(partition, index)` and `(partition, operation
//! id)` uniqueness, keeps the global position sequence dense via empty-chunk
//! fillers, and serves range and point queries through the push-based
//! [`Subscription`] protocol. [`mem::MemoryChunkStore`] is the reference
//! backend; the batching writer and polling client ride on top of the
//! contract and work against any backend.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

pub mod backoff;
pub mod batch;
pub mod codec;
pub mod core;
pub mod mem;
pub mod poller;
pub mod sequence;
pub mod sim;
pub mod stream;
pub mod subscription;

pub use crate::core::{
    ChunkStoreError, ChunkStoreErrorKind, Persistence, WriteJob, WriteOutcome,
};
pub use crate::subscription::Subscription;
