//! Red Packet Projector
//!
//! Replays the ledger's event log into a queryable read model of packets,
//! claims and per-user aggregates.
//!
//! # Architecture
//!
//! - **Projector**: per-packet ordered, idempotent application of events
//! - **EntityStore**: explicit store object (RocksDB or in-memory), one batch per event
//! - **Pipeline**: the projector as a tokio actor fed by a ledger subscription
//! - **EventSource**: the persisted log, re-read to fill whatever the feed missed
//! - **ReadModel**: point lookups and the open-packet listing

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod entities;
pub mod error;
pub mod pipeline;
pub mod projector;
pub mod queries;
pub mod source;
pub mod store;

// Re-exports
pub use config::Config;
pub use entities::{ClaimEntity, EntityBatch, PacketEntity, UserEntity};
pub use error::{Error, Result};
pub use pipeline::{spawn_projector, ProjectorHandle};
pub use projector::{ApplyOutcome, Projector, ProjectorStats};
pub use queries::ReadModel;
pub use source::EventSource;
pub use store::{EntityStore, MemoryEntityStore, RocksEntityStore};
