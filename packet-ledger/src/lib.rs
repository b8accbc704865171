//! Red Packet Ledger
//!
//! Claim ledger for "red packets": a creator deposits an amount split into a
//! fixed number of shares, claimants each take at most one share, and the
//! unclaimed remainder can be refunded once the packet expires.
//!
//! # Architecture
//!
//! - **Per-packet locking**: claims on one packet are serialized, packets are independent
//! - **Event log**: every state change emits events with a global sequence and a
//!   per-packet hash chain, persisted atomically with the new state
//! - **Capabilities**: value transfer ([`Vault`]), randomness ([`RandomSource`])
//!   and time ([`Clock`]) are injected

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]
//!
//! # Invariants
//!
//! - Conservation: Σ(claims) + remaining + refunded == deposited, per packet
//! - At most one claim per (packet, claimant)
//! - Every unclaimed share can still receive at least one unit
//! - Replaying a packet's events reproduces its state

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod metrics;
pub mod random;
pub mod split;
pub mod storage;
pub mod types;
pub mod vault;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventKey, EventType, LedgerEvent, LedgerEventKind};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use random::{EntropyRandom, RandomSource, ScriptedRandom, SeededRandom};
pub use types::{Address, Claim, Money, Packet, PacketId, PacketStatus};
pub use vault::{InMemoryVault, Vault};
