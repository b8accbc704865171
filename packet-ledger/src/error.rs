//! Error types for the ledger

use crate::types::{Address, Money, PacketId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Packet must hold at least one unit per share
    #[error("Insufficient amount: {amount} cannot fund {count} shares")]
    InsufficientAmount {
        /// Offered amount
        amount: Money,
        /// Requested shares
        count: u32,
    },

    /// Packet must have at least one share
    #[error("Invalid count: a packet needs at least one share")]
    InvalidCount,

    /// No packet with this id
    #[error("Unknown packet: {0}")]
    UnknownPacket(PacketId),

    /// Packet expired before the claim
    #[error("Packet expired: {0}")]
    PacketExpired(PacketId),

    /// Every share has been claimed
    #[error("Packet is finished: {0}")]
    PacketFinished(PacketId),

    /// Claimant already holds a share of this packet
    #[error("Already claimed: {claimant} on packet {packet_id}")]
    AlreadyClaimed {
        /// Packet
        packet_id: PacketId,
        /// Claimant
        claimant: Address,
    },

    /// Only the creator may refund
    #[error("Not creator: {caller} cannot refund packet {packet_id}")]
    NotCreator {
        /// Packet
        packet_id: PacketId,
        /// Caller
        caller: Address,
    },

    /// Refund requested before expiry
    #[error("Packet not expired: {0}")]
    NotExpired(PacketId),

    /// Nothing left to return
    #[error("Nothing to refund: {0}")]
    NothingToRefund(PacketId),

    /// Vault refused the value transfer
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Integer overflow/underflow in money arithmetic
    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed or out-of-place event during replay
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(u64),

    /// Invariant violation (conservation, chain, bounds)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (subscriber closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Caller-correctable precondition failure (state untouched, do not retry blindly)
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::InsufficientAmount { .. }
                | Error::InvalidCount
                | Error::UnknownPacket(_)
                | Error::PacketExpired(_)
                | Error::PacketFinished(_)
                | Error::AlreadyClaimed { .. }
                | Error::NotCreator { .. }
                | Error::NotExpired(_)
                | Error::NothingToRefund(_)
        )
    }

    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InsufficientAmount { .. } => "insufficient_amount",
            Error::InvalidCount => "invalid_count",
            Error::UnknownPacket(_) => "unknown_packet",
            Error::PacketExpired(_) => "packet_expired",
            Error::PacketFinished(_) => "packet_finished",
            Error::AlreadyClaimed { .. } => "already_claimed",
            Error::NotCreator { .. } => "not_creator",
            Error::NotExpired(_) => "not_expired",
            Error::NothingToRefund(_) => "nothing_to_refund",
            Error::TransferFailed(_) => "transfer_failed",
            Error::ArithmeticOverflow => "arithmetic_overflow",
            _ => "internal",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
