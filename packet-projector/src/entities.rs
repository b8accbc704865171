//! Read-model entities

use chrono::{DateTime, Utc};
use packet_ledger::{Address, Money, PacketId, PacketStatus};
use serde::{Deserialize, Serialize};

/// Mirror of a ledger packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEntity {
    /// Packet ID
    pub id: PacketId,
    /// Creator
    pub creator: Address,
    /// Deposited amount
    pub total_amount: Money,
    /// Amount not yet claimed or refunded
    pub remain_amount: Money,
    /// Number of shares
    pub total_count: u32,
    /// Shares not yet claimed
    pub remain_count: u32,
    /// Random split
    pub is_random: bool,
    /// Status as last reported by the ledger
    pub status: PacketStatus,
    /// Finished or refunded; closed for listing
    pub is_finished: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the finishing or refund event
    pub finished_at: Option<DateTime<Utc>>,
    /// Optional expiration
    pub expiration_time: Option<DateTime<Utc>>,
    /// Amount returned to the creator
    pub refunded_amount: Money,
    /// Last applied per-packet sequence
    pub last_seq: u64,
}

impl PacketEntity {
    /// Key of the open-packet index: creation time then id, both order-preserving
    pub fn open_key(&self) -> [u8; 16] {
        let nanos = self.created_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        // Flip the sign bit so negative timestamps sort first
        let time = (nanos as u64) ^ (1 << 63);

        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&time.to_be_bytes());
        key[8..].copy_from_slice(&self.id.to_be_bytes());
        key
    }
}

/// One claim, keyed `"{packet_id}-{claimer}"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEntity {
    /// Composite id
    pub id: String,
    /// Packet
    pub packet_id: PacketId,
    /// Claimer
    pub claimer: Address,
    /// Awarded amount
    pub amount: Money,
    /// When
    pub claimed_at: DateTime<Utc>,
}

impl ClaimEntity {
    /// Composite id of a claim
    pub fn key(packet_id: PacketId, claimer: &Address) -> String {
        format!("{}-{}", packet_id, claimer)
    }
}

/// Per-address aggregates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntity {
    /// Address
    pub address: Address,
    /// Sum of deposits over created packets
    pub total_created: Money,
    /// Sum of claimed shares
    pub total_claimed: Money,
    /// Packets created, by id (creation order)
    pub packets_created: Vec<PacketId>,
}

impl UserEntity {
    /// Empty aggregate for a first reference
    pub fn new(address: Address) -> Self {
        Self {
            address,
            total_created: Money::ZERO,
            total_claimed: Money::ZERO,
            packets_created: Vec::new(),
        }
    }
}

/// Everything one applied event writes
#[derive(Debug, Clone, Default)]
pub struct EntityBatch {
    /// Packets to upsert
    pub packets: Vec<PacketEntity>,
    /// Claims to insert
    pub claims: Vec<ClaimEntity>,
    /// Users to upsert
    pub users: Vec<UserEntity>,
    /// New cursor, if it moved
    pub cursor: Option<u64>,
}

impl EntityBatch {
    /// Nothing to write
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
            && self.claims.is_empty()
            && self.users.is_empty()
            && self.cursor.is_none()
    }
}
