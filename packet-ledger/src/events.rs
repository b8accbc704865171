//! Domain events emitted by the ledger
//!
//! Every successful operation (and the observable side effects of some
//! failed ones) appends one or more events. Events are totally ordered by
//! `seq`; within one packet they are also numbered contiguously by
//! `packet_seq`, starting at 1 with `PacketCreated`.

use crate::types::{Address, Money, PacketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger event envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Global position in the log
    pub seq: u64,

    /// Packet this event belongs to
    pub packet_id: PacketId,

    /// Position within the packet's own history (1-based, contiguous)
    pub packet_seq: u64,

    /// Event timestamp (ledger clock)
    pub timestamp: DateTime<Utc>,

    /// Payload
    pub kind: LedgerEventKind,

    /// Hash of the previous event of this packet (zero for `PacketCreated`)
    pub prev_hash: [u8; 32],

    /// Hash of this event, chained on `prev_hash`
    pub hash: [u8; 32],
}

impl LedgerEvent {
    /// Event type tag
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Claimant carried by the event, if any
    pub fn claimant(&self) -> Option<&Address> {
        match &self.kind {
            LedgerEventKind::PacketClaimed { claimer, .. }
            | LedgerEventKind::AlreadyClaimed { claimer } => Some(claimer),
            _ => None,
        }
    }

    /// Redelivery identity of the event
    pub fn key(&self) -> EventKey {
        EventKey {
            packet_id: self.packet_id,
            event_type: self.event_type(),
            claimant: self.claimant().cloned(),
            packet_seq: self.packet_seq,
        }
    }

    /// Deterministic bytes covered by the hash chain
    ///
    /// `seq` is excluded: it is assigned when the event is appended to the
    /// global log, after the per-packet chain has been extended.
    pub fn canonical_bytes(&self) -> crate::Result<Vec<u8>> {
        let body = (
            self.packet_id,
            self.packet_seq,
            self.timestamp.timestamp_nanos_opt().unwrap_or(0),
            &self.kind,
        );
        Ok(bincode::serialize(&body)?)
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEventKind {
    /// Packet created and funded
    PacketCreated {
        /// Creator (and refund recipient)
        creator: Address,
        /// Deposited amount
        total_amount: Money,
        /// Number of shares
        count: u32,
        /// Random split
        is_random: bool,
        /// Optional expiration
        expiration_time: Option<DateTime<Utc>>,
    },

    /// One share awarded
    PacketClaimed {
        /// Claimant
        claimer: Address,
        /// Amount awarded
        amount: Money,
    },

    /// Last share awarded
    PacketFinished,

    /// Claimant tried a second time (no state change)
    AlreadyClaimed {
        /// Claimant
        claimer: Address,
    },

    /// Expiration observed; remainder awaits refund
    PacketExpired,

    /// Remainder returned to the creator
    PacketRefunded {
        /// Refunded amount
        amount: Money,
    },
}

impl LedgerEventKind {
    /// Event type tag
    pub fn event_type(&self) -> EventType {
        match self {
            LedgerEventKind::PacketCreated { .. } => EventType::PacketCreated,
            LedgerEventKind::PacketClaimed { .. } => EventType::PacketClaimed,
            LedgerEventKind::PacketFinished => EventType::PacketFinished,
            LedgerEventKind::AlreadyClaimed { .. } => EventType::AlreadyClaimed,
            LedgerEventKind::PacketExpired => EventType::PacketExpired,
            LedgerEventKind::PacketRefunded { .. } => EventType::PacketRefunded,
        }
    }
}

/// Event type (state transition)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Packet created
    PacketCreated = 1,
    /// Share claimed
    PacketClaimed = 2,
    /// All shares claimed
    PacketFinished = 3,
    /// Duplicate claim attempt
    AlreadyClaimed = 4,
    /// Expiration observed
    PacketExpired = 5,
    /// Remainder refunded
    PacketRefunded = 6,
}

impl EventType {
    /// Event name as it appears in the external event schema
    pub fn name(&self) -> &'static str {
        match self {
            EventType::PacketCreated => "PacketCreated",
            EventType::PacketClaimed => "PacketClaimed",
            EventType::PacketFinished => "PacketFinished",
            EventType::AlreadyClaimed => "AlreadyClaimed",
            EventType::PacketExpired => "PacketExpired",
            EventType::PacketRefunded => "PacketRefunded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of an event for duplicate detection:
/// `(packetId, eventKind, claimant-or-none, sequence number)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// Packet
    pub packet_id: PacketId,
    /// Kind
    pub event_type: EventType,
    /// Claimant for claim-related events
    pub claimant: Option<Address>,
    /// Per-packet sequence
    pub packet_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(packet_seq: u64) -> LedgerEvent {
        LedgerEvent {
            seq: 10,
            packet_id: PacketId::new(3),
            packet_seq,
            timestamp: Utc::now(),
            kind: LedgerEventKind::PacketClaimed {
                claimer: Address::new("0xBob"),
                amount: Money::new(25),
            },
            prev_hash: [0u8; 32],
            hash: [0u8; 32],
        }
    }

    #[test]
    fn test_event_key() {
        let event = claimed(2);
        let key = event.key();
        assert_eq!(key.packet_id, PacketId::new(3));
        assert_eq!(key.event_type, EventType::PacketClaimed);
        assert_eq!(key.claimant, Some(Address::new("0xbob")));
        assert_eq!(key.packet_seq, 2);
        assert_ne!(key, claimed(3).key());
    }

    #[test]
    fn test_canonical_bytes_ignore_global_seq() {
        let a = claimed(2);
        let mut b = a.clone();
        b.seq = 99;
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventType::PacketClaimed.to_string(), "PacketClaimed");
        assert_eq!(
            LedgerEventKind::PacketRefunded { amount: Money::ONE }.event_type(),
            EventType::PacketRefunded
        );
    }
}
