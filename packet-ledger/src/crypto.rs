//! Hashing for the per-packet audit chain
//!
//! This module provides:
//! - SHA-256 chaining of a packet's events (tamper evidence for the log)
//! - Chain verification for replayed histories
//! - Per-claim seeds for the random split

use crate::{
    events::LedgerEvent,
    types::{Address, PacketId},
    Error, Result,
};
use sha2::{Digest, Sha256};

/// Hash an event on top of its predecessor
pub fn hash_event(prev_hash: &[u8; 32], event: &LedgerEvent) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(event.canonical_bytes()?);
    Ok(hasher.finalize().into())
}

/// Verify a packet history: contiguous `packet_seq` and an unbroken hash chain
pub fn verify_chain(events: &[LedgerEvent]) -> Result<()> {
    let mut prev_hash = [0u8; 32];
    let mut expected_seq = 1u64;

    for event in events {
        if event.packet_seq != expected_seq {
            return Err(Error::InvariantViolation(format!(
                "packet {}: expected packet_seq {}, found {}",
                event.packet_id, expected_seq, event.packet_seq
            )));
        }
        if event.prev_hash != prev_hash {
            return Err(Error::InvariantViolation(format!(
                "packet {}: broken chain at packet_seq {}",
                event.packet_id, event.packet_seq
            )));
        }
        if hash_event(&prev_hash, event)? != event.hash {
            return Err(Error::InvariantViolation(format!(
                "packet {}: hash mismatch at packet_seq {}",
                event.packet_id, event.packet_seq
            )));
        }

        prev_hash = event.hash;
        expected_seq += 1;
    }

    Ok(())
}

/// Seed for one claim's random draw
///
/// Bound to the packet's chain head, so two claims never share a seed even
/// for the same claimant on different packets.
pub fn draw_seed(
    packet_id: PacketId,
    head_hash: &[u8; 32],
    claimant: &Address,
    packet_seq: u64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(packet_id.to_be_bytes());
    hasher.update(head_hash);
    hasher.update(claimant.as_str().as_bytes());
    hasher.update(packet_seq.to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LedgerEventKind;
    use crate::types::Money;
    use chrono::Utc;

    fn chain(kinds: Vec<LedgerEventKind>) -> Vec<LedgerEvent> {
        let mut prev_hash = [0u8; 32];
        let mut events = Vec::new();

        for (i, kind) in kinds.into_iter().enumerate() {
            let mut event = LedgerEvent {
                seq: i as u64,
                packet_id: PacketId::new(1),
                packet_seq: i as u64 + 1,
                timestamp: Utc::now(),
                kind,
                prev_hash,
                hash: [0u8; 32],
            };
            event.hash = hash_event(&prev_hash, &event).unwrap();
            prev_hash = event.hash;
            events.push(event);
        }

        events
    }

    fn history() -> Vec<LedgerEvent> {
        chain(vec![
            LedgerEventKind::PacketCreated {
                creator: Address::new("0xa"),
                total_amount: Money::new(10),
                count: 1,
                is_random: false,
                expiration_time: None,
            },
            LedgerEventKind::PacketClaimed {
                claimer: Address::new("0xb"),
                amount: Money::new(10),
            },
            LedgerEventKind::PacketFinished,
        ])
    }

    #[test]
    fn test_valid_chain() {
        assert!(verify_chain(&history()).is_ok());
    }

    #[test]
    fn test_tampered_amount_detected() {
        let mut events = history();
        events[1].kind = LedgerEventKind::PacketClaimed {
            claimer: Address::new("0xb"),
            amount: Money::new(9),
        };
        assert!(verify_chain(&events).is_err());
    }

    #[test]
    fn test_gap_detected() {
        let mut events = history();
        events.remove(1);
        assert!(verify_chain(&events).is_err());
    }

    #[test]
    fn test_draw_seed_varies() {
        let head = [7u8; 32];
        let a = draw_seed(PacketId::new(1), &head, &Address::new("0xa"), 2);
        let b = draw_seed(PacketId::new(1), &head, &Address::new("0xb"), 2);
        let c = draw_seed(PacketId::new(2), &head, &Address::new("0xa"), 2);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, draw_seed(PacketId::new(1), &head, &Address::new("0xA"), 2));
    }
}
