//! Event projection into the read model
//!
//! The projector applies ledger events to an [`EntityStore`] in per-packet
//! order. It never computes amounts; it copies what the ledger recorded.
//!
//! # Ordering
//!
//! - `packet_seq <= last_seq` of the packet: duplicate, ignored
//! - `packet_seq == last_seq + 1`: applied, then any buffered successors
//! - `packet_seq > last_seq + 1`: held until the gap closes
//!
//! An event for a packet the store has never seen has `last_seq == 0`, so a
//! claim that overtakes its `PacketCreated` waits in the buffer as well.
//!
//! # Recovery
//!
//! [`Projector::catch_up`] re-reads the log from the cursor up to the
//! source's settled bound. It fills gaps left by dropped or lost events and
//! steps over `seq` values the ledger abandoned, so the cursor never stays
//! pinned below a hole.

use crate::{
    entities::{ClaimEntity, EntityBatch, PacketEntity, UserEntity},
    source::EventSource,
    store::EntityStore,
    Config, Error, Result,
};
use packet_ledger::{LedgerEvent, LedgerEventKind, Money, PacketId, PacketStatus};
use std::ops::Range;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// What happened to one delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied to the store
    Applied,
    /// Already applied or already buffered
    Duplicate,
    /// Waiting for a predecessor
    Buffered,
    /// Buffer full; event discarded
    Dropped,
    /// In order but after the packet closed; skipped
    Anomalous,
}

/// Projection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectorStats {
    /// Events applied
    pub applied: u64,
    /// Redeliveries ignored
    pub duplicates: u64,
    /// Events that had to wait for a predecessor
    pub buffered: u64,
    /// Events discarded on buffer overflow
    pub dropped: u64,
    /// Events skipped after their packet closed
    pub anomalies: u64,
    /// Sequence numbers the ledger abandoned, stepped over
    pub skipped: u64,
    /// Catch-up passes over the log
    pub resyncs: u64,
    /// Events currently waiting
    pub pending: usize,
    /// Store cursor
    pub cursor: u64,
}

/// Applies ledger events to an entity store
pub struct Projector<S: EntityStore> {
    store: Arc<S>,
    pending: HashMap<PacketId, BTreeMap<u64, LedgerEvent>>,
    max_pending_per_packet: usize,
    /// Next global seq not yet processed
    watermark: u64,
    /// Processed seqs above the watermark
    processed: BTreeSet<u64>,
    stats: ProjectorStats,
}

impl<S: EntityStore> Projector<S> {
    /// Create a projector resuming from the store's cursor
    pub fn new(store: Arc<S>, config: &Config) -> Result<Self> {
        let watermark = store.cursor()?;
        tracing::info!(cursor = watermark, "Projector resuming");

        Ok(Self {
            store,
            pending: HashMap::new(),
            max_pending_per_packet: config.max_pending_per_packet,
            watermark,
            processed: BTreeSet::new(),
            stats: ProjectorStats {
                cursor: watermark,
                ..Default::default()
            },
        })
    }

    /// Backing store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Counters so far
    pub fn stats(&self) -> ProjectorStats {
        self.stats.clone()
    }

    /// Every global seq below this has been processed
    pub fn cursor(&self) -> u64 {
        self.watermark
    }

    /// Something below the newest processed event is still missing
    pub fn has_gap(&self) -> bool {
        !self.processed.is_empty() || self.stats.pending > 0
    }

    /// Processed seqs waiting above the cursor
    pub fn gap_len(&self) -> usize {
        self.processed.len()
    }

    /// Replay the persisted log from the cursor up to the settled bound
    ///
    /// Returns the number of events read back. Every `seq` below the bound
    /// that the log does not hold is counted as skipped.
    pub fn catch_up<E>(&mut self, source: &E, page: usize) -> Result<usize>
    where
        E: EventSource + ?Sized,
    {
        let page = page.max(1);
        let settled = source.settled_seq();
        let mut from = self.watermark;
        let mut replayed = 0;

        while from < settled {
            let events = source.events_since(from, page)?;
            let exhausted = events.len() < page;
            let mut next = from;
            let mut reached = false;

            for event in &events {
                if event.seq >= settled {
                    reached = true;
                    break;
                }
                self.skip(next..event.seq)?;
                self.apply(event)?;
                replayed += 1;
                next = event.seq + 1;
            }

            if exhausted || reached {
                self.skip(next..settled)?;
                break;
            }
            from = next;
        }

        self.stats.resyncs += 1;
        tracing::info!(replayed, settled, cursor = self.watermark, "Projector caught up");
        Ok(replayed)
    }

    /// Step over seqs the log will never hold
    fn skip(&mut self, seqs: Range<u64>) -> Result<()> {
        for seq in seqs {
            if seq < self.watermark || self.processed.contains(&seq) {
                continue;
            }
            self.stats.skipped += 1;
            tracing::warn!(seq, "Abandoned sequence number skipped");
            self.commit_progress(seq, EntityBatch::default())?;
        }
        Ok(())
    }

    /// Deliver one event
    pub fn apply(&mut self, event: &LedgerEvent) -> Result<ApplyOutcome> {
        let last_seq = self.last_seq(event.packet_id)?;

        if event.packet_seq <= last_seq {
            self.stats.duplicates += 1;
            self.commit_progress(event.seq, EntityBatch::default())?;
            tracing::debug!(
                seq = event.seq,
                packet_id = %event.packet_id,
                packet_seq = event.packet_seq,
                "Duplicate event ignored"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        if event.packet_seq > last_seq + 1 {
            return Ok(self.hold(event));
        }

        let outcome = self.apply_in_order(event)?;
        self.drain_pending(event.packet_id)?;
        Ok(outcome)
    }

    fn hold(&mut self, event: &LedgerEvent) -> ApplyOutcome {
        let queue = self.pending.entry(event.packet_id).or_default();

        if queue.contains_key(&event.packet_seq) {
            self.stats.duplicates += 1;
            return ApplyOutcome::Duplicate;
        }

        if queue.len() >= self.max_pending_per_packet {
            self.stats.dropped += 1;
            tracing::warn!(
                seq = event.seq,
                packet_id = %event.packet_id,
                packet_seq = event.packet_seq,
                "Pending buffer full, event dropped"
            );
            return ApplyOutcome::Dropped;
        }

        queue.insert(event.packet_seq, event.clone());
        self.stats.buffered += 1;
        self.stats.pending += 1;
        tracing::warn!(
            seq = event.seq,
            packet_id = %event.packet_id,
            packet_seq = event.packet_seq,
            "Event ahead of its predecessor, buffered"
        );
        ApplyOutcome::Buffered
    }

    fn drain_pending(&mut self, packet_id: PacketId) -> Result<()> {
        loop {
            let next_seq = self.last_seq(packet_id)? + 1;
            let Some(queue) = self.pending.get_mut(&packet_id) else {
                return Ok(());
            };

            // Entries below the next seq were applied from a redelivered copy
            let stale: Vec<u64> = queue.range(..next_seq).map(|(seq, _)| *seq).collect();
            for seq in stale {
                queue.remove(&seq);
                self.stats.pending -= 1;
            }

            let next = queue.remove(&next_seq);
            if queue.is_empty() {
                self.pending.remove(&packet_id);
            }

            match next {
                Some(event) => {
                    self.stats.pending -= 1;
                    self.apply_in_order(&event)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn apply_in_order(&mut self, event: &LedgerEvent) -> Result<ApplyOutcome> {
        let current = self.store.get_packet(event.packet_id)?;
        let mut batch = EntityBatch::default();

        let outcome = match (&event.kind, current) {
            (
                LedgerEventKind::PacketCreated {
                    creator,
                    total_amount,
                    count,
                    is_random,
                    expiration_time,
                },
                None,
            ) => {
                batch.packets.push(PacketEntity {
                    id: event.packet_id,
                    creator: creator.clone(),
                    total_amount: *total_amount,
                    remain_amount: *total_amount,
                    total_count: *count,
                    remain_count: *count,
                    is_random: *is_random,
                    status: PacketStatus::Active,
                    is_finished: false,
                    created_at: event.timestamp,
                    finished_at: None,
                    expiration_time: *expiration_time,
                    refunded_amount: Money::ZERO,
                    last_seq: event.packet_seq,
                });

                let mut user = self.user(creator)?;
                user.total_created = user
                    .total_created
                    .checked_add(*total_amount)
                    .ok_or_else(|| overflow(event))?;
                if let Err(pos) = user.packets_created.binary_search(&event.packet_id) {
                    user.packets_created.insert(pos, event.packet_id);
                }
                batch.users.push(user);
                ApplyOutcome::Applied
            }

            (_, Some(mut packet)) if packet.is_finished => {
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);
                ApplyOutcome::Anomalous
            }

            (LedgerEventKind::PacketClaimed { claimer, amount }, Some(mut packet)) => {
                packet.remain_amount = packet
                    .remain_amount
                    .checked_sub(*amount)
                    .ok_or_else(|| overflow(event))?;
                packet.remain_count = packet
                    .remain_count
                    .checked_sub(1)
                    .ok_or_else(|| overflow(event))?;
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);

                batch.claims.push(ClaimEntity {
                    id: ClaimEntity::key(event.packet_id, claimer),
                    packet_id: event.packet_id,
                    claimer: claimer.clone(),
                    amount: *amount,
                    claimed_at: event.timestamp,
                });

                let mut user = self.user(claimer)?;
                user.total_claimed = user
                    .total_claimed
                    .checked_add(*amount)
                    .ok_or_else(|| overflow(event))?;
                batch.users.push(user);
                ApplyOutcome::Applied
            }

            (LedgerEventKind::PacketFinished, Some(mut packet)) => {
                packet.is_finished = true;
                packet.status = PacketStatus::Finished;
                packet.finished_at = Some(event.timestamp);
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);
                ApplyOutcome::Applied
            }

            (LedgerEventKind::PacketExpired, Some(mut packet)) => {
                packet.status = PacketStatus::ExpiredUnrefunded;
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);
                ApplyOutcome::Applied
            }

            (LedgerEventKind::PacketRefunded { amount }, Some(mut packet)) => {
                packet.remain_amount = packet
                    .remain_amount
                    .checked_sub(*amount)
                    .ok_or_else(|| overflow(event))?;
                packet.remain_count = 0;
                packet.refunded_amount = *amount;
                packet.is_finished = true;
                packet.status = PacketStatus::Refunded;
                packet.finished_at = Some(event.timestamp);
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);
                ApplyOutcome::Applied
            }

            (LedgerEventKind::AlreadyClaimed { .. }, Some(mut packet)) => {
                packet.last_seq = event.packet_seq;
                batch.packets.push(packet);
                ApplyOutcome::Applied
            }

            // PacketCreated over an existing packet, or anything else at
            // packet_seq 1: the log is inconsistent for this packet
            (_, current) => {
                if let Some(mut packet) = current {
                    packet.last_seq = event.packet_seq;
                    batch.packets.push(packet);
                }
                ApplyOutcome::Anomalous
            }
        };

        match outcome {
            ApplyOutcome::Anomalous => {
                self.stats.anomalies += 1;
                tracing::warn!(
                    seq = event.seq,
                    packet_id = %event.packet_id,
                    event_type = %event.event_type(),
                    "Anomalous event skipped"
                );
            }
            _ => {
                self.stats.applied += 1;
                tracing::debug!(
                    seq = event.seq,
                    packet_id = %event.packet_id,
                    event_type = %event.event_type(),
                    "Event applied"
                );
            }
        }

        self.commit_progress(event.seq, batch)?;
        Ok(outcome)
    }

    /// Commit an event's writes together with any cursor movement
    fn commit_progress(&mut self, seq: u64, mut batch: EntityBatch) -> Result<()> {
        if seq >= self.watermark {
            self.processed.insert(seq);
            let before = self.watermark;
            while self.processed.remove(&self.watermark) {
                self.watermark += 1;
            }
            if self.watermark != before {
                batch.cursor = Some(self.watermark);
                self.stats.cursor = self.watermark;
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.store.commit(&batch)
    }

    fn last_seq(&self, packet_id: PacketId) -> Result<u64> {
        Ok(self
            .store
            .get_packet(packet_id)?
            .map_or(0, |packet| packet.last_seq))
    }

    fn user(&self, address: &packet_ledger::Address) -> Result<UserEntity> {
        Ok(self
            .store
            .get_user(address)?
            .unwrap_or_else(|| UserEntity::new(address.clone())))
    }
}

fn overflow(event: &LedgerEvent) -> Error {
    Error::Ledger(packet_ledger::Error::InvariantViolation(format!(
        "event {} underflows packet {}",
        event.seq, event.packet_id
    )))
}
