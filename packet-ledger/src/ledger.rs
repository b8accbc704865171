//! Main ledger orchestration layer
//!
//! This module ties together storage, the split policies, the vault and
//! the event feed into the three packet operations:
//! `create_packet`, `claim` and `refund_expired`.
//!
//! # Concurrency
//!
//! Each packet lives behind its own mutex, so claims on one packet are
//! serialized while claims on different packets never contend. Global
//! `seq` values come from an atomic counter stamped under the packet lock;
//! the RocksDB batch and feed delivery run under that same lock only, so
//! `seq` is unique and increasing per packet, while events of different
//! packets may reach subscribers out of global order.
//!
//! A packet's reserved `seq` values stay in `in_flight` until they are
//! delivered or abandoned by a failed commit. [`Ledger::settled_seq`]
//! reports the bound below which the log will never change again.
//!
//! # Example
//!
//! ```no_run
//! use packet_ledger::{Address, Config, InMemoryVault, Ledger, Money};
//! use std::sync::Arc;
//!
//! fn main() -> packet_ledger::Result<()> {
//!     let vault = Arc::new(InMemoryVault::new());
//!     let alice = Address::new("0xa11ce");
//!     vault.credit(&alice, Money::new(100))?;
//!
//!     let ledger = Ledger::open(Config::default(), vault)?;
//!     let packet_id = ledger.create_packet(&alice, Money::new(100), 4, true, None)?;
//!     let amount = ledger.claim(packet_id, &Address::new("0xb0b"))?;
//!     assert!(amount >= Money::ONE);
//!     Ok(())
//! }
//! ```

use crate::{
    clock::{Clock, SystemClock},
    crypto::{self, hash_event},
    events::{LedgerEvent, LedgerEventKind},
    feed::EventFeed,
    metrics::Metrics,
    random::{EntropyRandom, RandomSource, SeededRandom},
    split,
    storage::{Commit, Storage, StorageStats},
    types::{Address, Claim, Money, Packet, PacketId, PacketStatus},
    vault::Vault,
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Live state of one packet: its record and who already claimed
#[derive(Debug)]
struct PacketSlot {
    packet: Packet,
    claims: HashMap<Address, Claim>,
    /// False while the creating commit is pending or after it failed
    live: bool,
}

/// Main ledger interface
pub struct Ledger {
    /// Packet id -> exclusively locked state
    packets: DashMap<PacketId, Arc<Mutex<PacketSlot>>>,

    /// Durable log and state
    storage: Arc<Storage>,

    /// Next global sequence
    next_seq: AtomicU64,

    /// Packet id -> lowest seq its pending operation may hold
    in_flight: DashMap<PacketId, u64>,

    /// Next packet id
    next_packet_id: AtomicU64,

    /// Live subscribers
    feed: EventFeed,

    /// Value transfers
    vault: Arc<dyn Vault>,

    /// Draws for the random split
    random: Arc<dyn RandomSource>,

    /// Time source for expiry
    clock: Arc<dyn Clock>,

    /// Prometheus metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration, restoring persisted packets and claims
    pub fn open(config: Config, vault: Arc<dyn Vault>) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        let random: Arc<dyn RandomSource> = match config.random.seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(EntropyRandom),
        };

        let mut slots: HashMap<PacketId, PacketSlot> = HashMap::new();
        let mut next_packet_id = 0u64;
        for packet in storage.load_packets()? {
            next_packet_id = next_packet_id.max(packet.id.value() + 1);
            slots.insert(
                packet.id,
                PacketSlot {
                    packet,
                    claims: HashMap::new(),
                    live: true,
                },
            );
        }

        for claim in storage.load_claims()? {
            let slot = slots.get_mut(&claim.packet_id).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "claim by {} references missing packet {}",
                    claim.claimant, claim.packet_id
                ))
            })?;
            slot.claims.insert(claim.claimant.clone(), claim);
        }

        let next_seq = storage.last_seq()?.map_or(0, |seq| seq + 1);

        let escrowed = slots
            .values()
            .try_fold(Money::ZERO, |sum, slot| sum.checked_add(slot.packet.remain_amount))
            .ok_or(Error::ArithmeticOverflow)?;
        vault.restore_escrow(escrowed)?;

        tracing::info!(
            packets = slots.len(),
            next_seq,
            next_packet_id,
            escrowed = %escrowed,
            "Ledger opened"
        );

        let packets = DashMap::with_capacity(slots.len());
        for (id, slot) in slots {
            packets.insert(id, Arc::new(Mutex::new(slot)));
        }

        Ok(Self {
            packets,
            storage,
            next_seq: AtomicU64::new(next_seq),
            in_flight: DashMap::new(),
            next_packet_id: AtomicU64::new(next_packet_id),
            feed: EventFeed::new(),
            vault,
            random,
            clock: Arc::new(SystemClock),
            metrics,
            config,
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the random source
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Receive every event committed from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LedgerEvent> {
        self.feed.subscribe()
    }

    /// Create and fund a packet
    ///
    /// `total_amount` is pulled from `creator` through the vault; no packet
    /// exists unless that transfer happened.
    pub fn create_packet(
        &self,
        creator: &Address,
        total_amount: Money,
        total_count: u32,
        is_random: bool,
        expiration_time: Option<DateTime<Utc>>,
    ) -> Result<PacketId> {
        if total_count == 0 {
            return Err(Error::InvalidCount);
        }
        if total_amount < Money::from(u64::from(total_count)) {
            return Err(Error::InsufficientAmount {
                amount: total_amount,
                count: total_count,
            });
        }

        let now = self.clock.now();
        let packet_id = PacketId::new(self.next_packet_id.fetch_add(1, Ordering::SeqCst));

        let mut packet = Packet {
            id: packet_id,
            creator: creator.clone(),
            total_amount,
            remain_amount: total_amount,
            total_count,
            remain_count: total_count,
            is_random,
            created_at: now,
            expiration_time,
            status: PacketStatus::Active,
            refunded_amount: Money::ZERO,
            packet_seq: 0,
            head_hash: [0u8; 32],
        };
        let created = Self::stage_event(
            &mut packet,
            now,
            LedgerEventKind::PacketCreated {
                creator: creator.clone(),
                total_amount,
                count: total_count,
                is_random,
                expiration_time,
            },
        )?;
        packet.check_invariants()?;

        if let Err(e) = self.vault.deposit(creator, total_amount) {
            tracing::warn!(creator = %creator, amount = %total_amount, error = %e, "Deposit rejected");
            return Err(e);
        }

        // Registered and locked before the event goes out, so a caller
        // reacting to PacketCreated waits here instead of missing the packet
        let slot = Arc::new(Mutex::new(PacketSlot {
            packet,
            claims: HashMap::new(),
            live: false,
        }));
        let mut guard = slot.lock();
        self.packets.insert(packet_id, Arc::clone(&slot));

        if let Err(e) = self.publish(&guard.packet, None, vec![created]) {
            self.packets.remove(&packet_id);
            drop(guard);
            self.compensate(packet_id, "deposit", self.vault.payout(creator, total_amount));
            return Err(e);
        }

        guard.live = true;
        drop(guard);
        self.metrics.record_packet_created();

        tracing::info!(
            packet_id = %packet_id,
            creator = %creator,
            total_amount = %total_amount,
            total_count,
            is_random,
            "Packet created"
        );

        Ok(packet_id)
    }

    /// Claim one share of a packet
    ///
    /// Checks, in order: packet exists, not expired (flipping the status if
    /// the expiration just passed), shares remain, claimant has no prior
    /// share. On success the share is paid out and returned.
    pub fn claim(&self, packet_id: PacketId, claimant: &Address) -> Result<Money> {
        let result = self.try_claim(packet_id, claimant);
        match &result {
            Ok(amount) => self.metrics.record_claim(amount.units()),
            Err(e) => self.metrics.record_claim_rejected(e.reason()),
        }
        result
    }

    fn try_claim(&self, packet_id: PacketId, claimant: &Address) -> Result<Money> {
        let slot = self.slot(packet_id)?;
        let mut slot = slot.lock();
        Self::ensure_live(&slot, packet_id)?;
        let now = self.clock.now();

        match slot.packet.status {
            PacketStatus::Active => {}
            PacketStatus::Finished => return Err(Error::PacketFinished(packet_id)),
            PacketStatus::ExpiredUnrefunded | PacketStatus::Refunded => {
                return Err(Error::PacketExpired(packet_id))
            }
        }

        if slot.packet.is_expired_at(now) {
            self.transition(
                &mut slot,
                now,
                PacketStatus::ExpiredUnrefunded,
                LedgerEventKind::PacketExpired,
            )?;
            tracing::info!(packet_id = %packet_id, "Packet expired");
            return Err(Error::PacketExpired(packet_id));
        }

        if slot.packet.remain_count == 0 {
            self.transition(
                &mut slot,
                now,
                PacketStatus::Finished,
                LedgerEventKind::PacketFinished,
            )?;
            return Err(Error::PacketFinished(packet_id));
        }

        if slot.claims.contains_key(claimant) {
            let mut next = slot.packet.clone();
            let event = Self::stage_event(
                &mut next,
                now,
                LedgerEventKind::AlreadyClaimed {
                    claimer: claimant.clone(),
                },
            )?;
            self.publish(&next, None, vec![event])?;
            slot.packet = next;

            tracing::warn!(packet_id = %packet_id, claimant = %claimant, "Duplicate claim");
            return Err(Error::AlreadyClaimed {
                packet_id,
                claimant: claimant.clone(),
            });
        }

        let seed = crypto::draw_seed(
            packet_id,
            &slot.packet.head_hash,
            claimant,
            slot.packet.packet_seq + 1,
        );
        let amount = split::next_share(
            slot.packet.remain_amount,
            slot.packet.remain_count,
            slot.packet.is_random,
            self.random.as_ref(),
            &seed,
        )?;

        let mut next = slot.packet.clone();
        next.remain_amount = next
            .remain_amount
            .checked_sub(amount)
            .ok_or(Error::ArithmeticOverflow)?;
        next.remain_count -= 1;

        let mut events = vec![Self::stage_event(
            &mut next,
            now,
            LedgerEventKind::PacketClaimed {
                claimer: claimant.clone(),
                amount,
            },
        )?];
        if next.remain_count == 0 {
            next.status = PacketStatus::Finished;
            events.push(Self::stage_event(
                &mut next,
                now,
                LedgerEventKind::PacketFinished,
            )?);
        }
        next.check_invariants()?;

        let claim = Claim {
            packet_id,
            claimant: claimant.clone(),
            amount,
            claimed_at: now,
        };

        if let Err(e) = self.vault.payout(claimant, amount) {
            tracing::warn!(packet_id = %packet_id, claimant = %claimant, error = %e, "Payout rejected");
            return Err(e);
        }

        if let Err(e) = self.publish(&next, Some(&claim), events) {
            self.compensate(packet_id, "payout", self.vault.deposit(claimant, amount));
            return Err(e);
        }

        let finished = next.status == PacketStatus::Finished;
        slot.packet = next;
        slot.claims.insert(claimant.clone(), claim);

        tracing::debug!(
            packet_id = %packet_id,
            claimant = %claimant,
            amount = %amount,
            remain_count = slot.packet.remain_count,
            "Share claimed"
        );
        if finished {
            tracing::info!(packet_id = %packet_id, "Packet finished");
        }

        Ok(amount)
    }

    /// Return the unclaimed remainder of an expired packet to its creator
    pub fn refund_expired(&self, packet_id: PacketId, caller: &Address) -> Result<Money> {
        let slot = self.slot(packet_id)?;
        let mut slot = slot.lock();
        Self::ensure_live(&slot, packet_id)?;
        let now = self.clock.now();

        if slot.packet.creator != *caller {
            return Err(Error::NotCreator {
                packet_id,
                caller: caller.clone(),
            });
        }

        match slot.packet.status {
            PacketStatus::ExpiredUnrefunded => {}
            PacketStatus::Active if slot.packet.is_expired_at(now) => {}
            PacketStatus::Active | PacketStatus::Finished => {
                return Err(Error::NotExpired(packet_id))
            }
            PacketStatus::Refunded => return Err(Error::NothingToRefund(packet_id)),
        }

        let amount = slot.packet.remain_amount;
        if amount.is_zero() {
            return Err(Error::NothingToRefund(packet_id));
        }

        let mut next = slot.packet.clone();
        next.remain_amount = Money::ZERO;
        next.remain_count = 0;
        next.refunded_amount = amount;
        next.status = PacketStatus::Refunded;
        let event = Self::stage_event(&mut next, now, LedgerEventKind::PacketRefunded { amount })?;
        next.check_invariants()?;

        let creator = next.creator.clone();
        if let Err(e) = self.vault.payout(&creator, amount) {
            tracing::warn!(packet_id = %packet_id, creator = %creator, error = %e, "Refund payout rejected");
            return Err(e);
        }

        if let Err(e) = self.publish(&next, None, vec![event]) {
            self.compensate(packet_id, "refund", self.vault.deposit(&creator, amount));
            return Err(e);
        }

        slot.packet = next;
        self.metrics.record_refund();

        tracing::info!(
            packet_id = %packet_id,
            creator = %creator,
            amount = %amount,
            "Packet refunded"
        );

        Ok(amount)
    }

    /// Apply `Active → ExpiredUnrefunded` if the expiration has passed
    pub fn check_expiry(&self, packet_id: PacketId) -> Result<PacketStatus> {
        let slot = self.slot(packet_id)?;
        let mut slot = slot.lock();
        Self::ensure_live(&slot, packet_id)?;
        let now = self.clock.now();

        if slot.packet.status == PacketStatus::Active && slot.packet.is_expired_at(now) {
            self.transition(
                &mut slot,
                now,
                PacketStatus::ExpiredUnrefunded,
                LedgerEventKind::PacketExpired,
            )?;
            tracing::info!(packet_id = %packet_id, "Packet expired");
        }

        Ok(slot.packet.status)
    }

    // Reads

    /// Current packet record
    pub fn get_packet_info(&self, packet_id: PacketId) -> Result<Packet> {
        let slot = self.slot(packet_id)?;
        let slot = slot.lock();
        Self::ensure_live(&slot, packet_id)?;
        Ok(slot.packet.clone())
    }

    /// Whether `address` holds a share of the packet (false for unknown packets)
    pub fn has_claimed(&self, packet_id: PacketId, address: &Address) -> bool {
        self.slot(packet_id)
            .map(|slot| {
                let slot = slot.lock();
                slot.live && slot.claims.contains_key(address)
            })
            .unwrap_or(false)
    }

    /// Claims of one packet, oldest first
    pub fn claims_of(&self, packet_id: PacketId) -> Result<Vec<Claim>> {
        let slot = self.slot(packet_id)?;
        let slot = slot.lock();
        Self::ensure_live(&slot, packet_id)?;
        let mut claims: Vec<Claim> = slot.claims.values().cloned().collect();
        claims.sort_by(|a, b| {
            a.claimed_at
                .cmp(&b.claimed_at)
                .then_with(|| a.claimant.cmp(&b.claimant))
        });
        Ok(claims)
    }

    /// Number of packets ever created
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Every `seq` below this is either in the log or was abandoned by a
    /// failed commit; the log below it will not change again
    pub fn settled_seq(&self) -> u64 {
        let next = self.next_seq.load(Ordering::SeqCst);
        self.in_flight
            .iter()
            .map(|entry| *entry.value())
            .fold(next, u64::min)
    }

    /// Persisted events with `seq >= from`, at most `limit`
    pub fn events_since(&self, from: u64, limit: usize) -> Result<Vec<LedgerEvent>> {
        self.storage.events_since(from, limit)
    }

    /// Full persisted history of one packet
    pub fn packet_events(&self, packet_id: PacketId) -> Result<Vec<LedgerEvent>> {
        self.storage.packet_events(packet_id)
    }

    /// Rebuild a packet from its persisted events (for verification)
    pub fn rebuild_packet(&self, packet_id: PacketId) -> Result<Packet> {
        let events = self.storage.packet_events(packet_id)?;
        crypto::verify_chain(&events)?;

        let (first, rest) = events
            .split_first()
            .ok_or(Error::UnknownPacket(packet_id))?;

        let mut packet = Packet::from_created(first)?;
        for event in rest {
            packet.apply_event(event)?;
        }
        Ok(packet)
    }

    /// Check money conservation for one packet
    ///
    /// Σ(claimed) + remaining + refunded must equal the deposit, both in the
    /// live state and in the replayed history, and the two must agree.
    pub fn check_conservation(&self, packet_id: PacketId) -> Result<bool> {
        let live = self.get_packet_info(packet_id)?;
        let claimed = self
            .claims_of(packet_id)?
            .iter()
            .try_fold(Money::ZERO, |sum, claim| sum.checked_add(claim.amount))
            .ok_or(Error::ArithmeticOverflow)?;

        let accounted = claimed
            .checked_add(live.remain_amount)
            .and_then(|sum| sum.checked_add(live.refunded_amount))
            .ok_or(Error::ArithmeticOverflow)?;

        let rebuilt = self.rebuild_packet(packet_id)?;

        Ok(accounted == live.total_amount && rebuilt == live)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flush storage (for shutdown)
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    // Internals

    fn slot(&self, packet_id: PacketId) -> Result<Arc<Mutex<PacketSlot>>> {
        self.packets
            .get(&packet_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::UnknownPacket(packet_id))
    }

    fn ensure_live(slot: &PacketSlot, packet_id: PacketId) -> Result<()> {
        if slot.live {
            Ok(())
        } else {
            Err(Error::UnknownPacket(packet_id))
        }
    }

    /// Extend a packet's chain with a new event (not yet sequenced)
    fn stage_event(
        packet: &mut Packet,
        now: DateTime<Utc>,
        kind: LedgerEventKind,
    ) -> Result<LedgerEvent> {
        let mut event = LedgerEvent {
            seq: 0,
            packet_id: packet.id,
            packet_seq: packet.packet_seq + 1,
            timestamp: now,
            kind,
            prev_hash: packet.head_hash,
            hash: [0u8; 32],
        };
        event.hash = hash_event(&packet.head_hash, &event)?;

        packet.packet_seq = event.packet_seq;
        packet.head_hash = event.hash;
        Ok(event)
    }

    /// Status-only change with a single event
    fn transition(
        &self,
        slot: &mut PacketSlot,
        now: DateTime<Utc>,
        status: PacketStatus,
        kind: LedgerEventKind,
    ) -> Result<()> {
        let mut next = slot.packet.clone();
        next.status = status;
        let event = Self::stage_event(&mut next, now, kind)?;
        self.publish(&next, None, vec![event])?;
        slot.packet = next;
        Ok(())
    }

    /// Sequence, persist and deliver one operation's events
    ///
    /// Called with the packet's lock held and nothing else.
    fn publish(
        &self,
        packet: &Packet,
        claim: Option<&Claim>,
        mut events: Vec<LedgerEvent>,
    ) -> Result<Vec<LedgerEvent>> {
        let count = events.len() as u64;

        // The floor goes in before the reservation so settled_seq never
        // passes a seq that is taken but not yet registered
        self.in_flight
            .insert(packet.id, self.next_seq.load(Ordering::SeqCst));
        let start = self.next_seq.fetch_add(count, Ordering::SeqCst);
        self.in_flight.insert(packet.id, start);

        for (offset, event) in events.iter_mut().enumerate() {
            event.seq = start + offset as u64;
        }

        let committed = self.storage.commit(&Commit {
            packet,
            claim,
            events: &events,
        });
        if committed.is_ok() {
            self.feed.publish(&events);
        }
        self.in_flight.remove(&packet.id);

        if let Err(e) = committed {
            tracing::warn!(
                packet_id = %packet.id,
                first_seq = start,
                count,
                error = %e,
                "Commit failed, sequence numbers abandoned"
            );
            return Err(e);
        }

        self.metrics.record_events(events.len());
        Ok(events)
    }

    fn compensate(&self, packet_id: PacketId, transfer: &str, result: Result<()>) {
        match result {
            Ok(()) => tracing::error!(
                packet_id = %packet_id,
                transfer,
                "Commit failed, transfer reversed"
            ),
            Err(e) => tracing::error!(
                packet_id = %packet_id,
                transfer,
                error = %e,
                "Commit failed and transfer could not be reversed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventType;
    use crate::random::ScriptedRandom;
    use crate::vault::InMemoryVault;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Harness {
        ledger: Ledger,
        vault: Arc<InMemoryVault>,
        clock: Arc<ManualClock>,
        _temp: TempDir,
    }

    fn harness() -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let vault = Arc::new(InMemoryVault::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Ledger::open(config, vault.clone())
            .unwrap()
            .with_clock(clock.clone());

        Harness {
            ledger,
            vault,
            clock,
            _temp: temp,
        }
    }

    fn funded(vault: &InMemoryVault, name: &str, amount: u128) -> Address {
        let address = Address::new(name);
        vault.credit(&address, Money::new(amount)).unwrap();
        address
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LedgerEvent>) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_equal_split_scenario() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 100);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(100), 4, false, None)
            .unwrap();

        for i in 0..4 {
            let amount = h
                .ledger
                .claim(id, &Address::new(format!("0xc{}", i)))
                .unwrap();
            assert_eq!(amount, Money::new(25));
        }

        let packet = h.ledger.get_packet_info(id).unwrap();
        assert_eq!(packet.status, PacketStatus::Finished);
        assert_eq!(packet.remain_amount, Money::ZERO);
        assert_eq!(packet.remain_count, 0);

        let err = h.ledger.claim(id, &Address::new("0xc9")).unwrap_err();
        assert!(matches!(err, Error::PacketFinished(_)));
        assert_eq!(h.vault.escrow_balance(), Money::ZERO);
        assert_eq!(h.vault.balance_of(&Address::new("0xc3")), Money::new(25));
    }

    #[test]
    fn test_equal_split_last_share_takes_remainder() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 10);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(10), 3, false, None)
            .unwrap();

        let amounts: Vec<Money> = ["0xa", "0xb", "0xc"]
            .iter()
            .map(|who| h.ledger.claim(id, &Address::new(who)).unwrap())
            .collect();
        assert_eq!(amounts, vec![Money::new(3), Money::new(3), Money::new(4)]);
    }

    #[test]
    fn test_single_share_takes_all() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 10);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(10), 1, true, None)
            .unwrap();

        assert_eq!(h.ledger.claim(id, &Address::new("0xb")).unwrap(), Money::new(10));
        let packet = h.ledger.get_packet_info(id).unwrap();
        assert_eq!(packet.remain_count, 0);
        assert_eq!(packet.status, PacketStatus::Finished);
    }

    #[test]
    fn test_random_split_uses_bounds() {
        let h = harness();
        let random = Arc::new(ScriptedRandom::new([1_000, 1]));
        let ledger = h.ledger.with_random(random.clone());
        let alice = funded(&h.vault, "0xalice", 100);
        let id = ledger
            .create_packet(&alice, Money::new(100), 4, true, None)
            .unwrap();

        // Over-large scripted value is clamped to the ceiling 2*25 - 1
        assert_eq!(ledger.claim(id, &Address::new("0xa")).unwrap(), Money::new(49));
        // 51 left over 3 shares: ceiling floor(102/3) - 1 = 33
        assert_eq!(ledger.claim(id, &Address::new("0xb")).unwrap(), Money::new(1));
        assert_eq!(random.ranges(), vec![(1, 49), (1, 33)]);
    }

    #[test]
    fn test_random_split_tight_pool_forces_one() {
        let h = harness();
        let random = Arc::new(ScriptedRandom::new([5, 5, 5]));
        let ledger = h.ledger.with_random(random.clone());
        let alice = funded(&h.vault, "0xalice", 4);
        let id = ledger
            .create_packet(&alice, Money::new(4), 4, true, None)
            .unwrap();

        for who in ["0xa", "0xb", "0xc", "0xd"] {
            assert_eq!(ledger.claim(id, &Address::new(who)).unwrap(), Money::ONE);
        }
        assert_eq!(random.ranges(), vec![(1, 1), (1, 1), (1, 1)]);
    }

    #[test]
    fn test_double_claim_rejected_and_observable() {
        let h = harness();
        let mut rx = h.ledger.subscribe();
        let alice = funded(&h.vault, "0xalice", 100);
        let bob = Address::new("0xbob");
        let id = h
            .ledger
            .create_packet(&alice, Money::new(100), 4, false, None)
            .unwrap();

        h.ledger.claim(id, &bob).unwrap();
        let before = h.ledger.get_packet_info(id).unwrap();

        let err = h.ledger.claim(id, &bob).unwrap_err();
        assert!(matches!(err, Error::AlreadyClaimed { .. }));

        let after = h.ledger.get_packet_info(id).unwrap();
        assert_eq!(after.remain_amount, before.remain_amount);
        assert_eq!(after.remain_count, before.remain_count);
        assert_eq!(after.status, before.status);
        assert!(h.ledger.has_claimed(id, &bob));

        let types: Vec<EventType> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                EventType::PacketCreated,
                EventType::PacketClaimed,
                EventType::AlreadyClaimed
            ]
        );
        assert_eq!(
            h.ledger
                .metrics()
                .claim_rejections
                .with_label_values(&["already_claimed"])
                .get(),
            1
        );
    }

    #[test]
    fn test_create_preconditions() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 100);

        assert!(matches!(
            h.ledger.create_packet(&alice, Money::new(3), 4, false, None),
            Err(Error::InsufficientAmount { .. })
        ));
        assert!(matches!(
            h.ledger.create_packet(&alice, Money::new(3), 0, false, None),
            Err(Error::InvalidCount)
        ));
        assert_eq!(h.ledger.packet_count(), 0);
        assert_eq!(h.vault.balance_of(&alice), Money::new(100));
    }

    #[test]
    fn test_create_without_funds_leaves_no_packet() {
        let h = harness();
        let poor = funded(&h.vault, "0xpoor", 5);

        let err = h
            .ledger
            .create_packet(&poor, Money::new(10), 2, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::TransferFailed(_)));
        assert_eq!(h.ledger.packet_count(), 0);
        assert_eq!(h.ledger.events_since(0, 10).unwrap().len(), 0);
    }

    #[test]
    fn test_unknown_packet() {
        let h = harness();
        assert!(matches!(
            h.ledger.claim(PacketId::new(42), &Address::new("0xb")),
            Err(Error::UnknownPacket(_))
        ));
        assert!(matches!(
            h.ledger.refund_expired(PacketId::new(42), &Address::new("0xb")),
            Err(Error::UnknownPacket(_))
        ));
        assert!(!h.ledger.has_claimed(PacketId::new(42), &Address::new("0xb")));
    }

    #[test]
    fn test_expiry_and_refund_scenario() {
        let h = harness();
        let mut rx = h.ledger.subscribe();
        let alice = funded(&h.vault, "0xalice", 100);
        let expires = h.clock.now() + Duration::minutes(10);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(100), 4, false, Some(expires))
            .unwrap();
        h.ledger.claim(id, &Address::new("0xb")).unwrap();

        // Not yet expired
        assert!(matches!(
            h.ledger.refund_expired(id, &alice),
            Err(Error::NotExpired(_))
        ));

        h.clock.advance(Duration::minutes(11));
        assert!(matches!(
            h.ledger.claim(id, &Address::new("0xc")),
            Err(Error::PacketExpired(_))
        ));
        assert_eq!(
            h.ledger.get_packet_info(id).unwrap().status,
            PacketStatus::ExpiredUnrefunded
        );

        assert!(matches!(
            h.ledger.refund_expired(id, &Address::new("0xb")),
            Err(Error::NotCreator { .. })
        ));

        let refunded = h.ledger.refund_expired(id, &alice).unwrap();
        assert_eq!(refunded, Money::new(75));
        assert_eq!(h.vault.balance_of(&alice), Money::new(75));
        assert_eq!(h.vault.escrow_balance(), Money::ZERO);

        assert!(matches!(
            h.ledger.refund_expired(id, &alice),
            Err(Error::NothingToRefund(_))
        ));

        let packet = h.ledger.get_packet_info(id).unwrap();
        assert_eq!(packet.status, PacketStatus::Refunded);
        assert_eq!(packet.refunded_amount, Money::new(75));
        assert!(h.ledger.check_conservation(id).unwrap());

        let types: Vec<EventType> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                EventType::PacketCreated,
                EventType::PacketClaimed,
                EventType::PacketExpired,
                EventType::PacketRefunded
            ]
        );
    }

    #[test]
    fn test_refund_active_past_expiry() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 50);
        let past = h.clock.now() - Duration::seconds(1);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(50), 5, true, Some(past))
            .unwrap();

        assert_eq!(h.ledger.refund_expired(id, &alice).unwrap(), Money::new(50));
        assert_eq!(
            h.ledger.get_packet_info(id).unwrap().status,
            PacketStatus::Refunded
        );
        assert!(matches!(
            h.ledger.claim(id, &Address::new("0xb")),
            Err(Error::PacketExpired(_))
        ));
    }

    #[test]
    fn test_refund_finished_packet_not_expired() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 10);
        let expires = h.clock.now() + Duration::seconds(5);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(10), 1, false, Some(expires))
            .unwrap();
        h.ledger.claim(id, &Address::new("0xb")).unwrap();

        h.clock.advance(Duration::seconds(10));
        assert!(matches!(
            h.ledger.refund_expired(id, &alice),
            Err(Error::NotExpired(_))
        ));
    }

    #[test]
    fn test_check_expiry() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 10);
        let id_no_expiry = h
            .ledger
            .create_packet(&alice, Money::new(5), 1, false, None)
            .unwrap();
        let id = h
            .ledger
            .create_packet(
                &alice,
                Money::new(5),
                1,
                false,
                Some(h.clock.now() + Duration::seconds(1)),
            )
            .unwrap();

        assert_eq!(h.ledger.check_expiry(id).unwrap(), PacketStatus::Active);
        h.clock.advance(Duration::days(365));
        assert_eq!(
            h.ledger.check_expiry(id).unwrap(),
            PacketStatus::ExpiredUnrefunded
        );
        assert_eq!(
            h.ledger.check_expiry(id_no_expiry).unwrap(),
            PacketStatus::Active
        );
    }

    #[test]
    fn test_ids_monotonic() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 100);
        let a = h.ledger.create_packet(&alice, Money::new(10), 1, false, None).unwrap();
        let b = h.ledger.create_packet(&alice, Money::new(10), 1, false, None).unwrap();
        assert_eq!(a, PacketId::new(0));
        assert_eq!(b, PacketId::new(1));
    }

    #[test]
    fn test_events_sequenced_and_chained() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 100);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(20), 2, false, None)
            .unwrap();
        h.ledger.claim(id, &Address::new("0xa")).unwrap();
        h.ledger.claim(id, &Address::new("0xb")).unwrap();

        let log = h.ledger.events_since(0, 100).unwrap();
        assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let history = h.ledger.packet_events(id).unwrap();
        assert!(crypto::verify_chain(&history).is_ok());
        assert_eq!(history.last().unwrap().event_type(), EventType::PacketFinished);
        assert!(h.ledger.check_conservation(id).unwrap());
    }

    #[test]
    fn test_reopen_restores_state() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let vault = Arc::new(InMemoryVault::new());
        let alice = funded(&vault, "0xalice", 104);
        let bob = Address::new("0xbob");

        let id = {
            let ledger = Ledger::open(config.clone(), vault.clone()).unwrap();
            let id = ledger
                .create_packet(&alice, Money::new(100), 4, false, None)
                .unwrap();
            ledger.claim(id, &bob).unwrap();
            ledger.flush().unwrap();
            id
        };

        let ledger = Ledger::open(config, vault).unwrap();
        assert!(ledger.has_claimed(id, &bob));
        assert!(matches!(
            ledger.claim(id, &bob),
            Err(Error::AlreadyClaimed { .. })
        ));
        assert_eq!(ledger.get_packet_info(id).unwrap().remain_count, 3);

        let next = ledger
            .create_packet(&alice, Money::new(4), 4, false, None)
            .unwrap();
        assert_eq!(next, PacketId::new(1));

        // Sequence continues after the restored log
        let log = ledger.events_since(0, 100).unwrap();
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_reopen_with_fresh_vault_restores_escrow() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let id = {
            let vault = Arc::new(InMemoryVault::new());
            let alice = funded(&vault, "0xalice", 100);
            let ledger = Ledger::open(config.clone(), vault).unwrap();
            let id = ledger
                .create_packet(&alice, Money::new(100), 4, false, None)
                .unwrap();
            ledger.claim(id, &Address::new("0xbob")).unwrap();
            ledger.flush().unwrap();
            id
        };

        let vault = Arc::new(InMemoryVault::new());
        let ledger = Ledger::open(config, vault.clone()).unwrap();
        assert_eq!(vault.escrow_balance(), Money::new(75));

        let carol = Address::new("0xcarol");
        assert_eq!(ledger.claim(id, &carol).unwrap(), Money::new(25));
        assert_eq!(vault.balance_of(&carol), Money::new(25));
        assert_eq!(vault.escrow_balance(), Money::new(50));
    }

    #[test]
    fn test_subscriber_can_claim_on_created_event() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 1_000);
        let ledger = Arc::new(h.ledger);
        let mut rx = ledger.subscribe();

        let claimer = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                let event = rx.blocking_recv().unwrap();
                assert_eq!(event.event_type(), EventType::PacketCreated);
                ledger.claim(event.packet_id, &Address::new("0xbob"))
            })
        };

        let id = ledger
            .create_packet(&alice, Money::new(1_000), 10, false, None)
            .unwrap();
        assert_eq!(claimer.join().unwrap().unwrap(), Money::new(100));
        assert!(ledger.has_claimed(id, &Address::new("0xbob")));
    }

    #[test]
    fn test_settled_seq_stays_below_in_flight() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 100);
        let a = h
            .ledger
            .create_packet(&alice, Money::new(50), 5, false, None)
            .unwrap();
        let b = h
            .ledger
            .create_packet(&alice, Money::new(50), 5, false, None)
            .unwrap();
        assert_eq!(h.ledger.settled_seq(), 2);

        // Packet a mid-commit: its lock is held and seq 2 is reserved
        let slot = h.ledger.slot(a).unwrap();
        let guard = slot.lock();
        h.ledger.in_flight.insert(a, 2);
        h.ledger.next_seq.fetch_add(1, Ordering::SeqCst);

        // Packet b is not held up by it
        h.ledger.claim(b, &Address::new("0xbob")).unwrap();
        assert_eq!(h.ledger.settled_seq(), 2);

        h.ledger.in_flight.remove(&a);
        drop(guard);
        assert_eq!(h.ledger.settled_seq(), 4);

        let seqs: Vec<u64> = h
            .ledger
            .events_since(0, 10)
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 3]);
    }

    #[test]
    fn test_parallel_packets_get_unique_seqs() {
        let h = harness();
        let ledger = Arc::new(h.ledger);
        let vault = h.vault.clone();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                let creator = funded(&vault, &format!("0xcreator{}", i), 40);
                std::thread::spawn(move || {
                    let id = ledger
                        .create_packet(&creator, Money::new(40), 4, true, None)
                        .unwrap();
                    for j in 0..4 {
                        ledger
                            .claim(id, &Address::new(format!("0x{}-{}", i, j)))
                            .unwrap();
                    }
                    id
                })
            })
            .collect();
        let ids: Vec<PacketId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // create + 4 claims + finished per packet
        let log = ledger.events_since(0, 1_000).unwrap();
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..48).collect::<Vec<u64>>());
        assert_eq!(ledger.settled_seq(), 48);

        for id in ids {
            let history = ledger.packet_events(id).unwrap();
            assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
            assert!(crypto::verify_chain(&history).is_ok());
        }
    }

    #[test]
    fn test_concurrent_same_claimant_wins_once() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 1_000);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(1_000), 10, true, None)
            .unwrap();
        let ledger = Arc::new(h.ledger);
        let bob = Address::new("0xbob");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let bob = bob.clone();
                std::thread::spawn(move || ledger.claim(id, &bob).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(ledger.get_packet_info(id).unwrap().remain_count, 9);
    }

    #[test]
    fn test_concurrent_claims_conserve_value() {
        let h = harness();
        let alice = funded(&h.vault, "0xalice", 10_000);
        let id = h
            .ledger
            .create_packet(&alice, Money::new(10_000), 16, true, None)
            .unwrap();
        let ledger = Arc::new(h.ledger);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.claim(id, &Address::new(format!("0x{}", i))))
            })
            .collect();

        let paid = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap().ok())
            .fold(Money::ZERO, |sum, amount| sum.checked_add(amount).unwrap());

        assert_eq!(paid, Money::new(10_000));
        assert_eq!(ledger.claims_of(id).unwrap().len(), 16);
        assert!(ledger.check_conservation(id).unwrap());
        assert_eq!(h.vault.escrow_balance(), Money::ZERO);
    }
}
