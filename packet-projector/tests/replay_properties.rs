//! Property-based tests for projection determinism
//!
//! - Prefix consistency: prefix, restart, suffix == whole log at once
//! - Redelivery: replaying any slice again changes nothing
//! - Per-packet reordering: a shuffled delivery converges to the same state

use chrono::Utc;
use packet_ledger::{
    Address, InMemoryVault, Ledger, LedgerEvent, ManualClock, Money, PacketId, SeededRandom,
};
use packet_projector::{
    Config, EntityStore, MemoryEntityStore, PacketEntity, Projector, UserEntity,
};
use proptest::prelude::*;
use std::sync::Arc;

/// One scripted ledger operation
#[derive(Debug, Clone)]
enum Op {
    Create { creator: u8, amount: u128, count: u32, is_random: bool },
    Claim { packet: u8, claimant: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, 10u128..500, 1u32..6, any::<bool>()).prop_map(
            |(creator, amount, count, is_random)| Op::Create {
                creator,
                amount,
                count,
                is_random,
            }
        ),
        (0u8..6, 0u8..8).prop_map(|(packet, claimant)| Op::Claim { packet, claimant }),
        (0u8..6, 0u8..8).prop_map(|(packet, claimant)| Op::Claim { packet, claimant }),
    ]
}

/// Run the ops against a fresh ledger and return its full log
fn ledger_log(ops: &[Op], seed: u64) -> Vec<LedgerEvent> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = packet_ledger::Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;

    let vault = Arc::new(InMemoryVault::new());
    let ledger = Ledger::open(config, vault.clone())
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(Utc::now())))
        .with_random(Arc::new(SeededRandom::new(seed)));

    let mut created = Vec::new();
    for op in ops {
        match op {
            Op::Create { creator, amount, count, is_random } => {
                let creator = Address::new(format!("0xcreator{}", creator));
                vault.credit(&creator, Money::new(*amount)).unwrap();
                let id = ledger
                    .create_packet(&creator, Money::new(*amount), *count, *is_random, None)
                    .unwrap();
                created.push(id);
            }
            Op::Claim { packet, claimant } => {
                if created.is_empty() {
                    continue;
                }
                let id = created[*packet as usize % created.len()];
                let _ = ledger.claim(id, &Address::new(format!("0xuser{}", claimant)));
            }
        }
    }

    ledger.events_since(0, usize::MAX).unwrap()
}

/// Comparable snapshot of every packet and user in a store
fn snapshot(store: &MemoryEntityStore, log: &[LedgerEvent]) -> (Vec<PacketEntity>, Vec<UserEntity>) {
    let mut ids: Vec<PacketId> = log.iter().map(|e| e.packet_id).collect();
    ids.sort();
    ids.dedup();

    let packets = ids
        .iter()
        .filter_map(|id| store.get_packet(*id).unwrap())
        .collect();

    let mut addresses: Vec<Address> = (0..3)
        .map(|i| Address::new(format!("0xcreator{}", i)))
        .chain((0..8).map(|i| Address::new(format!("0xuser{}", i))))
        .collect();
    addresses.sort();
    let users = addresses
        .iter()
        .filter_map(|a| store.get_user(a).unwrap())
        .collect();

    (packets, users)
}

fn project(events: &[LedgerEvent]) -> Arc<MemoryEntityStore> {
    let store = Arc::new(MemoryEntityStore::new());
    let mut projector = Projector::new(store.clone(), &Config::default()).unwrap();
    for event in events {
        projector.apply(event).unwrap();
    }
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: prefix, restart, suffix gives the same state as the whole log
    #[test]
    fn prop_prefix_consistency(
        ops in prop::collection::vec(op_strategy(), 1..30),
        seed in any::<u64>(),
        split in any::<prop::sample::Index>(),
    ) {
        let log = ledger_log(&ops, seed);
        let whole = project(&log);

        let cut = split.index(log.len() + 1);
        let store = Arc::new(MemoryEntityStore::new());
        {
            let mut first = Projector::new(store.clone(), &Config::default()).unwrap();
            for event in &log[..cut] {
                first.apply(event).unwrap();
            }
        }
        let mut second = Projector::new(store.clone(), &Config::default()).unwrap();
        prop_assert_eq!(second.cursor(), cut as u64);
        for event in &log[cut..] {
            second.apply(event).unwrap();
        }

        prop_assert_eq!(snapshot(&store, &log), snapshot(&whole, &log));
        prop_assert_eq!(store.cursor().unwrap(), log.len() as u64);
    }

    /// Property: redelivering an already applied slice changes nothing
    #[test]
    fn prop_redelivery_idempotent(
        ops in prop::collection::vec(op_strategy(), 1..30),
        seed in any::<u64>(),
        a in any::<prop::sample::Index>(),
        b in any::<prop::sample::Index>(),
    ) {
        let log = ledger_log(&ops, seed);
        let whole = project(&log);

        let (mut lo, mut hi) = (a.index(log.len() + 1), b.index(log.len() + 1));
        if lo > hi {
            std::mem::swap(&mut lo, &mut hi);
        }

        let mut redelivered = log.clone();
        redelivered.extend_from_slice(&log[lo..hi]);
        let store = project(&redelivered);

        prop_assert_eq!(snapshot(&store, &log), snapshot(&whole, &log));
    }

    /// Property: reversed per-packet delivery converges once the gap closes
    #[test]
    fn prop_reordered_delivery_converges(
        ops in prop::collection::vec(op_strategy(), 1..30),
        seed in any::<u64>(),
    ) {
        let log = ledger_log(&ops, seed);
        let whole = project(&log);

        let mut reversed = log.clone();
        reversed.reverse();
        let store = project(&reversed);

        prop_assert_eq!(snapshot(&store, &log), snapshot(&whole, &log));
        prop_assert_eq!(store.cursor().unwrap(), log.len() as u64);
    }
}
