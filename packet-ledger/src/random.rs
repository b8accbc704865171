//! Randomness as an injected capability
//!
//! The ledger asks a [`RandomSource`] for one uniform draw per random-split
//! claim, passing a per-claim seed. Implementations decide how much of the
//! seed to honour:
//!
//! - [`SeededRandom`] is fully deterministic (seed + configured base seed)
//! - [`EntropyRandom`] mixes the seed with thread-local entropy
//! - [`ScriptedRandom`] replays a fixed sequence, for tests

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Source of uniformly distributed integers
pub trait RandomSource: Send + Sync {
    /// Draw uniformly from the inclusive range `[low, high]` (`low <= high`)
    fn draw(&self, seed: &[u8; 32], low: u128, high: u128) -> u128;
}

/// Deterministic source: the same base seed and claim seed always give the same draw
#[derive(Debug, Clone)]
pub struct SeededRandom {
    base_seed: u64,
}

impl SeededRandom {
    /// Create with a base seed
    pub fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }
}

impl RandomSource for SeededRandom {
    fn draw(&self, seed: &[u8; 32], low: u128, high: u128) -> u128 {
        let mut hasher = Sha256::new();
        hasher.update(self.base_seed.to_be_bytes());
        hasher.update(seed);
        let mut rng = StdRng::from_seed(hasher.finalize().into());
        rng.gen_range(low..=high)
    }
}

/// Non-reproducible source backed by the thread-local generator
#[derive(Debug, Clone, Copy, Default)]
pub struct EntropyRandom;

impl RandomSource for EntropyRandom {
    fn draw(&self, seed: &[u8; 32], low: u128, high: u128) -> u128 {
        let mut material = *seed;
        let noise: [u8; 32] = rand::thread_rng().gen();
        for (byte, extra) in material.iter_mut().zip(noise.iter()) {
            *byte ^= extra;
        }
        StdRng::from_seed(material).gen_range(low..=high)
    }
}

/// Replays a scripted sequence of values, clamped into the requested range
///
/// Once the script runs out every draw returns `low`. Each requested range
/// is recorded so tests can assert on the bounds the ledger computed.
#[derive(Debug, Default)]
pub struct ScriptedRandom {
    values: Mutex<VecDeque<u128>>,
    ranges: Mutex<Vec<(u128, u128)>>,
}

impl ScriptedRandom {
    /// Create from a sequence of values
    pub fn new(values: impl IntoIterator<Item = u128>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Ranges requested so far, in order
    pub fn ranges(&self) -> Vec<(u128, u128)> {
        self.ranges.lock().clone()
    }
}

impl RandomSource for ScriptedRandom {
    fn draw(&self, _seed: &[u8; 32], low: u128, high: u128) -> u128 {
        self.ranges.lock().push((low, high));
        self.values
            .lock()
            .pop_front()
            .map_or(low, |value| value.clamp(low, high))
    }
}
