//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact integer arithmetic (no floating point anywhere near money)
//! - Cheap cloning so the ledger can stage a mutation before committing it

use crate::events::{LedgerEvent, LedgerEventKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest indivisible unit of value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u128);

impl Money {
    /// Zero units
    pub const ZERO: Money = Money(0);

    /// One unit
    pub const ONE: Money = Money(1);

    /// Create from raw units
    pub const fn new(units: u128) -> Self {
        Self(units)
    }

    /// Raw units
    pub const fn units(self) -> u128 {
        self.0
    }

    /// True when no value is left
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    /// Checked subtraction
    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    /// Floor division by a share count (`None` for zero shares)
    pub fn checked_div_count(self, count: u32) -> Option<Money> {
        self.0.checked_div(u128::from(count)).map(Money)
    }

    /// Express in whole units with `scale` decimal places, e.g. wei → ETH with 18
    ///
    /// Returns `None` if the value does not fit a 96-bit decimal mantissa.
    pub fn to_decimal(self, scale: u32) -> Option<Decimal> {
        let units = i128::try_from(self.0).ok()?;
        Decimal::try_from_i128_with_scale(units, scale)
            .ok()
            .map(|d| d.normalize())
    }
}

impl From<u64> for Money {
    fn from(units: u64) -> Self {
        Self(u128::from(units))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Claimant / creator identity (wallet address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create a new address. Addresses compare case-insensitively.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_lowercase())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet identifier, allocated monotonically from zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(u64);

impl PacketId {
    /// Create from raw value
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Big-endian key bytes (sort order == id order)
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketStatus {
    /// Open for claims
    Active = 1,
    /// Every share claimed (terminal)
    Finished = 2,
    /// Expiration passed, remainder still held
    ExpiredUnrefunded = 3,
    /// Remainder returned to creator (terminal)
    Refunded = 4,
}

impl PacketStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, PacketStatus::Finished | PacketStatus::Refunded)
    }

    /// Stable name for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketStatus::Active => "active",
            PacketStatus::Finished => "finished",
            PacketStatus::ExpiredUnrefunded => "expired_unrefunded",
            PacketStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distribution pool, as owned by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet ID
    pub id: PacketId,

    /// Creator identity
    pub creator: Address,

    /// Amount deposited at creation
    pub total_amount: Money,

    /// Amount not yet claimed or refunded
    pub remain_amount: Money,

    /// Number of shares
    pub total_count: u32,

    /// Shares not yet claimed
    pub remain_count: u32,

    /// Double-average random split instead of equal split
    pub is_random: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Optional expiration
    pub expiration_time: Option<DateTime<Utc>>,

    /// Current status
    pub status: PacketStatus,

    /// Amount returned to the creator by a refund
    pub refunded_amount: Money,

    /// Per-packet sequence of the last emitted event
    pub packet_seq: u64,

    /// Hash of the last emitted event (head of the per-packet chain)
    pub head_hash: [u8; 32],
}

impl Packet {
    /// Check whether the expiration has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map_or(false, |expiry| now >= expiry)
    }

    /// Amount handed out to claimants so far
    pub fn claimed_amount(&self) -> Option<Money> {
        self.total_amount
            .checked_sub(self.remain_amount)?
            .checked_sub(self.refunded_amount)
    }

    /// Verify the structural invariants of a packet
    pub fn check_invariants(&self) -> crate::Result<()> {
        let violation = |msg: &str| {
            Err(crate::Error::InvariantViolation(format!(
                "packet {}: {}",
                self.id, msg
            )))
        };

        if self.total_count == 0 {
            return violation("total_count is zero");
        }
        if self.total_amount < Money::from(u64::from(self.total_count)) {
            return violation("total_amount below total_count");
        }
        if self.remain_amount > self.total_amount {
            return violation("remain_amount exceeds total_amount");
        }
        if self.remain_count > self.total_count {
            return violation("remain_count exceeds total_count");
        }
        if self.remain_count == 0 && !self.remain_amount.is_zero() {
            return violation("value stranded with no shares left");
        }
        if self.remain_amount.is_zero() && self.remain_count != 0 {
            return violation("shares left with no value");
        }
        if self.remain_amount < Money::from(u64::from(self.remain_count)) {
            return violation("remaining shares cannot each receive one unit");
        }
        if self.claimed_amount().is_none() {
            return violation("refunded + remaining exceeds total");
        }

        Ok(())
    }

    /// Rebuild a packet from its `PacketCreated` event
    pub fn from_created(event: &LedgerEvent) -> crate::Result<Self> {
        match &event.kind {
            LedgerEventKind::PacketCreated {
                creator,
                total_amount,
                count,
                is_random,
                expiration_time,
            } => Ok(Self {
                id: event.packet_id,
                creator: creator.clone(),
                total_amount: *total_amount,
                remain_amount: *total_amount,
                total_count: *count,
                remain_count: *count,
                is_random: *is_random,
                created_at: event.timestamp,
                expiration_time: *expiration_time,
                status: PacketStatus::Active,
                refunded_amount: Money::ZERO,
                packet_seq: event.packet_seq,
                head_hash: event.hash,
            }),
            other => Err(crate::Error::InvalidEvent(format!(
                "packet {} history starts with {:?}",
                event.packet_id,
                other.event_type()
            ))),
        }
    }

    /// Apply a subsequent event to derive the next state
    pub fn apply_event(&mut self, event: &LedgerEvent) -> crate::Result<()> {
        if event.packet_id != self.id {
            return Err(crate::Error::InvalidEvent(
                "Event packet_id mismatch".to_string(),
            ));
        }
        if event.packet_seq != self.packet_seq + 1 {
            return Err(crate::Error::InvalidEvent(format!(
                "packet {} expected seq {}, got {}",
                self.id,
                self.packet_seq + 1,
                event.packet_seq
            )));
        }

        match &event.kind {
            LedgerEventKind::PacketCreated { .. } => {
                return Err(crate::Error::InvalidEvent(format!(
                    "packet {} created twice",
                    self.id
                )));
            }
            LedgerEventKind::PacketClaimed { amount, .. } => {
                self.remain_amount = self
                    .remain_amount
                    .checked_sub(*amount)
                    .ok_or(crate::Error::ArithmeticOverflow)?;
                self.remain_count = self
                    .remain_count
                    .checked_sub(1)
                    .ok_or(crate::Error::ArithmeticOverflow)?;
            }
            LedgerEventKind::PacketFinished => self.status = PacketStatus::Finished,
            LedgerEventKind::PacketExpired => self.status = PacketStatus::ExpiredUnrefunded,
            LedgerEventKind::PacketRefunded { amount } => {
                self.refunded_amount = *amount;
                self.remain_amount = self
                    .remain_amount
                    .checked_sub(*amount)
                    .ok_or(crate::Error::ArithmeticOverflow)?;
                self.remain_count = 0;
                self.status = PacketStatus::Refunded;
            }
            LedgerEventKind::AlreadyClaimed { .. } => {}
        }

        self.packet_seq = event.packet_seq;
        self.head_hash = event.hash;
        Ok(())
    }
}

/// One successful award of value to one claimant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Packet the share came from
    pub packet_id: PacketId,

    /// Who received it
    pub claimant: Address,

    /// Amount awarded
    pub amount: Money,

    /// When
    pub claimed_at: DateTime<Utc>,
}
