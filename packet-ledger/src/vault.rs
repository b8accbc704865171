//! Value transfer boundary
//!
//! The ledger never moves value itself. It asks a [`Vault`] to pull a
//! deposit into escrow or pay out of escrow, and only makes the matching
//! state change visible once the vault has agreed. A transfer that must be
//! undone (because the durable commit failed) is reversed with the opposite
//! call.

use crate::{
    types::{Address, Money},
    Error, Result,
};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Moves value between accounts and the packet escrow
pub trait Vault: Send + Sync {
    /// Move `amount` from `from` into escrow
    fn deposit(&self, from: &Address, amount: Money) -> Result<()>;

    /// Move `amount` from escrow to `to`
    fn payout(&self, to: &Address, amount: Money) -> Result<()>;

    /// Value still held by the packets restored on open
    ///
    /// Vaults that keep their own books across restarts ignore it.
    fn restore_escrow(&self, _held: Money) -> Result<()> {
        Ok(())
    }
}

/// In-process vault with per-address balances
///
/// Balances live only as long as the process. On open the ledger resets
/// the escrow to what its restored packets hold, so payouts from those
/// packets keep working after a restart; account balances start empty.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    balances: DashMap<Address, Money>,
    escrow: Mutex<Money>,
}

impl InMemoryVault {
    /// Empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Fund an account (outside the ledger, e.g. a faucet)
    pub fn credit(&self, to: &Address, amount: Money) -> Result<()> {
        let mut balance = self.balances.entry(to.clone()).or_insert(Money::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or(Error::ArithmeticOverflow)?;
        Ok(())
    }

    /// Current balance of an account
    pub fn balance_of(&self, address: &Address) -> Money {
        self.balances
            .get(address)
            .map(|balance| *balance)
            .unwrap_or(Money::ZERO)
    }

    /// Value currently held for packets
    pub fn escrow_balance(&self) -> Money {
        *self.escrow.lock()
    }
}

impl Vault for InMemoryVault {
    fn deposit(&self, from: &Address, amount: Money) -> Result<()> {
        let mut escrow = self.escrow.lock();
        let next_escrow = escrow
            .checked_add(amount)
            .ok_or(Error::ArithmeticOverflow)?;

        let mut balance = self.balances.entry(from.clone()).or_insert(Money::ZERO);
        let next_balance = balance.checked_sub(amount).ok_or_else(|| {
            Error::TransferFailed(format!(
                "{} holds {}, cannot deposit {}",
                from, *balance, amount
            ))
        })?;

        *balance = next_balance;
        *escrow = next_escrow;
        Ok(())
    }

    fn payout(&self, to: &Address, amount: Money) -> Result<()> {
        let mut escrow = self.escrow.lock();
        let next_escrow = escrow.checked_sub(amount).ok_or_else(|| {
            Error::TransferFailed(format!(
                "escrow holds {}, cannot pay {}",
                *escrow, amount
            ))
        })?;

        let mut balance = self.balances.entry(to.clone()).or_insert(Money::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or(Error::ArithmeticOverflow)?;
        *escrow = next_escrow;
        Ok(())
    }

    fn restore_escrow(&self, held: Money) -> Result<()> {
        let mut escrow = self.escrow.lock();
        let was = *escrow;
        if was != held {
            tracing::info!(was = %was, now = %held, "Escrow restored from packets");
        }
        *escrow = held;
        Ok(())
    }
}
