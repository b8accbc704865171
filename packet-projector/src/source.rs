//! Where the projector re-reads the ledger log

use packet_ledger::{Ledger, LedgerEvent};

/// Read access to the persisted event log
///
/// The live feed can lose events (buffer overflow, a failed apply, a
/// subscription that started late). Anything missed is fetched again from
/// here, starting at the projector's cursor.
pub trait EventSource: Send + Sync {
    /// Persisted events with `seq >= from`, in `seq` order, at most `limit`
    fn events_since(&self, from: u64, limit: usize) -> packet_ledger::Result<Vec<LedgerEvent>>;

    /// Every `seq` below this is either persisted or will never exist
    fn settled_seq(&self) -> u64;
}

impl EventSource for Ledger {
    fn events_since(&self, from: u64, limit: usize) -> packet_ledger::Result<Vec<LedgerEvent>> {
        Ledger::events_since(self, from, limit)
    }

    fn settled_seq(&self) -> u64 {
        Ledger::settled_seq(self)
    }
}
