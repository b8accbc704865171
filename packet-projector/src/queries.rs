//! Read queries over the projected entities

use crate::{
    entities::{PacketEntity, UserEntity},
    store::EntityStore,
    Error, Result,
};
use packet_ledger::{Address, PacketId};
use std::sync::Arc;

/// Query surface for listing and inspecting packets
#[derive(Debug)]
pub struct ReadModel<S: EntityStore> {
    store: Arc<S>,
    list_limit: usize,
}

impl<S: EntityStore> Clone for ReadModel<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            list_limit: self.list_limit,
        }
    }
}

impl<S: EntityStore> ReadModel<S> {
    /// Create over a store, listing `list_limit` packets by default
    pub fn new(store: Arc<S>, list_limit: usize) -> Self {
        Self { store, list_limit }
    }

    /// Point lookup
    pub fn get_packet_info(&self, packet_id: PacketId) -> Result<PacketEntity> {
        self.store
            .get_packet(packet_id)?
            .ok_or_else(|| Error::NotFound(format!("packet {}", packet_id)))
    }

    /// Whether `address` holds a share of the packet
    pub fn has_claimed(&self, packet_id: PacketId, address: &Address) -> Result<bool> {
        Ok(self.store.get_claim(packet_id, address)?.is_some())
    }

    /// Unfinished packets, newest first, up to the configured limit
    pub fn list_open_packets(&self) -> Result<Vec<PacketEntity>> {
        self.store.recent_open_packets(self.list_limit)
    }

    /// Unfinished packets, newest first, up to `limit`
    pub fn list_open_packets_limit(&self, limit: usize) -> Result<Vec<PacketEntity>> {
        self.store.recent_open_packets(limit)
    }

    /// Aggregates for one address
    pub fn get_user(&self, address: &Address) -> Result<Option<UserEntity>> {
        self.store.get_user(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;

    #[test]
    fn test_missing_packet() {
        let reads = ReadModel::new(Arc::new(MemoryEntityStore::new()), 10);
        assert!(matches!(
            reads.get_packet_info(PacketId::new(7)),
            Err(Error::NotFound(_))
        ));
        assert!(!reads
            .has_claimed(PacketId::new(7), &Address::new("0xb"))
            .unwrap());
        assert!(reads.list_open_packets().unwrap().is_empty());
        assert!(reads.get_user(&Address::new("0xb")).unwrap().is_none());
    }
}
