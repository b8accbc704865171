//! Entity storage backing the read model
//!
//! # Column Families
//!
//! - `packets` - Packet entities (key: packet_id)
//! - `claims` - Claim entities (key: `"{packet_id}-{claimer}"`)
//! - `users` - User aggregates (key: address)
//! - `open_index` - Unfinished packets (key: created_at || packet_id)
//! - `meta` - Projection cursor
//!
//! The open index is maintained by the store itself from each packet's
//! `is_finished` flag, inside the same batch as the packet write.

use crate::{
    entities::{ClaimEntity, EntityBatch, PacketEntity, UserEntity},
    Config, Error, Result,
};
use packet_ledger::{Address, PacketId};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::collections::{BTreeMap, HashMap};

const CF_PACKETS: &str = "packets";
const CF_CLAIMS: &str = "claims";
const CF_USERS: &str = "users";
const CF_OPEN_INDEX: &str = "open_index";
const CF_META: &str = "meta";

const CURSOR_KEY: &[u8] = b"cursor";

/// Keyed storage for the projector's collections
pub trait EntityStore: Send + Sync {
    /// Packet by id
    fn get_packet(&self, id: PacketId) -> Result<Option<PacketEntity>>;

    /// Claim by composite key
    fn get_claim(&self, packet_id: PacketId, claimer: &Address) -> Result<Option<ClaimEntity>>;

    /// User aggregates by address
    fn get_user(&self, address: &Address) -> Result<Option<UserEntity>>;

    /// Up to `limit` unfinished packets, newest first
    fn recent_open_packets(&self, limit: usize) -> Result<Vec<PacketEntity>>;

    /// Every global seq below this has been processed
    fn cursor(&self) -> Result<u64>;

    /// Write one event's entities atomically
    fn commit(&self, batch: &EntityBatch) -> Result<()>;

    /// Persist buffered writes (shutdown)
    fn flush(&self) -> Result<()>;
}

/// RocksDB-backed entity store
pub struct RocksEntityStore {
    db: DB,
    sync_writes: bool,
}

impl std::fmt::Debug for RocksEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksEntityStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksEntityStore {
    /// Open or create the store
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut point_opts = Options::default();
        point_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PACKETS, point_opts.clone()),
            ColumnFamilyDescriptor::new(CF_CLAIMS, point_opts.clone()),
            ColumnFamilyDescriptor::new(CF_USERS, point_opts),
            ColumnFamilyDescriptor::new(CF_OPEN_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened entity store");

        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf_handle(cf)?, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

impl EntityStore for RocksEntityStore {
    fn get_packet(&self, id: PacketId) -> Result<Option<PacketEntity>> {
        self.get(CF_PACKETS, &id.to_be_bytes())
    }

    fn get_claim(&self, packet_id: PacketId, claimer: &Address) -> Result<Option<ClaimEntity>> {
        self.get(CF_CLAIMS, ClaimEntity::key(packet_id, claimer).as_bytes())
    }

    fn get_user(&self, address: &Address) -> Result<Option<UserEntity>> {
        self.get(CF_USERS, address.as_str().as_bytes())
    }

    fn recent_open_packets(&self, limit: usize) -> Result<Vec<PacketEntity>> {
        let cf = self.cf_handle(CF_OPEN_INDEX)?;
        let mut packets = Vec::with_capacity(limit);

        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if packets.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let id: PacketId = bincode::deserialize(&value)?;
            let packet = self.get_packet(id)?.ok_or_else(|| {
                Error::Storage(format!("open index references missing packet {}", id))
            })?;
            packets.push(packet);
        }

        Ok(packets)
    }

    fn cursor(&self) -> Result<u64> {
        Ok(self.get(CF_META, CURSOR_KEY)?.unwrap_or(0))
    }

    fn commit(&self, batch: &EntityBatch) -> Result<()> {
        let mut write = WriteBatch::default();

        let cf_packets = self.cf_handle(CF_PACKETS)?;
        let cf_open = self.cf_handle(CF_OPEN_INDEX)?;
        for packet in &batch.packets {
            write.put_cf(cf_packets, packet.id.to_be_bytes(), bincode::serialize(packet)?);
            if packet.is_finished {
                write.delete_cf(cf_open, packet.open_key());
            } else {
                write.put_cf(cf_open, packet.open_key(), bincode::serialize(&packet.id)?);
            }
        }

        let cf_claims = self.cf_handle(CF_CLAIMS)?;
        for claim in &batch.claims {
            write.put_cf(cf_claims, claim.id.as_bytes(), bincode::serialize(claim)?);
        }

        let cf_users = self.cf_handle(CF_USERS)?;
        for user in &batch.users {
            write.put_cf(cf_users, user.address.as_str().as_bytes(), bincode::serialize(user)?);
        }

        if let Some(cursor) = batch.cursor {
            write.put_cf(self.cf_handle(CF_META)?, CURSOR_KEY, bincode::serialize(&cursor)?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(write, &write_opts)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        for name in [CF_PACKETS, CF_CLAIMS, CF_USERS, CF_OPEN_INDEX, CF_META] {
            self.db.flush_cf(self.cf_handle(name)?)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Collections {
    packets: HashMap<PacketId, PacketEntity>,
    claims: HashMap<String, ClaimEntity>,
    users: HashMap<Address, UserEntity>,
    open_index: BTreeMap<[u8; 16], PacketId>,
    cursor: u64,
}

/// In-memory entity store (tests, embedded read models)
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    inner: RwLock<Collections>,
}

impl MemoryEntityStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryEntityStore {
    fn get_packet(&self, id: PacketId) -> Result<Option<PacketEntity>> {
        Ok(self.inner.read().packets.get(&id).cloned())
    }

    fn get_claim(&self, packet_id: PacketId, claimer: &Address) -> Result<Option<ClaimEntity>> {
        Ok(self
            .inner
            .read()
            .claims
            .get(&ClaimEntity::key(packet_id, claimer))
            .cloned())
    }

    fn get_user(&self, address: &Address) -> Result<Option<UserEntity>> {
        Ok(self.inner.read().users.get(address).cloned())
    }

    fn recent_open_packets(&self, limit: usize) -> Result<Vec<PacketEntity>> {
        let inner = self.inner.read();
        inner
            .open_index
            .values()
            .rev()
            .take(limit)
            .map(|id| {
                inner.packets.get(id).cloned().ok_or_else(|| {
                    Error::Storage(format!("open index references missing packet {}", id))
                })
            })
            .collect()
    }

    fn cursor(&self) -> Result<u64> {
        Ok(self.inner.read().cursor)
    }

    fn commit(&self, batch: &EntityBatch) -> Result<()> {
        let mut inner = self.inner.write();

        for packet in &batch.packets {
            if packet.is_finished {
                inner.open_index.remove(&packet.open_key());
            } else {
                inner.open_index.insert(packet.open_key(), packet.id);
            }
            inner.packets.insert(packet.id, packet.clone());
        }
        for claim in &batch.claims {
            inner.claims.insert(claim.id.clone(), claim.clone());
        }
        for user in &batch.users {
            inner.users.insert(user.address.clone(), user.clone());
        }
        if let Some(cursor) = batch.cursor {
            inner.cursor = cursor;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
