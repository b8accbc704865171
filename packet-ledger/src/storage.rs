//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `events` - Append-only event log (key: seq)
//! - `packets` - Latest packet records (key: packet_id)
//! - `claims` - Claim rows (key: packet_id || claimant)
//! - `indices` - Per-packet event index (key: packet_id || packet_seq -> seq)
//!
//! Every ledger operation lands as one `WriteBatch`, so a crash never
//! leaves an event without its state change or the other way round.

use crate::{
    error::{Error, Result},
    events::LedgerEvent,
    types::{Claim, Packet, PacketId},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};

/// Column family names
const CF_EVENTS: &str = "events";
const CF_PACKETS: &str = "packets";
const CF_CLAIMS: &str = "claims";
const CF_INDICES: &str = "indices";

/// Everything one ledger operation writes
#[derive(Debug)]
pub struct Commit<'a> {
    /// Packet record after the operation
    pub packet: &'a Packet,

    /// Claim row created by the operation
    pub claim: Option<&'a Claim>,

    /// Events emitted by the operation, already stamped with `seq`
    pub events: &'a [LedgerEvent],
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_PACKETS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_CLAIMS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger RocksDB");

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        // State is read on every restart and every point lookup
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Writes

    /// Write one operation atomically
    pub fn commit(&self, commit: &Commit<'_>) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_events = self.cf_handle(CF_EVENTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        for event in commit.events {
            batch.put_cf(cf_events, event.seq.to_be_bytes(), bincode::serialize(event)?);
            batch.put_cf(
                cf_indices,
                Self::index_key(event.packet_id, event.packet_seq),
                event.seq.to_be_bytes(),
            );
        }

        let cf_packets = self.cf_handle(CF_PACKETS)?;
        batch.put_cf(
            cf_packets,
            commit.packet.id.to_be_bytes(),
            bincode::serialize(commit.packet)?,
        );

        if let Some(claim) = commit.claim {
            let cf_claims = self.cf_handle(CF_CLAIMS)?;
            batch.put_cf(cf_claims, Self::claim_key(claim), bincode::serialize(claim)?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::debug!(
            packet_id = %commit.packet.id,
            events = commit.events.len(),
            "Commit written"
        );

        Ok(())
    }

    // Event reads

    /// Get event by global sequence
    pub fn get_event(&self, seq: u64) -> Result<LedgerEvent> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let value = self
            .db
            .get_cf(cf, seq.to_be_bytes())?
            .ok_or(Error::EventNotFound(seq))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Events with `seq >= from`, in log order, at most `limit`
    pub fn events_since(&self, from: u64, limit: usize) -> Result<Vec<LedgerEvent>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let start = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut events = Vec::new();
        for item in iter.take(limit) {
            let (_, value) = item?;
            events.push(bincode::deserialize(&value)?);
        }
        Ok(events)
    }

    /// Full history of one packet, in `packet_seq` order
    pub fn packet_events(&self, packet_id: PacketId) -> Result<Vec<LedgerEvent>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = packet_id.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));

        let mut events = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let seq_bytes: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| Error::Storage("corrupt event index entry".to_string()))?;
            events.push(self.get_event(u64::from_be_bytes(seq_bytes))?);
        }
        Ok(events)
    }

    /// Highest sequence in the log
    pub fn last_seq(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                let seq_bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt event key".to_string()))?;
                Ok(Some(u64::from_be_bytes(seq_bytes)))
            }
            None => Ok(None),
        }
    }

    // State reads

    /// Get packet record
    pub fn get_packet(&self, packet_id: PacketId) -> Result<Option<Packet>> {
        let cf = self.cf_handle(CF_PACKETS)?;
        match self.db.get_cf(cf, packet_id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All packet records, by id
    pub fn load_packets(&self) -> Result<Vec<Packet>> {
        let cf = self.cf_handle(CF_PACKETS)?;
        let mut packets = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            packets.push(bincode::deserialize(&value)?);
        }
        Ok(packets)
    }

    /// All claim rows, grouped by packet
    pub fn load_claims(&self) -> Result<Vec<Claim>> {
        let cf = self.cf_handle(CF_CLAIMS)?;
        let mut claims = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            claims.push(bincode::deserialize(&value)?);
        }
        Ok(claims)
    }

    // Key helpers

    fn index_key(packet_id: PacketId, packet_seq: u64) -> Vec<u8> {
        let mut key = packet_id.to_be_bytes().to_vec();
        key.extend_from_slice(&packet_seq.to_be_bytes());
        key
    }

    fn claim_key(claim: &Claim) -> Vec<u8> {
        let mut key = claim.packet_id.to_be_bytes().to_vec();
        key.extend_from_slice(claim.claimant.as_str().as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_events: self.last_seq()?.map_or(0, |seq| seq + 1),
            total_packets: self.approximate_count(self.cf_handle(CF_PACKETS)?)?,
            total_claims: self.approximate_count(self.cf_handle(CF_CLAIMS)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        for name in [CF_EVENTS, CF_PACKETS, CF_CLAIMS, CF_INDICES] {
            self.db.flush_cf(self.cf_handle(name)?)?;
        }
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Events in the log (exact)
    pub total_events: u64,
    /// Packets (estimate)
    pub total_packets: u64,
    /// Claims (estimate)
    pub total_claims: u64,
}
