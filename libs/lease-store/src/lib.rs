//! # lease-store
//!
//! Durable lease persistence on top of an embedded single-writer B-tree
//! ([`redb`]). Two logical lease tables are kept in lockstep inside every
//! write transaction:
//!
//! - `leases`: 4-byte big-endian IP -> serialized [`Lease`]
//! - `by_client`: client identity bytes -> 4-byte IP (secondary index)
//!
//! plus a `conflicts` table for the conflict detector and a `config` table
//! for replicated dynamic config sections. Readers see a consistent
//! snapshot per transaction; writes are totally ordered by redb's
//! single-writer discipline and fsynced on commit.
use std::{
    fs::OpenOptions,
    io::Write,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use thiserror::Error;
use tracing::{debug, warn};

mod model;

pub use model::{
    mac_bytes, unix_now, ClientId, ConflictMethod, ConflictRecord, Lease, LeaseState, RelayInfo,
};

const LEASES: TableDefinition<&[u8], &str> = TableDefinition::new("leases");
const BY_CLIENT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("by_client");
const CONFLICTS: TableDefinition<&[u8], &str> = TableDefinition::new("conflicts");
const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] redb::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("lease store already locked by another process: {0}")]
    Locked(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Db(e.into())
    }
}

fn ip_key(ip: Ipv4Addr) -> [u8; 4] {
    ip.octets()
}

/// The open database plus the process-wide lock file that guards it.
pub struct LeaseStore {
    db: Database,
    _lock: StoreLock,
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore").finish()
    }
}

/// `<path>.lock` created with `create_new` so a second instance opening the
/// same database path fails fast instead of corrupting state. Removed on
/// drop.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(db_path: &Path) -> Result<Self, StoreError> {
        let path = db_path.with_extension("lock");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Locked(path))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(?err, path = %self.path.display(), "failed to remove lock file");
        }
    }
}

impl LeaseStore {
    /// Open (or create) the database at `path`, acquiring the lock file and
    /// creating all tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock = StoreLock::acquire(path)?;
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(LEASES)?;
            let _ = txn.open_table(BY_CLIENT)?;
            let _ = txn.open_table(CONFLICTS)?;
            let _ = txn.open_table(CONFIG)?;
        }
        txn.commit()?;
        debug!(path = %path.display(), "lease store opened");
        Ok(Self { db, _lock: lock })
    }

    /// Write a lease and its secondary index atomically. If the client
    /// already held a different IP, the old index entry is dropped and the
    /// old lease is marked expired in the same transaction.
    pub fn put(&self, lease: &Lease) -> Result<(), StoreError> {
        let json = serde_json::to_string(lease)?;
        let key = ip_key(lease.ip);
        let client = lease.client_key();
        let txn = self.db.begin_write()?;
        {
            let mut leases = txn.open_table(LEASES)?;
            let mut by_client = txn.open_table(BY_CLIENT)?;

            let prev_ip = by_client
                .get(client.as_slice())?
                .map(|v| <[u8; 4]>::try_from(v.value()).map(Ipv4Addr::from));
            if let Some(Ok(prev)) = prev_ip {
                if prev != lease.ip {
                    // client moved: expire the old binding in the same txn
                    let old_entry = leases
                        .get(ip_key(prev).as_slice())?
                        .map(|v| v.value().to_string());
                    if let Some(old_json) = old_entry {
                        let mut old: Lease = serde_json::from_str(&old_json)?;
                        if old.state.is_bound() {
                            old.state = LeaseState::Expired;
                            leases
                                .insert(ip_key(prev).as_slice(), serde_json::to_string(&old)?.as_str())?;
                        }
                    }
                }
            }

            leases.insert(key.as_slice(), json.as_str())?;
            by_client.insert(client.as_slice(), key.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a lease and its index entry.
    pub fn delete(&self, ip: Ipv4Addr) -> Result<(), StoreError> {
        let key = ip_key(ip);
        let txn = self.db.begin_write()?;
        {
            let mut leases = txn.open_table(LEASES)?;
            let removed = leases
                .remove(key.as_slice())?
                .map(|v| v.value().to_string());
            if let Some(json) = removed {
                let lease: Lease = serde_json::from_str(&json)?;
                let mut by_client = txn.open_table(BY_CLIENT)?;
                by_client.remove(lease.client_key().as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(LEASES)?;
        match leases.get(ip_key(ip).as_slice())? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_by_client(&self, id: &[u8]) -> Result<Option<Lease>, StoreError> {
        let txn = self.db.begin_read()?;
        let by_client = txn.open_table(BY_CLIENT)?;
        let Some(ip) = by_client
            .get(id)?
            .map(|v| <[u8; 4]>::try_from(v.value()).ok().map(Ipv4Addr::from))
        else {
            return Ok(None);
        };
        let Some(ip) = ip else { return Ok(None) };
        let leases = txn.open_table(LEASES)?;
        match leases.get(ip_key(ip).as_slice())? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<Lease>, StoreError> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(LEASES)?;
        let mut out = Vec::new();
        for entry in leases.iter()? {
            let (_, v) = entry?;
            out.push(serde_json::from_str(v.value())?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(LEASES)?;
        Ok(leases.len()? as usize)
    }

    /// Ordered scan over `[start, end]` inclusive. Keys sort big-endian, so
    /// this is numeric IP order.
    pub fn range(&self, start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<Lease>, StoreError> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(LEASES)?;
        let lo = ip_key(start);
        let hi = ip_key(end);
        let mut out = Vec::new();
        for entry in leases.range(lo.as_slice()..=hi.as_slice())? {
            let (_, v) = entry?;
            out.push(serde_json::from_str(v.value())?);
        }
        Ok(out)
    }

    /// Delete terminal-state rows (expired/released/declined) whose expiry
    /// predates `cutoff` so the file does not grow without bound. Returns
    /// how many were purged.
    pub fn purge_terminal(&self, cutoff: u64) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let count;
        {
            let mut leases = txn.open_table(LEASES)?;
            let mut by_client = txn.open_table(BY_CLIENT)?;
            let mut doomed = Vec::new();
            for entry in leases.iter()? {
                let (k, v) = entry?;
                let lease: Lease = serde_json::from_str(v.value())?;
                if !lease.state.is_bound() && lease.expiry < cutoff {
                    doomed.push((k.value().to_vec(), lease.client_key()));
                }
            }
            count = doomed.len();
            for (key, client) in doomed {
                leases.remove(key.as_slice())?;
                // only drop the index if it still points at this row
                let stale = by_client
                    .get(client.as_slice())?
                    .map(|v| v.value() == key.as_slice())
                    .unwrap_or(false);
                if stale {
                    by_client.remove(client.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(count)
    }

    // conflict table persistence

    pub fn put_conflict(&self, rec: &ConflictRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(rec)?;
        let txn = self.db.begin_write()?;
        {
            let mut conflicts = txn.open_table(CONFLICTS)?;
            conflicts.insert(ip_key(rec.ip).as_slice(), json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete_conflict(&self, ip: Ipv4Addr) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut conflicts = txn.open_table(CONFLICTS)?;
            conflicts.remove(ip_key(ip).as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn all_conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let conflicts = txn.open_table(CONFLICTS)?;
        let mut out = Vec::new();
        for entry in conflicts.iter()? {
            let (_, v) = entry?;
            out.push(serde_json::from_str(v.value())?);
        }
        Ok(out)
    }

    // dynamic config sections

    pub fn put_section(&self, section: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut config = txn.open_table(CONFIG)?;
            config.insert(section, bytes)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_section(&self, section: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let config = txn.open_table(CONFIG)?;
        Ok(config.get(section)?.map(|v| v.value().to_vec()))
    }

    pub fn all_sections(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read()?;
        let config = txn.open_table(CONFIG)?;
        let mut out = Vec::new();
        for entry in config.iter()? {
            let (k, v) = entry?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }
}
