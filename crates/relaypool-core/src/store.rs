/// sled-backed persistence for proxy records and their usage counters.
///
/// Records live in one named tree keyed by `{protocol}://{ip}:{port}`;
/// usage/health counters live in a second tree so a full scan of the record
/// tree yields records only.
use crate::record::ProxyRecord;
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use sled::transaction::ConflictableTransactionResult;
use std::path::Path;
use tracing::{debug, info, warn};

/// Default on-disk location of the store.
pub const STORE_DIR: &str = "proxy_badger_db";

/// Records older than this are removed by the cleanup pass.
pub const MAX_AGE_HOURS: i64 = 72;

const RECORDS_TREE: &str = "records";
const COUNTERS_TREE: &str = "counters";

const HEALTH_MAX: u8 = 100;
const HEALTH_INITIAL: u8 = 100;
const HEALTH_PENALTY: u8 = 10;

pub struct ProxyStore {
    _db: sled::Db,
    records: sled::Tree,
    counters: sled::Tree,
}

impl ProxyStore {
    /// Open (or create) the store under `path`. Failure here is fatal to the
    /// process; callers propagate it to `main`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| anyhow!("failed to open store at {:?}: {}", path.as_ref(), e))?;
        let records = db
            .open_tree(RECORDS_TREE)
            .map_err(|e| anyhow!("failed to open record tree: {}", e))?;
        let counters = db
            .open_tree(COUNTERS_TREE)
            .map_err(|e| anyhow!("failed to open counter tree: {}", e))?;
        Ok(ProxyStore {
            _db: db,
            records,
            counters,
        })
    }

    // -----------------------------------------------------------------------
    // Record CRUD
    // -----------------------------------------------------------------------

    /// Write a record under its derived key. Last writer wins.
    pub fn put(&self, record: &ProxyRecord) -> Result<()> {
        let value = record.encode()?;
        self.records
            .insert(record.key().as_bytes(), value)
            .map_err(|e| anyhow!("store write failed for {}: {}", record, e))?;
        Ok(())
    }

    /// Insert-or-overwrite inside one transaction; returns `true` when the
    /// key was absent (a genuinely new upstream).
    pub fn upsert(&self, record: &ProxyRecord) -> Result<bool> {
        let key = record.key().into_bytes();
        let value = record.encode()?;
        let existed = self
            .records
            .transaction(|tx| -> ConflictableTransactionResult<bool, sled::Error> {
                let existed = tx.get(&key)?.is_some();
                tx.insert(key.as_slice(), value.as_slice())?;
                Ok(existed)
            })
            .map_err(|e| anyhow!("store transaction failed for {}: {}", record, e))?;
        Ok(!existed)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<ProxyRecord>> {
        match self
            .records
            .get(key)
            .map_err(|e| anyhow!("store read failed: {}", e))?
        {
            Some(value) => Ok(Some(ProxyRecord::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.records
            .remove(key)
            .map_err(|e| anyhow!("store delete failed: {}", e))?;
        Ok(())
    }

    /// Re-write `record` with `disable = true`.
    pub fn mark_disabled(&self, record: &ProxyRecord) -> Result<()> {
        let mut disabled = record.clone();
        disabled.disable = true;
        self.put(&disabled)
    }

    /// Visit every raw (key, value) pair in the record tree.
    pub fn for_each(&self, mut visit: impl FnMut(&[u8], &[u8])) -> Result<()> {
        for entry in self.records.iter() {
            let (key, value) = entry.map_err(|e| anyhow!("store iteration failed: {}", e))?;
            visit(&key, &value);
        }
        Ok(())
    }

    /// All decodable records. Unparseable entries are logged and skipped;
    /// cleanup removes them later.
    pub fn list(&self) -> Result<Vec<ProxyRecord>> {
        let mut records = Vec::new();
        self.for_each(|key, value| match ProxyRecord::decode(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "skipping unparseable record {}: {}",
                String::from_utf8_lossy(key),
                e
            ),
        })?;
        debug!("loaded {} records from store", records.len());
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Delete every record that is unparseable, disabled, never validated,
    /// or older than [`MAX_AGE_HOURS`]. Keys are collected during the scan
    /// and removed in one atomic batch. Returns the number deleted.
    pub fn cleanup(&self) -> Result<usize> {
        let now = Utc::now();
        let max_age = Duration::hours(MAX_AGE_HOURS);
        let mut doomed: Vec<Vec<u8>> = Vec::new();

        self.for_each(|key, value| {
            let stale = match ProxyRecord::decode(value) {
                Err(e) => {
                    warn!(
                        "unparseable record {} will be deleted: {}",
                        String::from_utf8_lossy(key),
                        e
                    );
                    true
                }
                Ok(record) => {
                    record.disable
                        || match record.updated {
                            None => true,
                            Some(updated) => now.signed_duration_since(updated) > max_age,
                        }
                }
            };
            if stale {
                doomed.push(key.to_vec());
            }
        })?;

        let mut batch = sled::Batch::default();
        for key in &doomed {
            batch.remove(key.as_slice());
        }
        self.records
            .apply_batch(batch)
            .map_err(|e| anyhow!("cleanup batch failed: {}", e))?;

        info!("cleanup removed {} records", doomed.len());
        Ok(doomed.len())
    }

    // -----------------------------------------------------------------------
    // Usage and health counters
    // -----------------------------------------------------------------------

    /// Increment the per-upstream use counter; returns the new value.
    pub fn bump_use_count(&self, address: &str) -> Result<u64> {
        let key = format!("count:{}", address).into_bytes();
        let count = self
            .counters
            .transaction(|tx| -> ConflictableTransactionResult<u64, sled::Error> {
                let current = tx
                    .get(&key)?
                    .map(|v| decode_u64(&v))
                    .unwrap_or(0);
                let next = current.saturating_add(1);
                tx.insert(key.as_slice(), &next.to_be_bytes()[..])?;
                Ok(next)
            })
            .map_err(|e| anyhow!("use counter update failed for {}: {}", address, e))?;
        Ok(count)
    }

    pub fn use_count(&self, address: &str) -> Result<u64> {
        let key = format!("count:{}", address);
        Ok(self
            .counters
            .get(key.as_bytes())
            .map_err(|e| anyhow!("counter read failed: {}", e))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0))
    }

    /// Bump the health score on success (`min(h+1, 100)`), penalize it on
    /// failure (`max(h-10, 0)`). Untracked upstreams start at full health.
    pub fn adjust_health(&self, address: &str, healthy: bool) -> Result<u8> {
        let key = format!("health:{}", address).into_bytes();
        let score = self
            .counters
            .transaction(|tx| -> ConflictableTransactionResult<u8, sled::Error> {
                let current = tx
                    .get(&key)?
                    .and_then(|v| v.first().copied())
                    .unwrap_or(HEALTH_INITIAL);
                let next = if healthy {
                    current.saturating_add(1).min(HEALTH_MAX)
                } else {
                    current.saturating_sub(HEALTH_PENALTY)
                };
                tx.insert(key.as_slice(), &[next][..])?;
                Ok(next)
            })
            .map_err(|e| anyhow!("health update failed for {}: {}", address, e))?;
        Ok(score)
    }

    pub fn health(&self, address: &str) -> Result<u8> {
        let key = format!("health:{}", address);
        Ok(self
            .counters
            .get(key.as_bytes())
            .map_err(|e| anyhow!("counter read failed: {}", e))?
            .and_then(|v| v.first().copied())
            .unwrap_or(HEALTH_INITIAL))
    }
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
