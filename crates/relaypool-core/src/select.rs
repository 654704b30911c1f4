/// Upstream selection: uniform random straight from the store, or weighted
/// sampling over an in-memory pool with per-record use counters.
use crate::record::ProxyRecord;
use crate::store::ProxyStore;
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no available proxies")]
    Empty,
    #[error("store read failed: {0}")]
    Store(anyhow::Error),
}

/// Pick one selectable record uniformly at random, reading the store fresh.
///
/// Disabled, never-validated and unparseable entries are skipped; the
/// latter are `list`'s concern and end up deleted by cleanup.
pub fn pick_from_store(store: &ProxyStore) -> Result<ProxyRecord, SelectError> {
    let mut pool: Vec<ProxyRecord> = store
        .list()
        .map_err(SelectError::Store)?
        .into_iter()
        .filter(ProxyRecord::is_selectable)
        .collect();
    if pool.is_empty() {
        return Err(SelectError::Empty);
    }
    let index = rand::thread_rng().gen_range(0..pool.len());
    Ok(pool.swap_remove(index))
}

// ---------------------------------------------------------------------------
// Weighted in-memory pool
// ---------------------------------------------------------------------------

struct PoolEntry {
    record: ProxyRecord,
    uses: u64,
}

/// Snapshot of selectable upstreams with per-record usage counters.
///
/// Sampling is cumulative-sum over the raw counters; with all counters at
/// zero it degrades to uniform. When the running sum never crosses the drawn
/// value the last entry scanned wins.
#[derive(Default)]
pub struct WeightedPool {
    entries: Vec<PoolEntry>,
}

impl WeightedPool {
    pub fn new(records: Vec<ProxyRecord>) -> Self {
        WeightedPool {
            entries: records
                .into_iter()
                .filter(ProxyRecord::is_selectable)
                .map(|record| PoolEntry { record, uses: 0 })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bump the use counter of the entry with the given store key.
    pub fn record_use(&mut self, key: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.record.key() == key) {
            entry.uses += 1;
        }
    }

    pub fn pick(&self) -> Option<ProxyRecord> {
        if self.entries.is_empty() {
            return None;
        }

        let total: u64 = self.entries.iter().map(|e| e.uses).sum();
        if total == 0 {
            let index = rand::thread_rng().gen_range(0..self.entries.len());
            return Some(self.entries[index].record.clone());
        }

        let drawn = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0u64;
        for entry in &self.entries {
            if cumulative + entry.uses > drawn {
                return Some(entry.record.clone());
            }
            cumulative += entry.uses;
        }
        self.entries.last().map(|e| e.record.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Protocol;
    use chrono::Utc;

    fn selectable(ip: &str) -> ProxyRecord {
        ProxyRecord {
            ip: ip.into(),
            port: "80".into(),
            protocol: Some(Protocol::Http),
            disable: false,
            updated: Some(Utc::now()),
        }
    }

    #[test]
    fn test_store_selection_skips_disabled_and_unvalidated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProxyStore::open(dir.path()).unwrap();

        let mut disabled = selectable("1.1.1.1");
        disabled.disable = true;
        store.put(&disabled).unwrap();

        let mut unvalidated = selectable("9.9.9.9");
        unvalidated.updated = None;
        store.put(&unvalidated).unwrap();

        let good = selectable("2.2.2.2");
        store.put(&good).unwrap();

        for _ in 0..20 {
            let picked = pick_from_store(&store).unwrap();
            assert_eq!(picked.ip, "2.2.2.2");
            assert!(picked.is_selectable());
        }
    }

    #[test]
    fn test_store_selection_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProxyStore::open(dir.path()).unwrap();
        let err = pick_from_store(&store).unwrap_err();
        assert!(matches!(err, SelectError::Empty));
        assert_eq!(err.to_string(), "no available proxies");
    }

    #[test]
    fn test_weighted_pool_filters_on_construction() {
        let mut disabled = selectable("1.1.1.1");
        disabled.disable = true;
        let pool = WeightedPool::new(vec![disabled, selectable("2.2.2.2")]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_weighted_pool_zero_uses_is_uniform() {
        let pool = WeightedPool::new(vec![selectable("1.1.1.1"), selectable("2.2.2.2")]);
        assert!(pool.pick().is_some());
    }

    #[test]
    fn test_weighted_pool_cumulative_walk() {
        let mut pool = WeightedPool::new(vec![
            selectable("1.1.1.1"),
            selectable("2.2.2.2"),
            selectable("3.3.3.3"),
        ]);
        // Only the first entry has weight; the walk always stops there.
        pool.record_use("http://1.1.1.1:80");
        for _ in 0..20 {
            assert_eq!(pool.pick().unwrap().ip, "1.1.1.1");
        }
    }

    #[test]
    fn test_weighted_pool_ties_resolve_to_last_scanned() {
        let mut pool = WeightedPool::new(vec![
            selectable("1.1.1.1"),
            selectable("2.2.2.2"),
            selectable("3.3.3.3"),
        ]);
        // total = 1, drawn = 0; the zero-weight prefix never crosses it, the
        // weighted tail entry does.
        pool.record_use("http://3.3.3.3:80");
        for _ in 0..20 {
            assert_eq!(pool.pick().unwrap().ip, "3.3.3.3");
        }
    }

    #[test]
    fn test_weighted_pool_empty() {
        let pool = WeightedPool::default();
        assert!(pool.is_empty());
        assert!(pool.pick().is_none());
    }
}
