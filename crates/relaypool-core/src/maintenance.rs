/// Periodic upkeep of the pool: health re-checks, cleanup of dead records,
/// and full discovery refreshes, on wall-clock-aligned ticks.
use crate::pipeline;
use crate::record::ProxyRecord;
use crate::select::WeightedPool;
use crate::store::ProxyStore;
use crate::validator::Validate;
use anyhow::Result;
use chrono::{Local, Timelike};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Re-validate every stored record in parallel. A healthy record is written
/// back with a fresh `updated`; a failing one is marked disabled. A probe
/// that changes the protocol writes under the new key and leaves the old
/// record to age out.
pub async fn check_all(store: &Arc<ProxyStore>, validator: Arc<dyn Validate>) -> Result<()> {
    let records = store.list()?;
    info!("health pass over {} upstreams", records.len());

    let mut tasks = JoinSet::new();
    for mut record in records {
        let store = Arc::clone(store);
        let validator = Arc::clone(&validator);
        tasks.spawn(async move {
            if validator.validate(&mut record).await {
                debug!("upstream healthy: {}", record);
                if let Err(e) = store.put(&record) {
                    error!("failed to refresh {}: {}", record, e);
                }
            } else if let Err(e) = store.mark_disabled(&record) {
                error!("failed to disable {}: {}", record, e);
            } else {
                info!("disabled unhealthy upstream: {}", record);
            }
        });
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// Replace the in-memory selection pool with the store's current
/// selectable records.
pub fn reload_pool(store: &ProxyStore, pool: &RwLock<WeightedPool>) -> Result<()> {
    let records: Vec<ProxyRecord> = store.list()?;
    let fresh = WeightedPool::new(records);
    debug!("selection pool reloaded with {} upstreams", fresh.len());
    if let Ok(mut guard) = pool.write() {
        *guard = fresh;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// :30 of every hour.
    Cleanup,
    /// :00 of every hour; `refresh` on even hours.
    Hourly { refresh: bool },
}

pub struct Scheduler {
    store: Arc<ProxyStore>,
    pool: Arc<RwLock<WeightedPool>>,
    sources: Vec<String>,
    validator: Arc<dyn Validate>,
}

impl Scheduler {
    pub fn new(
        store: Arc<ProxyStore>,
        pool: Arc<RwLock<WeightedPool>>,
        sources: Vec<String>,
        validator: Arc<dyn Validate>,
    ) -> Self {
        Scheduler {
            store,
            pool,
            sources,
            validator,
        }
    }

    /// The startup sequence: health, cleanup, refresh, once, in that order.
    pub async fn startup(&self) {
        if let Err(e) = check_all(&self.store, Arc::clone(&self.validator)).await {
            error!("startup health pass failed: {}", e);
        }
        if let Err(e) = self.store.cleanup() {
            error!("startup cleanup failed: {}", e);
        }
        self.refresh().await;
    }

    /// Timer loop; returns when `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let now = Local::now();
            let (wait, tick) = next_tick(now.hour(), now.minute(), now.second());
            debug!("next maintenance tick {:?} in {:?}", tick, wait);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match tick {
                Tick::Cleanup => {
                    if let Err(e) = self.store.cleanup() {
                        error!("cleanup failed: {}", e);
                    }
                }
                Tick::Hourly { refresh } => {
                    if let Err(e) = check_all(&self.store, Arc::clone(&self.validator)).await {
                        error!("health pass failed: {}", e);
                    }
                    if refresh {
                        self.refresh().await;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        let sources: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        if let Err(e) = pipeline::gather_with(
            Arc::clone(&self.store),
            &sources,
            Arc::clone(&self.validator),
        )
        .await
        {
            error!("discovery refresh failed: {}", e);
        }
        if let Err(e) = reload_pool(&self.store, &self.pool) {
            error!("pool reload failed: {}", e);
        }
    }
}

/// Time until the next :00 or :30 mark, and what runs there.
fn next_tick(hour: u32, minute: u32, second: u32) -> (Duration, Tick) {
    if minute < 30 {
        let wait = u64::from((30 - minute) * 60 - second);
        (Duration::from_secs(wait), Tick::Cleanup)
    } else {
        let wait = u64::from((60 - minute) * 60 - second);
        let next_hour = (hour + 1) % 24;
        (
            Duration::from_secs(wait),
            Tick::Hourly {
                refresh: next_hour % 2 == 0,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Protocol;
    use async_trait::async_trait;
    use chrono::Utc;

    struct AlwaysHealthy;

    #[async_trait]
    impl Validate for AlwaysHealthy {
        async fn validate(&self, record: &mut ProxyRecord) -> bool {
            record.updated = Some(Utc::now());
            record.disable = false;
            true
        }
    }

    struct AlwaysDead;

    #[async_trait]
    impl Validate for AlwaysDead {
        async fn validate(&self, record: &mut ProxyRecord) -> bool {
            record.disable = true;
            false
        }
    }

    fn seeded_store() -> (tempfile::TempDir, Arc<ProxyStore>, ProxyRecord) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProxyStore::open(dir.path()).unwrap());
        let record = ProxyRecord {
            ip: "203.0.113.9".into(),
            port: "8080".into(),
            protocol: Some(Protocol::Http),
            disable: false,
            updated: Some(Utc::now() - chrono::Duration::hours(10)),
        };
        store.put(&record).unwrap();
        (dir, store, record)
    }

    #[tokio::test]
    async fn test_check_all_refreshes_healthy_records() {
        let (_dir, store, record) = seeded_store();
        let before = record.updated.unwrap();
        check_all(&store, Arc::new(AlwaysHealthy)).await.unwrap();
        let after = store.get(record.key().as_bytes()).unwrap().unwrap();
        assert!(after.updated.unwrap() > before);
        assert!(!after.disable);
    }

    #[tokio::test]
    async fn test_check_all_disables_failing_records() {
        let (_dir, store, record) = seeded_store();
        check_all(&store, Arc::new(AlwaysDead)).await.unwrap();
        let after = store.get(record.key().as_bytes()).unwrap().unwrap();
        assert!(after.disable);
    }

    #[tokio::test]
    async fn test_reload_pool_picks_up_selectable_records() {
        let (_dir, store, _record) = seeded_store();
        let pool = RwLock::new(WeightedPool::default());
        reload_pool(&store, &pool).unwrap();
        assert_eq!(pool.read().unwrap().len(), 1);
    }

    #[test]
    fn test_next_tick_before_half_hour() {
        let (wait, tick) = next_tick(9, 15, 0);
        assert_eq!(tick, Tick::Cleanup);
        assert_eq!(wait, Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_next_tick_after_half_hour() {
        let (wait, tick) = next_tick(9, 45, 30);
        assert_eq!(tick, Tick::Hourly { refresh: true });
        assert_eq!(wait, Duration::from_secs(14 * 60 + 30));
    }

    #[test]
    fn test_refresh_only_on_even_hours() {
        let (_, tick) = next_tick(10, 45, 0);
        assert_eq!(tick, Tick::Hourly { refresh: false });
        let (_, tick) = next_tick(23, 59, 0);
        assert_eq!(tick, Tick::Hourly { refresh: true });
    }

    #[test]
    fn test_next_tick_at_exact_boundary() {
        let (wait, tick) = next_tick(9, 0, 0);
        assert_eq!(tick, Tick::Cleanup);
        assert_eq!(wait, Duration::from_secs(30 * 60));
    }
}
