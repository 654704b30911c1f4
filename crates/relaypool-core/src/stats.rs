/// Serve-time accounting for the forward proxy.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: String,
    pub client: String,
    pub target: String,
    pub upstream: String,
    pub started_at: DateTime<Utc>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Shared counters for the forward server: active tunnels plus lifetime
/// totals. Lifetime totals never decrease.
#[derive(Debug)]
pub struct ServerStats {
    active: Mutex<HashMap<String, TunnelInfo>>,
    total_requests: Mutex<u64>,
    total_bytes_up: Mutex<u64>,
    total_bytes_down: Mutex<u64>,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(ServerStats {
            active: Mutex::new(HashMap::new()),
            total_requests: Mutex::new(0),
            total_bytes_up: Mutex::new(0),
            total_bytes_down: Mutex::new(0),
        })
    }

    pub fn open_tunnel(&self, info: TunnelInfo) {
        if let Ok(mut map) = self.active.lock() {
            map.insert(info.id.clone(), info);
        }
        if let Ok(mut n) = self.total_requests.lock() {
            *n += 1;
        }
    }

    /// Unregister a finished tunnel; returns its final accounting.
    pub fn close_tunnel(&self, id: &str) -> Option<TunnelInfo> {
        self.active.lock().ok()?.remove(id)
    }

    pub fn add_transfer(&self, id: &str, bytes_up: u64, bytes_down: u64) {
        if let Ok(mut map) = self.active.lock() {
            if let Some(info) = map.get_mut(id) {
                info.bytes_up += bytes_up;
                info.bytes_down += bytes_down;
            }
        }
        if let Ok(mut n) = self.total_bytes_up.lock() {
            *n += bytes_up;
        }
        if let Ok(mut n) = self.total_bytes_down.lock() {
            *n += bytes_down;
        }
    }

    /// Count a plain (non-tunnel) forwarded request.
    pub fn count_request(&self) {
        if let Ok(mut n) = self.total_requests.lock() {
            *n += 1;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn total_requests(&self) -> u64 {
        *self.total_requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn total_bytes_up(&self) -> u64 {
        *self.total_bytes_up.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn total_bytes_down(&self) -> u64 {
        *self
            .total_bytes_down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(id: &str) -> TunnelInfo {
        TunnelInfo {
            id: id.into(),
            client: "127.0.0.1:50000".into(),
            target: "example.com:443".into(),
            upstream: "http://203.0.113.7:3128".into(),
            started_at: Utc::now(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    #[test]
    fn test_open_close() {
        let stats = ServerStats::new();
        stats.open_tunnel(make_info("t1"));
        assert_eq!(stats.active_count(), 1);
        assert!(stats.close_tunnel("t1").is_some());
        assert_eq!(stats.active_count(), 0);
        assert_eq!(stats.total_requests(), 1);
    }

    #[test]
    fn test_transfer_accounting() {
        let stats = ServerStats::new();
        stats.open_tunnel(make_info("t2"));
        stats.add_transfer("t2", 100, 200);
        let closed = stats.close_tunnel("t2").unwrap();
        assert_eq!(closed.bytes_up, 100);
        assert_eq!(closed.bytes_down, 200);
        assert_eq!(stats.total_bytes_up(), 100);
        assert_eq!(stats.total_bytes_down(), 200);
    }

    #[test]
    fn test_totals_never_decrease() {
        let stats = ServerStats::new();
        stats.open_tunnel(make_info("t3"));
        stats.count_request();
        stats.close_tunnel("t3");
        assert_eq!(stats.total_requests(), 2);
    }
}
