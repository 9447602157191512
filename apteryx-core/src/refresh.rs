//! Refresh ledger.
//!
//! Remembers when each (registration, path) pair last ran so repeated reads
//! inside the TTL window skip the callback. Entries carry their own async
//! lock: concurrent readers hitting the same stale entry serialize, and the
//! losers see the winner's fresh expiry instead of re-invoking.

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Entry {
    expires_at_us: Mutex<u64>,
}

#[derive(Default)]
pub struct RefreshLedger {
    entries: DashMap<(String, String), Arc<Entry>>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl RefreshLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `invoke` unless the (guid, path) entry is still fresh. `invoke`
    /// returns the TTL in microseconds; zero means always stale.
    pub async fn run_if_stale<F, Fut>(&self, guid: &str, path: &str, invoke: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<u64>>,
    {
        let entry = self
            .entries
            .entry((guid.to_string(), path.to_string()))
            .or_default()
            .clone();
        let mut expires = entry.expires_at_us.lock().await;
        if now_us() < *expires {
            return;
        }
        if let Some(ttl_us) = invoke().await {
            *expires = now_us().saturating_add(ttl_us);
        }
    }

    /// Forget every entry belonging to `guid` (deregistration).
    pub fn forget(&self, guid: &str) {
        self.entries.retain(|(g, _), _| g != guid);
    }
}
