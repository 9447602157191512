//! Callback handle table.
//!
//! Registrations identify their function by an opaque 64-bit handle carried
//! inside the GUID. For in-process callers the handle indexes this table of
//! boxed async closures; for remote callers the handle is forwarded over the
//! callback channel and resolved by the owning client's own table.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::tree::PathTree;

pub type WatchFn = Arc<dyn Fn(String, Option<Bytes>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type WatchTreeFn = Arc<dyn Fn(PathTree) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(String, Option<Bytes>) -> BoxFuture<'static, i32> + Send + Sync>;
pub type ProvideFn = Arc<dyn Fn(String) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;
pub type IndexFn = Arc<dyn Fn(String) -> BoxFuture<'static, Vec<String>> + Send + Sync>;
pub type RefreshFn = Arc<dyn Fn(String) -> BoxFuture<'static, u64> + Send + Sync>;

#[derive(Clone)]
pub enum LocalCallback {
    Watch(WatchFn),
    WatchTree(WatchTreeFn),
    Validate(ValidateFn),
    Provide(ProvideFn),
    Index(IndexFn),
    Refresh(RefreshFn),
}

/// Handles are allocated process-wide: an engine and a client library in
/// the same process must never hand out the same id, because the GUID pid
/// alone cannot tell their tables apart.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
pub struct HandleTable {
    map: DashMap<u64, LocalCallback>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            map: DashMap::new(),
        }
    }

    pub fn register(&self, cb: LocalCallback) -> u64 {
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        self.map.insert(handle, cb);
        handle
    }

    /// Allocate an id with no closure behind it (proxy registrations).
    pub fn reserve(&self) -> u64 {
        NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, handle: u64) -> Option<LocalCallback> {
        self.map.get(&handle).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, handle: u64) {
        self.map.remove(&handle);
    }
}
