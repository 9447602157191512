//! The operation engine.
//!
//! Composes the path tree, the callback registry, the refresh ledger and
//! the dispatcher into the public operations: set / get / search / traverse
//! / query / find / prune / timestamp / cas / set_tree.
//!
//! Ordering rules (see also the dispatcher):
//! - validators run synchronously before the tree lock is taken
//! - the tree mutation happens under one write-lock hold, CAS included
//! - watchers are queued after the lock is released, in match order
//! - no callback ever runs while the tree lock is held
//!
//! A mutation issued from inside a callback is re-keyed onto an originator
//! derived from that callback, so its watchers drain on their own queue and
//! a blocking `set_wait` cannot starve the worker it is running on.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use apteryx_proto::Status;

use crate::callbacks::make_guid;
use crate::callbacks::Callback;
use crate::callbacks::Kind;
use crate::callbacks::Registry;
use crate::config::EngineConfig;
use crate::counters::inc;
use crate::counters::Counters;
use crate::db::Db;
use crate::dispatch::current_callback;
use crate::dispatch::Dispatcher;
use crate::dispatch::Job;
use crate::dispatch::WaitBatch;
use crate::dispatch::WatchEvent;
use crate::dispatch::WatchInvoker;
use crate::errors::DispatchError;
use crate::errors::Result;
use crate::errors::StoreError;
use crate::handles::HandleTable;
use crate::handles::IndexFn;
use crate::handles::LocalCallback;
use crate::handles::ProvideFn;
use crate::handles::RefreshFn;
use crate::handles::ValidateFn;
use crate::handles::WatchFn;
use crate::handles::WatchTreeFn;
use crate::path;
use crate::refresh::RefreshLedger;
use crate::surface;
use crate::tree::PathTree;

/// Identity of the peer that initiated an operation; watcher delivery is
/// FIFO per origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin(pub u64);

impl Origin {
    /// In-process callers.
    pub const LOCAL: Origin = Origin(0);
    /// Built-in refreshers and other engine-initiated writes.
    pub const ENGINE: Origin = Origin(1);
    /// First id handed out to RPC connections.
    pub const FIRST_REMOTE: u64 = 16;
}

/// Carries callback invocations to the remote client that registered them.
#[async_trait]
pub trait CallbackChannel: Send + Sync {
    async fn watch(&self, cb: &Callback, path: &str, value: Option<Bytes>) -> Result<()>;
    async fn validate(&self, cb: &Callback, path: &str, value: Option<Bytes>) -> Result<i32>;
    async fn provide(&self, cb: &Callback, path: &str) -> Result<Option<Bytes>>;
    async fn index(&self, cb: &Callback, path: &str) -> Result<Vec<String>>;
    async fn refresh(&self, cb: &Callback, path: &str) -> Result<u64>;
}

/// Forwards operations for proxied subtrees to the remote instance.
#[async_trait]
pub trait ProxyForwarder: Send + Sync {
    async fn get(&self, uri: &str, path: &str) -> Result<Option<Bytes>>;
    async fn set(
        &self,
        uri: &str,
        ops: Vec<(String, Option<Bytes>)>,
        expected: Option<u64>,
    ) -> Result<()>;
    async fn search(&self, uri: &str, prefix: &str) -> Result<Vec<String>>;
    async fn traverse(&self, uri: &str, path: &str) -> Result<Vec<(String, Bytes)>>;
    async fn prune(&self, uri: &str, path: &str) -> Result<()>;
    async fn timestamp(&self, uri: &str, path: &str) -> Result<u64>;
}

/// Reacts to writes under `/apteryx/sockets/`.
#[async_trait]
pub trait SocketHook: Send + Sync {
    async fn bind(&self, guid: &str, uri: &str) -> bool;
    async fn release(&self, guid: &str) -> bool;
}

/// Resolves a callback record to an actual call: a local closure when the
/// record belongs to this process, the callback channel otherwise. Applies
/// the per-call timeout and keeps the per-record statistics.
pub(crate) struct Invoker {
    pub(crate) handles: HandleTable,
    channel: RwLock<Option<Arc<dyn CallbackChannel>>>,
    counters: Arc<Counters>,
    timeout: Duration,
    pid: u64,
}

impl Invoker {
    fn new(counters: Arc<Counters>, timeout: Duration, pid: u64) -> Self {
        Invoker {
            handles: HandleTable::new(),
            channel: RwLock::new(None),
            counters,
            timeout,
            pid,
        }
    }

    fn channel(&self) -> Option<Arc<dyn CallbackChannel>> {
        self.channel.read().clone()
    }

    fn local(&self, cb: &Callback) -> Option<LocalCallback> {
        if cb.pid != self.pid {
            return None;
        }
        self.handles.get(cb.handle)
    }

    async fn timed<T>(
        &self,
        cb: &Callback,
        fut: impl std::future::Future<Output = T>,
    ) -> Option<T> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, fut).await;
        cb.stats.record(start.elapsed().as_micros().min(u32::MAX as u128) as u32);
        outcome.ok()
    }

    pub(crate) async fn validate(&self, cb: &Arc<Callback>, path: &str, value: Option<&Bytes>) -> i32 {
        inc(&self.counters.validated);
        let outcome = match self.local(cb) {
            Some(LocalCallback::Validate(f)) => {
                self.timed(cb, f(path.to_string(), value.cloned())).await
            }
            Some(_) | None => match self.channel() {
                Some(ch) => self
                    .timed(cb, ch.validate(cb, path, value.cloned()))
                    .await
                    .map(|res| res.unwrap_or(Status::Timeout.as_i32())),
                None => {
                    inc(&self.counters.validated_no_handler);
                    return 0; // a vanished validator cannot veto
                }
            },
        };
        match outcome {
            Some(status) => status,
            None => {
                inc(&self.counters.validated_timeout);
                warn!(guid = %cb.guid, path, "validator timed out, treating as veto");
                Status::Timeout.as_i32()
            }
        }
    }

    pub(crate) async fn provide(&self, cb: &Arc<Callback>, path: &str) -> Option<Bytes> {
        inc(&self.counters.provided);
        let outcome = match self.local(cb) {
            Some(LocalCallback::Provide(f)) => self.timed(cb, f(path.to_string())).await,
            Some(_) | None => match self.channel() {
                Some(ch) => self
                    .timed(cb, ch.provide(cb, path))
                    .await
                    .map(|res| res.unwrap_or(None)),
                None => {
                    inc(&self.counters.provided_no_handler);
                    return None;
                }
            },
        };
        match outcome {
            Some(value) => value,
            None => {
                inc(&self.counters.provided_timeout);
                None
            }
        }
    }

    pub(crate) async fn index(&self, cb: &Arc<Callback>, path: &str) -> Option<Vec<String>> {
        inc(&self.counters.indexed);
        let outcome = match self.local(cb) {
            Some(LocalCallback::Index(f)) => self.timed(cb, f(path.to_string())).await,
            Some(_) | None => match self.channel() {
                Some(ch) => self
                    .timed(cb, ch.index(cb, path))
                    .await
                    .map(|res| res.unwrap_or_default()),
                None => {
                    inc(&self.counters.indexed_no_handler);
                    return None;
                }
            },
        };
        match outcome {
            Some(paths) => Some(paths),
            None => {
                inc(&self.counters.indexed_timeout);
                None
            }
        }
    }

    /// Returns the TTL in microseconds, `None` when the refresher failed
    /// (the ledger entry stays stale).
    pub(crate) async fn refresh(&self, cb: &Arc<Callback>, path: &str) -> Option<u64> {
        inc(&self.counters.refreshed);
        let outcome = match self.local(cb) {
            Some(LocalCallback::Refresh(f)) => self.timed(cb, f(path.to_string())).await,
            Some(_) | None => match self.channel() {
                Some(ch) => match self.timed(cb, ch.refresh(cb, path)).await {
                    Some(Ok(ttl)) => Some(ttl),
                    Some(Err(_)) => None,
                    None => None,
                },
                None => {
                    inc(&self.counters.refreshed_no_handler);
                    return None;
                }
            },
        };
        if outcome.is_none() {
            inc(&self.counters.refreshed_timeout);
        }
        outcome
    }
}

#[async_trait]
impl WatchInvoker for Invoker {
    async fn invoke_watch(&self, cb: &Arc<Callback>, event: &WatchEvent) {
        inc(&self.counters.watched);
        let outcome = match (self.local(cb), event) {
            (Some(LocalCallback::Watch(f)), WatchEvent::Leaf { path, value }) => {
                self.timed(cb, f(path.clone(), value.clone())).await
            }
            (Some(LocalCallback::WatchTree(f)), WatchEvent::Tree(tree)) => {
                self.timed(cb, f(tree.clone())).await
            }
            (Some(_), _) => {
                inc(&self.counters.watched_no_handler);
                return;
            }
            (None, event) => match self.channel() {
                Some(ch) => {
                    // Remote tree watchers receive the batch leaf by leaf.
                    let fut = async {
                        match event {
                            WatchEvent::Leaf { path, value } => {
                                let _ = ch.watch(cb, path, value.clone()).await;
                            }
                            WatchEvent::Tree(tree) => {
                                for (path, value) in tree.leaves() {
                                    let value =
                                        (!value.is_empty()).then(|| value.clone());
                                    let _ = ch.watch(cb, path, value).await;
                                }
                            }
                        }
                    };
                    self.timed(cb, fut).await
                }
                None => {
                    inc(&self.counters.watched_no_handler);
                    return;
                }
            },
        };
        if outcome.is_none() {
            inc(&self.counters.watched_timeout);
            warn!(guid = %cb.guid, "watcher timed out");
        }
    }
}

/// The engine. Construct with [`Engine::start`]; share as `Arc<Engine>`.
pub struct Engine {
    pub(crate) db: Db,
    pub(crate) registry: Registry,
    pub(crate) refreshes: RefreshLedger,
    dispatcher: Dispatcher,
    pub(crate) invoker: Arc<Invoker>,
    pub(crate) counters: Arc<Counters>,
    config: EngineConfig,
    forwarder: RwLock<Option<Arc<dyn ProxyForwarder>>>,
    pub(crate) socket_hook: RwLock<Option<Arc<dyn SocketHook>>>,
    debug: AtomicBool,
    pid: u64,
}

impl Engine {
    /// Build the engine and install the `/apteryx/*` surface.
    pub fn start(config: EngineConfig) -> Arc<Engine> {
        let pid = std::process::id() as u64;
        let counters = Arc::new(Counters::default());
        let invoker = Arc::new(Invoker::new(
            counters.clone(),
            config.callback_timeout(),
            pid,
        ));
        let dispatcher = Dispatcher::new(invoker.clone(), config.dispatch.workers);
        let debug = config.engine.debug;
        let engine = Arc::new(Engine {
            db: Db::new(),
            registry: Registry::new(),
            refreshes: RefreshLedger::new(),
            dispatcher,
            invoker,
            counters,
            config,
            forwarder: RwLock::new(None),
            socket_hook: RwLock::new(None),
            debug: AtomicBool::new(debug),
            pid,
        });
        surface::install(&engine);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, AtomicOrdering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(AtomicOrdering::Relaxed)
    }

    pub fn set_callback_channel(&self, channel: Arc<dyn CallbackChannel>) {
        *self.invoker.channel.write() = Some(channel);
    }

    pub fn set_proxy_forwarder(&self, forwarder: Arc<dyn ProxyForwarder>) {
        *self.forwarder.write() = Some(forwarder);
    }

    pub fn set_socket_hook(&self, hook: Arc<dyn SocketHook>) {
        *self.socket_hook.write() = Some(hook);
    }

    /// Drop every registration owned by a disconnected peer.
    pub fn drop_peer(&self, pid: u64) {
        for cb in self.registry.drop_pid(pid) {
            self.refreshes.forget(&cb.guid);
        }
    }

    /// Drain callbacks and stop, bounded by the configured drain budget.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown(self.config.shutdown_drain()).await;
    }

    // ---- mutations ----------------------------------------------------

    /// Single-path set. An empty (or absent) value unsets the leaf.
    pub async fn set(&self, origin: Origin, path: &str, value: Option<Bytes>) -> Result<()> {
        self.set_batch(origin, path.to_string(), vec![(path.to_string(), value)], None, false)
            .await
    }

    /// As [`Engine::set`], but returns only after every watcher queued by
    /// this mutation has completed.
    pub async fn set_wait(&self, origin: Origin, path: &str, value: Option<Bytes>) -> Result<()> {
        self.set_batch(origin, path.to_string(), vec![(path.to_string(), value)], None, true)
            .await
    }

    /// Compare-and-swap on the path's timestamp. `expected` of zero means
    /// "the path must not exist".
    pub async fn cas(
        &self,
        origin: Origin,
        path: &str,
        value: Option<Bytes>,
        expected: u64,
    ) -> Result<()> {
        self.set_batch(
            origin,
            path.to_string(),
            vec![(path.to_string(), value)],
            Some(expected),
            false,
        )
        .await
    }

    /// Apply a whole document atomically. Leaves with empty values unset.
    pub async fn set_tree(
        &self,
        origin: Origin,
        tree: &PathTree,
        expected: Option<u64>,
        wait: bool,
    ) -> Result<()> {
        let ops: Vec<(String, Option<Bytes>)> = tree
            .leaves()
            .map(|(p, v)| (p.to_string(), Some(v.clone())))
            .collect();
        self.set_batch(origin, tree.root().to_string(), ops, expected, wait).await
    }

    /// Shared mutation path: validate -> apply under one lock -> watch.
    /// `cas_root` names the path whose timestamp guards an `expected` CAS.
    /// This is what the RPC service calls; the typed helpers above are
    /// sugar over it.
    pub async fn set_batch(
        &self,
        origin: Origin,
        cas_root: String,
        ops: Vec<(String, Option<Bytes>)>,
        expected: Option<u64>,
        wait: bool,
    ) -> Result<()> {
        inc(&self.counters.set);
        for (p, _) in &ops {
            if let Err(err) = path::validate(p) {
                inc(&self.counters.set_invalid);
                return Err(err.into());
            }
        }
        // Empty values mean delete.
        let ops: Vec<(String, Option<Bytes>)> = ops
            .into_iter()
            .map(|(p, v)| (p, v.filter(|v| !v.is_empty())))
            .collect();

        // Proxied subtree? Hand the whole mutation to the remote.
        if ops.len() == 1 {
            if let Some((uri, stripped)) = self.find_proxy(&ops[0].0) {
                let forwarder = self.forwarder.read().clone();
                if let Some(fw) = forwarder {
                    inc(&self.counters.proxied);
                    match fw.set(&uri, vec![(stripped, ops[0].1.clone())], expected).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            inc(&self.counters.proxied_timeout);
                            debug!(%err, uri, "proxy set failed, falling back to local");
                        }
                    }
                } else {
                    inc(&self.counters.proxied_no_handler);
                }
            }
        }

        // Validators run before the write lock. Every path of the batch is
        // validated (a later path still gets its say after an earlier veto);
        // per path, the first non-zero status wins. Any veto aborts the
        // whole batch.
        let mut veto: Option<i32> = None;
        for (p, v) in &ops {
            for cb in self.registry.match_path(Kind::Validate, p) {
                let status = self.invoker.validate(&cb, p, v.as_ref()).await;
                if status != 0 {
                    trace!(path = %p, guid = %cb.guid, status, "mutation refused");
                    veto.get_or_insert(status);
                    break;
                }
            }
        }
        if let Some(status) = veto {
            return Err(StoreError::Refused(status).into());
        }

        let ts = self.db.next_timestamp();
        {
            let mut txn = self.db.write();
            if let Some(expected) = expected {
                if txn.timestamp(&cas_root) != expected {
                    return Err(StoreError::Busy.into());
                }
            }
            for (p, v) in &ops {
                txn.apply(p, v.clone(), ts);
            }
        }

        let batch = self.queue_watchers(origin, &cas_root, &ops, wait)?;
        if wait {
            if let Some(batch) = batch {
                batch.wait().await;
            }
        }
        Ok(())
    }

    /// Queue watcher jobs for an applied batch. Returns the wait batch when
    /// `wait` is set; `Err(Reentrant)` when the only thing a waiter could
    /// wait on is itself.
    fn queue_watchers(
        &self,
        origin: Origin,
        root: &str,
        ops: &[(String, Option<Bytes>)],
        wait: bool,
    ) -> Result<Option<Arc<WaitBatch>>> {
        let mut jobs: Vec<Job> = Vec::new();
        for (p, v) in ops {
            for cb in self.registry.match_path(Kind::Watch, p) {
                jobs.push(Job {
                    cb,
                    event: WatchEvent::Leaf {
                        path: p.clone(),
                        value: v.clone(),
                    },
                    batch: None,
                });
            }
        }
        // Tree-scoped watchers see the batch once.
        let mut tree_cbs: Vec<Arc<Callback>> = Vec::new();
        for (p, _) in ops {
            for cb in self.registry.match_path(Kind::WatchTree, p) {
                if !tree_cbs.iter().any(|seen| seen.guid == cb.guid) {
                    tree_cbs.push(cb);
                }
            }
        }
        if !tree_cbs.is_empty() {
            let pairs = ops
                .iter()
                .map(|(p, v)| (p.clone(), v.clone().unwrap_or_default()))
                .collect();
            let event = WatchEvent::Tree(PathTree::from_pairs(root.to_string(), pairs));
            for cb in tree_cbs {
                jobs.push(Job {
                    cb,
                    event: event.clone(),
                    batch: None,
                });
            }
        }

        if jobs.is_empty() {
            self.dispatcher.enqueue(self.effective_origin(origin).0, jobs);
            return Ok(None);
        }

        let current = current_callback();
        let mut reentrant = false;
        let mut waitable = 0usize;
        if wait {
            for job in &jobs {
                if current.as_deref() == Some(job.cb.guid.as_str()) {
                    reentrant = true;
                } else {
                    waitable += 1;
                }
            }
        }
        let batch = (wait && waitable > 0).then(|| WaitBatch::new(waitable));
        if let Some(batch) = &batch {
            for job in &mut jobs {
                if current.as_deref() != Some(job.cb.guid.as_str()) {
                    job.batch = Some(batch.clone());
                }
            }
        }
        self.dispatcher.enqueue(self.effective_origin(origin).0, jobs);
        if wait && reentrant {
            return Err(DispatchError::Reentrant.into());
        }
        Ok(batch)
    }

    /// Mutations issued from inside a callback drain on a queue derived
    /// from that callback, never on the queue currently being drained.
    fn effective_origin(&self, origin: Origin) -> Origin {
        match current_callback() {
            Some(guid) => {
                let mut hasher = DefaultHasher::new();
                guid.hash(&mut hasher);
                Origin(hasher.finish() | 0x8000_0000_0000_0000)
            }
            None => origin,
        }
    }

    /// Remove a whole subtree; watchers fire once per removed value.
    pub async fn prune(&self, origin: Origin, prune_path: &str) -> Result<()> {
        inc(&self.counters.prune);
        if prune_path != "/" {
            if let Err(err) = path::validate(prune_path) {
                inc(&self.counters.prune_invalid);
                return Err(err.into());
            }
        }
        if let Some((uri, stripped)) = self.find_proxy(prune_path) {
            let forwarder = self.forwarder.read().clone();
            if let Some(fw) = forwarder {
                inc(&self.counters.proxied);
                match fw.prune(&uri, &stripped).await {
                    Ok(()) => return Ok(()),
                    Err(err) => debug!(%err, uri, "proxy prune failed, falling back to local"),
                }
            }
        }

        let ts = self.db.next_timestamp();
        let removed = self.db.prune(prune_path, ts);

        let mut jobs: Vec<Job> = Vec::new();
        for (p, _prior) in &removed {
            for cb in self.registry.match_path(Kind::Watch, p) {
                jobs.push(Job {
                    cb,
                    event: WatchEvent::Leaf {
                        path: p.clone(),
                        value: None,
                    },
                    batch: None,
                });
            }
        }
        // One tree-shaped event for the whole prune.
        let mut tree_cbs: Vec<Arc<Callback>> = Vec::new();
        for (p, _) in &removed {
            for cb in self.registry.match_path(Kind::WatchTree, p) {
                if !tree_cbs.iter().any(|seen| seen.guid == cb.guid) {
                    tree_cbs.push(cb);
                }
            }
        }
        if !tree_cbs.is_empty() {
            let pairs = removed
                .iter()
                .map(|(p, _)| (p.clone(), Bytes::new()))
                .collect();
            let event = WatchEvent::Tree(PathTree::from_pairs(prune_path.to_string(), pairs));
            for cb in tree_cbs {
                jobs.push(Job {
                    cb,
                    event: event.clone(),
                    batch: None,
                });
            }
        }
        self.dispatcher.enqueue(self.effective_origin(origin).0, jobs);
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    /// Read composition: refresh -> stored value -> first provider.
    pub async fn get(&self, _origin: Origin, get_path: &str) -> Result<Option<Bytes>> {
        inc(&self.counters.get);
        if let Err(err) = path::validate(get_path) {
            inc(&self.counters.get_invalid);
            return Err(err.into());
        }
        if let Some((uri, stripped)) = self.find_proxy(get_path) {
            let forwarder = self.forwarder.read().clone();
            if let Some(fw) = forwarder {
                inc(&self.counters.proxied);
                match fw.get(&uri, &stripped).await {
                    Ok(value) => return Ok(value),
                    Err(err) => debug!(%err, uri, "proxy get failed, falling back to local"),
                }
            }
        }
        Ok(self.get_composed(get_path).await)
    }

    async fn get_composed(&self, get_path: &str) -> Option<Bytes> {
        self.run_refreshers(get_path).await;
        if let Some(value) = self.db.get(get_path) {
            return Some(value);
        }
        // Stored values shadow providers; only the first provider is asked.
        let cb = self.registry.match_path(Kind::Provide, get_path).into_iter().next()?;
        self.invoker.provide(&cb, get_path).await
    }

    async fn run_refreshers(&self, target: &str) {
        for cb in self.registry.match_path(Kind::Refresh, target) {
            let invoker = self.invoker.clone();
            let target_owned = target.to_string();
            let record = cb.clone();
            self.refreshes
                .run_if_stale(&cb.guid, target, move || async move {
                    invoker.refresh(&record, &target_owned).await
                })
                .await;
        }
    }

    /// Refreshers able to produce entries directly below `prefix`.
    async fn run_refreshers_covering(&self, prefix: &str) {
        let probe = format!("{prefix}\u{1}");
        for cb in self.registry.match_path(Kind::Refresh, &probe) {
            let invoker = self.invoker.clone();
            let prefix_owned = prefix.to_string();
            let record = cb.clone();
            self.refreshes
                .run_if_stale(&cb.guid, prefix, move || async move {
                    invoker.refresh(&record, &prefix_owned).await
                })
                .await;
        }
    }

    /// Immediate children of `prefix`: stored children unioned with the
    /// first answering indexer. Providers contribute nothing here.
    pub async fn search(&self, _origin: Origin, prefix: &str) -> Result<Vec<String>> {
        inc(&self.counters.search);
        if let Err(err) = path::validate_prefix(prefix) {
            inc(&self.counters.search_invalid);
            return Err(err.into());
        }
        let base = prefix.trim_end_matches('/');
        if !base.is_empty() {
            if let Some((uri, stripped)) = self.find_proxy(base) {
                let forwarder = self.forwarder.read().clone();
                if let Some(fw) = forwarder {
                    inc(&self.counters.proxied);
                    let mount = &base[..base.len() - stripped.len()];
                    match fw.search(&uri, &format!("{stripped}/")).await {
                        Ok(paths) => {
                            return Ok(paths
                                .into_iter()
                                .map(|p| format!("{mount}{p}"))
                                .collect())
                        }
                        Err(err) => {
                            debug!(%err, uri, "proxy search failed, falling back to local")
                        }
                    }
                }
            }
        }
        self.run_refreshers_covering(prefix).await;
        let mut results = self.db.search(prefix);
        results.extend(self.indexed_children(prefix).await);
        results.sort();
        results.dedup();
        Ok(results)
    }

    /// Ask indexers for children of `prefix`; first non-empty reply wins.
    async fn indexed_children(&self, prefix: &str) -> Vec<String> {
        let probe = format!("{prefix}\u{1}");
        let base = prefix.trim_end_matches('/');
        for cb in self.registry.match_path(Kind::Index, &probe) {
            if let Some(paths) = self.invoker.index(&cb, prefix).await {
                if paths.is_empty() {
                    continue;
                }
                return paths
                    .into_iter()
                    .filter(|p| {
                        let parent = path::parent(p);
                        if base.is_empty() { parent == "/" } else { parent == base }
                    })
                    .collect();
            }
        }
        Vec::new()
    }

    /// Deep read of a subtree, composing stored values with indexers,
    /// providers and refreshers.
    pub async fn traverse(&self, _origin: Origin, root: &str) -> Result<PathTree> {
        inc(&self.counters.traverse);
        if root != "/" {
            if let Err(err) = path::validate(root) {
                inc(&self.counters.traverse_invalid);
                return Err(err.into());
            }
        }
        if let Some((uri, stripped)) = self.find_proxy(root) {
            let forwarder = self.forwarder.read().clone();
            if let Some(fw) = forwarder {
                inc(&self.counters.proxied);
                let mount = &root[..root.len() - stripped.len()];
                match fw.traverse(&uri, &stripped).await {
                    Ok(leaves) => {
                        let pairs = leaves
                            .into_iter()
                            .map(|(p, v)| (format!("{mount}{p}"), v))
                            .collect();
                        return Ok(PathTree::from_pairs(root.to_string(), pairs));
                    }
                    Err(err) => debug!(%err, uri, "proxy traverse failed, falling back to local"),
                }
            }
        }

        let compose = self.registry.exists(Kind::Provide, root)
            || self.registry.exists(Kind::Index, root)
            || self.registry.exists(Kind::Refresh, root);
        if !compose {
            return Ok(PathTree::from_pairs(root.to_string(), self.db.traverse(root)));
        }
        let mut leaves = Vec::new();
        self.browse(root.to_string(), &mut leaves).await;
        Ok(PathTree::from_pairs(root.to_string(), leaves))
    }

    /// Recursive search/get walk used when synthesized data may appear.
    fn browse<'a>(
        &'a self,
        node: String,
        out: &'a mut Vec<(String, Bytes)>,
    ) -> BoxFuture<'a, ()> {
        async move {
            if let Some(value) = self.get_composed(&node).await {
                out.push((node.clone(), value));
            }
            for child in self.children_of(&node).await {
                self.browse(child, out).await;
            }
        }
        .boxed()
    }

    /// Child enumeration for composed walks: stored children, indexer
    /// output, and the concrete next-level names of provider / indexer /
    /// refresher registrations.
    async fn children_of(&self, node: &str) -> Vec<String> {
        let prefix = if node == "/" {
            "/".to_string()
        } else {
            format!("{node}/")
        };
        let mut kids = self.db.search(&prefix);
        kids.extend(self.indexed_children(&prefix).await);
        kids.extend(self.registry.search(Kind::Provide, &prefix));
        kids.extend(self.registry.search(Kind::Index, &prefix));
        kids.extend(self.registry.search(Kind::Refresh, &prefix));
        kids.sort();
        kids.dedup();
        kids
    }

    /// Batched reads: every template leaf is resolved against the store,
    /// `*` segments expand through search, a trailing `*` pulls the whole
    /// subtree, a trailing `/` one level of leaves.
    pub async fn query(&self, _origin: Origin, template: &PathTree) -> Result<PathTree> {
        inc(&self.counters.query);
        let mut out: Vec<(String, Bytes)> = Vec::new();
        for (pattern, _) in template.leaves() {
            let segs: Vec<&str> = pattern.split('/').skip(1).collect();
            self.expand(String::new(), &segs, &mut out).await;
        }
        out.sort();
        out.dedup();
        Ok(PathTree::from_pairs(
            path::common_prefix(out.iter().map(|(p, _)| p.as_str())),
            out,
        ))
    }

    fn expand<'a>(
        &'a self,
        prefix: String,
        segs: &'a [&'a str],
        out: &'a mut Vec<(String, Bytes)>,
    ) -> BoxFuture<'a, ()> {
        async move {
            match segs.split_first() {
                None => {
                    if let Some(value) = self.get_composed(&prefix).await {
                        out.push((prefix, value));
                    }
                }
                Some((&"*", rest)) if rest.is_empty() => {
                    // Whole subtree below the resolved prefix.
                    self.browse(prefix, out).await;
                }
                Some((&"*", rest)) => {
                    for child in self.children_of(&prefix).await {
                        self.expand(child, rest, out).await;
                    }
                }
                Some((&"", rest)) if rest.is_empty() => {
                    // Trailing slash: one level of leaves.
                    for child in self.children_of(&prefix).await {
                        if let Some(value) = self.get_composed(&child).await {
                            out.push((child, value));
                        }
                    }
                }
                Some((seg, rest)) => {
                    self.expand(format!("{prefix}/{seg}"), rest, out).await;
                }
            }
        }
        .boxed()
    }

    /// Concrete roots matching a starred pattern whose relative leaves all
    /// carry the expected values.
    pub async fn find(
        &self,
        _origin: Origin,
        root_pattern: &str,
        filters: &[(String, Bytes)],
    ) -> Result<Vec<String>> {
        inc(&self.counters.find);
        if let Err(err) = path::validate_pattern(root_pattern) {
            inc(&self.counters.find_invalid);
            return Err(err.into());
        }
        let segs: Vec<&str> = root_pattern.split('/').skip(1).collect();
        let mut candidates = Vec::new();
        self.expand_roots(String::new(), &segs, &mut candidates).await;

        let mut matched = Vec::new();
        'candidates: for root in candidates {
            for (rel, expected) in filters {
                let leaf_path = format!("{root}/{rel}");
                match self.get_composed(&leaf_path).await {
                    Some(value) if value == *expected => {}
                    _ => continue 'candidates,
                }
            }
            matched.push(root);
        }
        matched.sort();
        Ok(matched)
    }

    fn expand_roots<'a>(
        &'a self,
        prefix: String,
        segs: &'a [&'a str],
        out: &'a mut Vec<String>,
    ) -> BoxFuture<'a, ()> {
        async move {
            match segs.split_first() {
                None => out.push(prefix),
                Some((&"*", rest)) => {
                    for child in self.children_of(&prefix).await {
                        self.expand_roots(child, rest, out).await;
                    }
                }
                Some((&"", rest)) if rest.is_empty() => out.push(prefix),
                Some((seg, rest)) => {
                    self.expand_roots(format!("{prefix}/{seg}"), rest, out).await;
                }
            }
        }
        .boxed()
    }

    /// Most recent stamp within the subtree at `path`; zero when absent.
    pub async fn timestamp(&self, _origin: Origin, ts_path: &str) -> Result<u64> {
        inc(&self.counters.timestamp);
        let base = if ts_path == "/" { "/" } else { ts_path.trim_end_matches('/') };
        if base != "/" {
            if let Err(err) = path::validate(base) {
                inc(&self.counters.timestamp_invalid);
                return Err(err.into());
            }
        }
        if let Some((uri, stripped)) = self.find_proxy(base) {
            let forwarder = self.forwarder.read().clone();
            if let Some(fw) = forwarder {
                inc(&self.counters.proxied);
                match fw.timestamp(&uri, &stripped).await {
                    Ok(ts) => return Ok(ts),
                    Err(err) => debug!(%err, uri, "proxy timestamp failed, falling back to local"),
                }
            }
        }
        Ok(self.db.timestamp(base))
    }

    /// Value bytes plus node overhead under `path`.
    pub async fn memuse(&self, _origin: Origin, mem_path: &str) -> Result<u64> {
        inc(&self.counters.memuse);
        let base = if mem_path == "/" { "/" } else { mem_path.trim_end_matches('/') };
        if base != "/" {
            if let Err(err) = path::validate(base) {
                inc(&self.counters.memuse_invalid);
                return Err(err.into());
            }
        }
        Ok(self.db.memuse(base))
    }

    /// First matching proxy for `target`: the forwarding URI and the target
    /// with the proxy's fixed prefix stripped.
    fn find_proxy(&self, target: &str) -> Option<(String, String)> {
        if path::is_under(target, surface::ROOT) {
            return None;
        }
        let cb = self.registry.match_path(Kind::Proxy, target).into_iter().next()?;
        let uri = cb.uri.clone()?;
        let fixed: String = {
            let mut fixed = String::new();
            for seg in path::pattern_segments(&cb.pattern) {
                if seg == path::WILDCARD || seg.is_empty() {
                    break;
                }
                fixed.push('/');
                fixed.push_str(seg);
            }
            fixed
        };
        let stripped = match target.strip_prefix(&fixed) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => return None,
        };
        Some((uri, stripped))
    }

    // ---- local callback registration -----------------------------------

    /// Watch `pattern`; the closure receives `(path, value)` per change,
    /// `None` meaning deleted.
    pub async fn watch(&self, pattern: &str, f: WatchFn) -> Result<String> {
        self.register(Kind::Watch, pattern, LocalCallback::Watch(f)).await
    }

    /// Watch `pattern` with batch (tree-shaped) delivery.
    pub async fn watch_tree(&self, pattern: &str, f: WatchTreeFn) -> Result<String> {
        self.register(Kind::WatchTree, pattern, LocalCallback::WatchTree(f))
            .await
    }

    /// Veto mutations under `pattern`: return zero to accept, a negative
    /// errno to refuse.
    pub async fn validate(&self, pattern: &str, f: ValidateFn) -> Result<String> {
        self.register(Kind::Validate, pattern, LocalCallback::Validate(f))
            .await
    }

    /// Synthesize values for reads under `pattern`.
    pub async fn provide(&self, pattern: &str, f: ProvideFn) -> Result<String> {
        self.register(Kind::Provide, pattern, LocalCallback::Provide(f))
            .await
    }

    /// Enumerate dynamic children for searches under `pattern`.
    pub async fn index(&self, pattern: &str, f: IndexFn) -> Result<String> {
        self.register(Kind::Index, pattern, LocalCallback::Index(f)).await
    }

    /// Repopulate stale data before reads under `pattern`; the closure
    /// returns its TTL in microseconds.
    pub async fn refresh(&self, pattern: &str, f: RefreshFn) -> Result<String> {
        self.register(Kind::Refresh, pattern, LocalCallback::Refresh(f))
            .await
    }

    /// Forward operations under `pattern` to the instance at `uri`.
    pub async fn proxy(&self, pattern: &str, uri: &str) -> Result<String> {
        path::validate_pattern(pattern)?;
        // Proxies have no local closure; the handle only feeds the GUID.
        let handle = self.invoker.handles.reserve();
        let guid = make_guid(self.pid, handle, hash_pattern(pattern));
        let reg_path = format!("{}/{}", surface::PROXIES_PATH, guid);
        self.set_wait(Origin::LOCAL, &reg_path, Some(Bytes::from(format!("{uri}:{pattern}"))))
            .await?;
        Ok(guid)
    }

    /// Remove a registration made through any of the helpers above.
    pub async fn unregister(&self, guid: &str) -> Result<()> {
        let Some(cb) = self.registry.find(guid) else {
            return Ok(());
        };
        let reg_path = format!("{}/{}", surface::prefix_for(cb.kind), guid);
        self.set_wait(Origin::LOCAL, &reg_path, None).await?;
        self.invoker.handles.remove(cb.handle);
        Ok(())
    }

    /// Registration is a plain store write under `/apteryx/`; waiting for
    /// the watcher drain makes it effective before this returns.
    async fn register(&self, kind: Kind, pattern: &str, cb: LocalCallback) -> Result<String> {
        path::validate_pattern(pattern)?;
        let handle = self.invoker.handles.register(cb);
        let guid = make_guid(self.pid, handle, hash_pattern(pattern));
        let reg_path = format!("{}/{}", surface::prefix_for(kind), guid);
        self.set_wait(Origin::LOCAL, &reg_path, Some(Bytes::from(pattern.to_string())))
            .await?;
        Ok(guid)
    }
}

fn hash_pattern(pattern: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    pattern.hash(&mut hasher);
    hasher.finish()
}
