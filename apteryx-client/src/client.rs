//! The typed client.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tracing::debug;

use apteryx_core::handles::HandleTable;
use apteryx_core::handles::LocalCallback;
use apteryx_core::make_guid;
use apteryx_core::path;
use apteryx_core::surface;
use apteryx_core::Error;
use apteryx_core::IndexFn;
use apteryx_core::Kind;
use apteryx_core::PathTree;
use apteryx_core::ProvideFn;
use apteryx_core::RefreshFn;
use apteryx_core::Result;
use apteryx_core::RpcError;
use apteryx_core::StoreError;
use apteryx_core::ValidateFn;
use apteryx_core::WatchFn;
use apteryx_core::WatchTreeFn;
use apteryx_proto::Leaf;
use apteryx_proto::ListenUri;
use apteryx_proto::Reply;
use apteryx_proto::Request;
use apteryx_proto::SetOp;
use apteryx_proto::Status;
use apteryx_proto::TS_UNCONDITIONAL;

use crate::callback;
use crate::pool::Connection;
use crate::pool::Pool;

/// Configures a [`Client`].
pub struct ClientBuilder {
    uri: String,
    pool_size: usize,
    timeout: Duration,
    background_callbacks: bool,
}

impl ClientBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        ClientBuilder {
            uri: uri.into(),
            pool_size: 4,
            timeout: Duration::from_secs(1),
            background_callbacks: true,
        }
    }

    /// Idle connections kept per remote.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Per-request reply budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// With `false`, the callback service does not run in the background;
    /// drive it yourself with [`Client::process`].
    pub fn background_callbacks(mut self, background: bool) -> Self {
        self.background_callbacks = background;
        self
    }

    pub fn build(self) -> Result<Client> {
        let uri: ListenUri = self.uri.parse().map_err(RpcError::from)?;
        Ok(Client {
            inner: Arc::new(Inner {
                pool: Pool::new(uri.clone(), self.pool_size, self.timeout),
                uri,
                timeout: self.timeout,
                registration: tokio::sync::Mutex::new(None),
                callbacks: Arc::new(HandleTable::new()),
                registered: DashMap::new(),
                service: Mutex::new(ServiceState::NotStarted),
                background_callbacks: self.background_callbacks,
                pid: std::process::id() as u64,
            }),
        })
    }
}

enum ServiceState {
    NotStarted,
    /// Bound but waiting for [`Client::process`] to drive it.
    Bound(Option<UnixListener>),
    Running(tokio::task::JoinHandle<()>),
}

struct Inner {
    uri: ListenUri,
    pool: Pool,
    timeout: Duration,
    /// Dedicated connection for registry writes: registrations live exactly
    /// as long as this connection, which the server uses for cleanup.
    registration: tokio::sync::Mutex<Option<Connection>>,
    callbacks: Arc<HandleTable>,
    registered: DashMap<String, (Kind, u64)>,
    service: Mutex<ServiceState>,
    background_callbacks: bool,
    pid: u64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let ServiceState::Running(task) = &*self.service.lock() {
            task.abort();
        }
        if let Some(path) = self.callback_socket_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Inner {
    fn callback_socket_path(&self) -> Option<PathBuf> {
        match &self.uri {
            ListenUri::Unix(path) => {
                Some(PathBuf::from(format!("{}.{}", path.display(), self.pid)))
            }
            ListenUri::Tcp(_) => None,
        }
    }
}

/// Handle to one apteryx instance. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

fn status_to_result(code: i32) -> Result<()> {
    match Status::from_i32(code) {
        Status::Ok => Ok(()),
        Status::Busy => Err(StoreError::Busy.into()),
        Status::Invalid => Err(StoreError::InvalidPath(String::new()).into()),
        Status::Range => Err(StoreError::Range.into()),
        Status::Timeout => Err(RpcError::Timeout.into()),
        other => Err(StoreError::Refused(other.as_i32()).into()),
    }
}

fn hash_pattern(pattern: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    pattern.hash(&mut hasher);
    hasher.finish()
}

impl Client {
    /// Connect with defaults; the URI is `unix:///path` or `tcp://host:port`.
    pub async fn connect(uri: impl Into<String>) -> Result<Client> {
        let client = ClientBuilder::new(uri).build()?;
        // Fail fast when nothing is listening.
        client.test(0, "hello").await?;
        Ok(client)
    }

    pub fn builder(uri: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(uri)
    }

    async fn request(&self, request: &Request) -> Result<Reply> {
        Ok(self.inner.pool.request(request).await?)
    }

    // ---- operations ----------------------------------------------------

    /// Store `value` at `path`. An empty value unsets.
    pub async fn set(&self, set_path: &str, value: impl Into<Bytes>) -> Result<()> {
        self.set_op(set_path, Some(value.into()), TS_UNCONDITIONAL, false).await
    }

    /// Remove the value at `path`.
    pub async fn unset(&self, set_path: &str) -> Result<()> {
        self.set_op(set_path, None, TS_UNCONDITIONAL, false).await
    }

    /// Store `value` and return only after every watcher it triggered has
    /// run.
    pub async fn set_wait(&self, set_path: &str, value: impl Into<Bytes>) -> Result<()> {
        self.set_op(set_path, Some(value.into()), TS_UNCONDITIONAL, true).await
    }

    /// Compare-and-swap keyed on the path's last-modified stamp; an
    /// `expected` of zero demands the path not exist.
    pub async fn cas(&self, set_path: &str, value: impl Into<Bytes>, expected: u64) -> Result<()> {
        self.set_op(set_path, Some(value.into()), expected, false).await
    }

    async fn set_op(
        &self,
        set_path: &str,
        value: Option<Bytes>,
        expected: u64,
        wait: bool,
    ) -> Result<()> {
        let request = Request::Set {
            ops: vec![SetOp {
                path: set_path.to_string(),
                value,
                ts: 0,
            }],
            expected,
            wait,
        };
        match self.request(&request).await? {
            Reply::Status(code) => status_to_result(code),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Apply a whole document atomically.
    pub async fn set_tree(&self, tree: &PathTree) -> Result<()> {
        self.set_tree_op(tree, TS_UNCONDITIONAL, false).await
    }

    /// As [`Client::set_tree`] with a CAS guard on the document root.
    pub async fn set_tree_cas(&self, tree: &PathTree, expected: u64) -> Result<()> {
        self.set_tree_op(tree, expected, false).await
    }

    async fn set_tree_op(&self, tree: &PathTree, expected: u64, wait: bool) -> Result<()> {
        let ops = tree
            .leaves()
            .map(|(leaf_path, value)| SetOp {
                path: leaf_path.to_string(),
                value: Some(value.clone()),
                ts: 0,
            })
            .collect();
        let request = Request::Set { ops, expected, wait };
        match self.request(&request).await? {
            Reply::Status(code) => status_to_result(code),
            _ => Err(RpcError::Closed.into()),
        }
    }

    pub async fn get(&self, get_path: &str) -> Result<Option<Bytes>> {
        match self.request(&Request::Get { path: get_path.to_string() }).await? {
            Reply::Value(value) => Ok(value),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Convenience UTF-8 read; non-UTF-8 values come back as an error.
    pub async fn get_string(&self, get_path: &str) -> Result<Option<String>> {
        match self.get(get_path).await? {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|_| StoreError::Range.into()),
            None => Ok(None),
        }
    }

    /// Immediate children of `prefix` (which must end with `/`).
    pub async fn search(&self, prefix: &str) -> Result<Vec<String>> {
        match self.request(&Request::Search { prefix: prefix.to_string() }).await? {
            Reply::Paths(paths) => Ok(paths),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// The whole subtree at `path`.
    pub async fn get_tree(&self, tree_path: &str) -> Result<PathTree> {
        match self.request(&Request::Traverse { path: tree_path.to_string() }).await? {
            Reply::Tree(leaves) => Ok(PathTree::from_wire(leaves)),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Batched reads against a template; `*` segments expand server-side.
    pub async fn query(&self, template: &PathTree) -> Result<PathTree> {
        let request = Request::Query { template: template.to_wire() };
        match self.request(&request).await? {
            Reply::Tree(leaves) => Ok(PathTree::from_wire(leaves)),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Concrete roots below a starred pattern whose `leaf` equals `value`.
    pub async fn find(
        &self,
        root_pattern: &str,
        leaf: &str,
        value: impl Into<Bytes>,
    ) -> Result<Vec<String>> {
        self.find_tree(root_pattern, vec![(leaf.to_string(), value.into())]).await
    }

    /// Multi-leaf AND filter variant of [`Client::find`].
    pub async fn find_tree(
        &self,
        root_pattern: &str,
        filters: Vec<(String, Bytes)>,
    ) -> Result<Vec<String>> {
        let request = Request::Find {
            pattern: root_pattern.to_string(),
            matches: filters
                .into_iter()
                .map(|(leaf_path, value)| Leaf { path: leaf_path, value })
                .collect(),
        };
        match self.request(&request).await? {
            Reply::Paths(paths) => Ok(paths),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Remove the whole subtree at `path`.
    pub async fn prune(&self, prune_path: &str) -> Result<()> {
        let request = Request::Prune {
            path: prune_path.to_string(),
            ts: 0,
        };
        match self.request(&request).await? {
            Reply::Status(code) => status_to_result(code),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Most recent stamp in the subtree; zero when absent.
    pub async fn timestamp(&self, ts_path: &str) -> Result<u64> {
        match self.request(&Request::Timestamp { path: ts_path.to_string() }).await? {
            Reply::Uint64(ts) => Ok(ts),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Memory accounted to the subtree at `path`.
    pub async fn memuse(&self, mem_path: &str) -> Result<u64> {
        match self.request(&Request::Memuse { path: mem_path.to_string() }).await? {
            Reply::Uint64(bytes) => Ok(bytes),
            _ => Err(RpcError::Closed.into()),
        }
    }

    /// Protocol echo, used by plumbing tests.
    pub async fn test(&self, mode: u8, echo: &str) -> Result<String> {
        let request = Request::Test {
            mode,
            echo: echo.to_string(),
        };
        match self.request(&request).await? {
            Reply::Echo(echo) => Ok(echo),
            _ => Err(RpcError::Closed.into()),
        }
    }

    // ---- callback registration -----------------------------------------

    /// Watch `pattern`; `None` value means deleted.
    pub async fn watch(&self, pattern: &str, f: WatchFn) -> Result<String> {
        self.register(Kind::Watch, pattern, LocalCallback::Watch(f)).await
    }

    /// Watch `pattern` with tree-shaped delivery: a `set_tree` or prune
    /// arrives as whole documents rather than leaf events. A remote engine
    /// relays the batch leaf by leaf, so each document holds one leaf; an
    /// empty value marks a deletion.
    pub async fn watch_tree(&self, pattern: &str, f: WatchTreeFn) -> Result<String> {
        self.register(Kind::WatchTree, pattern, LocalCallback::WatchTree(f)).await
    }

    /// Veto mutations under `pattern` with a non-zero status.
    pub async fn validate(&self, pattern: &str, f: ValidateFn) -> Result<String> {
        self.register(Kind::Validate, pattern, LocalCallback::Validate(f)).await
    }

    /// Synthesize values for reads under `pattern`.
    pub async fn provide(&self, pattern: &str, f: ProvideFn) -> Result<String> {
        self.register(Kind::Provide, pattern, LocalCallback::Provide(f)).await
    }

    /// Enumerate dynamic children under `pattern`.
    pub async fn index(&self, pattern: &str, f: IndexFn) -> Result<String> {
        self.register(Kind::Index, pattern, LocalCallback::Index(f)).await
    }

    /// Repopulate stale subtrees; the closure returns a TTL in microseconds.
    pub async fn refresh(&self, pattern: &str, f: RefreshFn) -> Result<String> {
        self.register(Kind::Refresh, pattern, LocalCallback::Refresh(f)).await
    }

    /// Forward the subtree at `pattern` to the instance at `uri`.
    pub async fn proxy(&self, pattern: &str, uri: &str) -> Result<String> {
        path::validate_pattern(pattern)?;
        let handle = self.inner.callbacks.reserve();
        let guid = make_guid(self.inner.pid, handle, hash_pattern(pattern));
        let reg_path = format!("{}/{}", surface::PROXIES_PATH, guid);
        self.registration_set(&reg_path, Some(Bytes::from(format!("{uri}:{pattern}"))))
            .await?;
        self.inner.registered.insert(guid.clone(), (Kind::Proxy, handle));
        Ok(guid)
    }

    /// Remove any registration made through this client.
    pub async fn unregister(&self, guid: &str) -> Result<()> {
        let Some((_, (kind, handle))) = self.inner.registered.remove(guid) else {
            return Ok(());
        };
        let reg_path = format!("{}/{}", surface::prefix_for(kind), guid);
        self.registration_set(&reg_path, None).await?;
        self.inner.callbacks.remove(handle);
        Ok(())
    }

    async fn register(&self, kind: Kind, pattern: &str, cb: LocalCallback) -> Result<String> {
        path::validate_pattern(pattern)?;
        self.ensure_callback_service().await?;
        let handle = self.inner.callbacks.register(cb);
        let guid = make_guid(self.inner.pid, handle, hash_pattern(pattern));
        let reg_path = format!("{}/{}", surface::prefix_for(kind), guid);
        self.registration_set(&reg_path, Some(Bytes::from(pattern.to_string())))
            .await?;
        self.inner.registered.insert(guid.clone(), (kind, handle));
        Ok(guid)
    }

    /// Registry writes ride a dedicated connection: the server ties the
    /// lifetime of this process's registrations to it.
    async fn registration_set(&self, reg_path: &str, value: Option<Bytes>) -> Result<()> {
        let request = Request::Set {
            ops: vec![SetOp {
                path: reg_path.to_string(),
                value,
                ts: 0,
            }],
            expected: TS_UNCONDITIONAL,
            wait: true,
        };
        let mut slot = self.inner.registration.lock().await;
        if slot.is_none() {
            let conn = Connection::connect(&self.inner.uri).await.map_err(Error::from)?;
            *slot = Some(conn);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(RpcError::Closed.into());
        };
        match conn.request(&request, self.inner.timeout).await {
            Ok(Reply::Status(code)) => status_to_result(code),
            Ok(_) => Err(RpcError::Closed.into()),
            Err(err) => {
                *slot = None;
                Err(err.into())
            }
        }
    }

    /// Bind the callback listener; spawn the accept loop unless the client
    /// was built for explicit processing.
    async fn ensure_callback_service(&self) -> Result<()> {
        let Some(sock_path) = self.inner.callback_socket_path() else {
            return Err(RpcError::Uri(apteryx_proto::UriError::Scheme(
                "callbacks require a unix:// daemon".to_string(),
            ))
            .into());
        };
        // Bind and publish under one lock so two concurrent registrations
        // cannot race each other for the socket path.
        let mut state = self.inner.service.lock();
        if !matches!(*state, ServiceState::NotStarted) {
            return Ok(());
        }
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).map_err(RpcError::from)?;
        debug!(path = %sock_path.display(), "callback service bound");
        if self.inner.background_callbacks {
            let callbacks = self.inner.callbacks.clone();
            let task = tokio::spawn(callback::serve(listener, callbacks));
            *state = ServiceState::Running(task);
        } else {
            *state = ServiceState::Bound(Some(listener));
        }
        Ok(())
    }

    /// Drive the callback service on the caller's task (process mode).
    /// Returns an error when the client was built with background
    /// callbacks, which are already being served.
    pub async fn process(&self) -> Result<()> {
        let listener = {
            let mut state = self.inner.service.lock();
            match &mut *state {
                ServiceState::Bound(listener) => listener.take(),
                _ => None,
            }
        };
        let Some(listener) = listener else {
            return Err(RpcError::Closed.into());
        };
        callback::serve(listener, self.inner.callbacks.clone()).await;
        Ok(())
    }
}
