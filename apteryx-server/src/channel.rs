//! Outbound RPC from the daemon: callback invocations to registered
//! clients, and operation forwarding for proxied subtrees.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use apteryx_client::pool::Pool;
use apteryx_core::Callback;
use apteryx_core::CallbackChannel;
use apteryx_core::ProxyForwarder;
use apteryx_core::Result;
use apteryx_core::RpcError;
use apteryx_proto::Leaf;
use apteryx_proto::ListenUri;
use apteryx_proto::Reply;
use apteryx_proto::Request;
use apteryx_proto::SetOp;
use apteryx_proto::TS_UNCONDITIONAL;

/// Reaches the callback service a client binds at `<base>.<pid>`.
pub struct RemoteChannel {
    base: PathBuf,
    pools: DashMap<u64, Arc<Pool>>,
    timeout: Duration,
    pool_size: usize,
}

impl RemoteChannel {
    pub fn new(base: PathBuf, timeout: Duration, pool_size: usize) -> Self {
        RemoteChannel {
            base,
            pools: DashMap::new(),
            timeout,
            pool_size,
        }
    }

    fn pool_for(&self, pid: u64) -> Arc<Pool> {
        self.pools
            .entry(pid)
            .or_insert_with(|| {
                let sock = PathBuf::from(format!("{}.{pid}", self.base.display()));
                trace!(pid, path = %sock.display(), "callback channel pool");
                Arc::new(Pool::new(ListenUri::Unix(sock), self.pool_size, self.timeout))
            })
            .clone()
    }

    async fn roundtrip(&self, pid: u64, request: Request) -> Result<Reply> {
        Ok(self.pool_for(pid).request(&request).await?)
    }
}

#[async_trait]
impl CallbackChannel for RemoteChannel {
    async fn watch(&self, cb: &Callback, path: &str, value: Option<Bytes>) -> Result<()> {
        let reply = self
            .roundtrip(
                cb.pid,
                Request::Watch {
                    handle: cb.handle,
                    path: path.to_string(),
                    value,
                },
            )
            .await?;
        match reply {
            Reply::Status(_) => Ok(()),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn validate(&self, cb: &Callback, path: &str, value: Option<Bytes>) -> Result<i32> {
        let reply = self
            .roundtrip(
                cb.pid,
                Request::Validate {
                    handle: cb.handle,
                    path: path.to_string(),
                    value,
                },
            )
            .await?;
        match reply {
            Reply::Status(code) => Ok(code),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn provide(&self, cb: &Callback, path: &str) -> Result<Option<Bytes>> {
        let reply = self
            .roundtrip(
                cb.pid,
                Request::Provide {
                    handle: cb.handle,
                    path: path.to_string(),
                },
            )
            .await?;
        match reply {
            Reply::Value(value) => Ok(value),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn index(&self, cb: &Callback, path: &str) -> Result<Vec<String>> {
        let reply = self
            .roundtrip(
                cb.pid,
                Request::Index {
                    handle: cb.handle,
                    path: path.to_string(),
                },
            )
            .await?;
        match reply {
            Reply::Paths(paths) => Ok(paths),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn refresh(&self, cb: &Callback, path: &str) -> Result<u64> {
        let reply = self
            .roundtrip(
                cb.pid,
                Request::Refresh {
                    handle: cb.handle,
                    path: path.to_string(),
                },
            )
            .await?;
        match reply {
            Reply::Uint64(ttl) => Ok(ttl),
            _ => Err(RpcError::Closed.into()),
        }
    }
}

/// Forwards operations for proxied subtrees, one pool per remote URI.
pub struct ProxyClient {
    pools: DashMap<String, Arc<Pool>>,
    timeout: Duration,
    pool_size: usize,
}

impl ProxyClient {
    pub fn new(timeout: Duration, pool_size: usize) -> Self {
        ProxyClient {
            pools: DashMap::new(),
            timeout,
            pool_size,
        }
    }

    fn pool_for(&self, uri: &str) -> Result<Arc<Pool>> {
        if let Some(pool) = self.pools.get(uri) {
            return Ok(pool.clone());
        }
        let parsed: ListenUri = uri.parse().map_err(RpcError::from)?;
        let pool = Arc::new(Pool::new(parsed, self.pool_size, self.timeout));
        self.pools.insert(uri.to_string(), pool.clone());
        Ok(pool)
    }

    async fn roundtrip(&self, uri: &str, request: Request) -> Result<Reply> {
        Ok(self.pool_for(uri)?.request(&request).await?)
    }
}

#[async_trait]
impl ProxyForwarder for ProxyClient {
    async fn get(&self, uri: &str, path: &str) -> Result<Option<Bytes>> {
        match self.roundtrip(uri, Request::Get { path: path.to_string() }).await? {
            Reply::Value(value) => Ok(value),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn set(
        &self,
        uri: &str,
        ops: Vec<(String, Option<Bytes>)>,
        expected: Option<u64>,
    ) -> Result<()> {
        let request = Request::Set {
            ops: ops
                .into_iter()
                .map(|(path, value)| SetOp { path, value, ts: 0 })
                .collect(),
            expected: expected.unwrap_or(TS_UNCONDITIONAL),
            wait: false,
        };
        match self.roundtrip(uri, request).await? {
            Reply::Status(0) => Ok(()),
            Reply::Status(code) => Err(RpcError::Remote(code).into()),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn search(&self, uri: &str, prefix: &str) -> Result<Vec<String>> {
        let request = Request::Search {
            prefix: prefix.to_string(),
        };
        match self.roundtrip(uri, request).await? {
            Reply::Paths(paths) => Ok(paths),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn traverse(&self, uri: &str, path: &str) -> Result<Vec<(String, Bytes)>> {
        let request = Request::Traverse {
            path: path.to_string(),
        };
        match self.roundtrip(uri, request).await? {
            Reply::Tree(leaves) => Ok(leaves
                .into_iter()
                .map(|Leaf { path, value }| (path, value))
                .collect()),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn prune(&self, uri: &str, path: &str) -> Result<()> {
        let request = Request::Prune {
            path: path.to_string(),
            ts: 0,
        };
        match self.roundtrip(uri, request).await? {
            Reply::Status(0) => Ok(()),
            Reply::Status(code) => Err(RpcError::Remote(code).into()),
            _ => Err(RpcError::Closed.into()),
        }
    }

    async fn timestamp(&self, uri: &str, path: &str) -> Result<u64> {
        let request = Request::Timestamp {
            path: path.to_string(),
        };
        match self.roundtrip(uri, request).await? {
            Reply::Uint64(ts) => Ok(ts),
            _ => Err(RpcError::Closed.into()),
        }
    }
}
