//! Listener management.
//!
//! The server owns a table of live listeners keyed by GUID. The primary
//! listener comes from configuration at startup under the reserved key
//! `default`; the rest arrive through `/apteryx/sockets/<guid>` writes,
//! which the engine routes here via the [`SocketHook`] seam.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use apteryx_core::Engine;
use apteryx_core::Origin;
use apteryx_core::Result;
use apteryx_core::RpcError;
use apteryx_core::SocketHook;
use apteryx_proto::ListenUri;

use crate::channel::ProxyClient;
use crate::channel::RemoteChannel;
use crate::service;

struct ListenerEntry {
    uri: ListenUri,
    task: JoinHandle<()>,
    /// UNIX socket file to unlink on release.
    sock_path: Option<PathBuf>,
}

/// The RPC server. One per engine.
pub struct Server {
    engine: Arc<Engine>,
    listeners: DashMap<String, ListenerEntry>,
    next_origin: Arc<AtomicU64>,
}

impl Server {
    /// Bind the configured primary listener and wire the server into the
    /// engine (socket hook, callback channel, proxy forwarder).
    pub async fn start(engine: Arc<Engine>) -> Result<Arc<Server>> {
        let server = Arc::new(Server {
            engine: engine.clone(),
            listeners: DashMap::new(),
            next_origin: Arc::new(AtomicU64::new(Origin::FIRST_REMOTE)),
        });

        let config = engine.config().clone();
        let primary: ListenUri = config.engine.socket.parse().map_err(RpcError::from)?;
        if let ListenUri::Unix(base) = &primary {
            engine.set_callback_channel(Arc::new(RemoteChannel::new(
                base.clone(),
                config.rpc_timeout(),
                config.rpc.pool_size,
            )));
        }
        engine.set_proxy_forwarder(Arc::new(ProxyClient::new(
            config.rpc_timeout(),
            config.rpc.pool_size,
        )));
        engine.set_socket_hook(server.clone());

        if !server.bind_listener("default", &config.engine.socket).await {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("cannot bind {}", config.engine.socket),
            ))
            .into());
        }
        Ok(server)
    }

    /// The primary listen URI.
    pub fn uri(&self) -> Option<ListenUri> {
        self.listeners.get("default").map(|entry| entry.uri.clone())
    }

    async fn bind_listener(&self, guid: &str, uri_str: &str) -> bool {
        let uri: ListenUri = match uri_str.parse() {
            Ok(uri) => uri,
            Err(err) => {
                error!(%err, uri = uri_str, "refusing to bind malformed URI");
                return false;
            }
        };
        // Rebinding a live GUID replaces its listener.
        self.release_listener(guid);

        let engine = self.engine.clone();
        let next_origin = self.next_origin.clone();
        let entry = match &uri {
            ListenUri::Unix(sock_path) => {
                let _ = std::fs::remove_file(sock_path);
                let listener = match UnixListener::bind(sock_path) {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(%err, path = %sock_path.display(), "unix bind failed");
                        return false;
                    }
                };
                let task = tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                let origin =
                                    Origin(next_origin.fetch_add(1, Ordering::Relaxed));
                                tokio::spawn(service::serve_connection(
                                    engine.clone(),
                                    stream,
                                    origin,
                                ));
                            }
                            Err(err) => {
                                warn!(%err, "unix accept failed");
                                return;
                            }
                        }
                    }
                });
                ListenerEntry {
                    uri: uri.clone(),
                    task,
                    sock_path: Some(sock_path.clone()),
                }
            }
            ListenUri::Tcp(addr) => {
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(%err, %addr, "tcp bind failed");
                        return false;
                    }
                };
                let task = tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                let origin =
                                    Origin(next_origin.fetch_add(1, Ordering::Relaxed));
                                tokio::spawn(service::serve_connection(
                                    engine.clone(),
                                    stream,
                                    origin,
                                ));
                            }
                            Err(err) => {
                                warn!(%err, "tcp accept failed");
                                return;
                            }
                        }
                    }
                });
                ListenerEntry {
                    uri: uri.clone(),
                    task,
                    sock_path: None,
                }
            }
        };
        info!(guid, %uri, "listener bound");
        self.listeners.insert(guid.to_string(), entry);
        true
    }

    fn release_listener(&self, guid: &str) -> bool {
        let Some((_, entry)) = self.listeners.remove(guid) else {
            return false;
        };
        entry.task.abort();
        if let Some(sock_path) = entry.sock_path {
            let _ = std::fs::remove_file(sock_path);
        }
        info!(guid, uri = %entry.uri, "listener released");
        true
    }

    /// Stop every listener. In-flight connections finish on their own
    /// tasks; callback draining belongs to [`Engine::shutdown`].
    pub async fn shutdown(&self) {
        let guids: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        for guid in guids {
            self.release_listener(&guid);
        }
    }
}

#[async_trait]
impl SocketHook for Server {
    async fn bind(&self, guid: &str, uri: &str) -> bool {
        self.bind_listener(guid, uri).await
    }

    async fn release(&self, guid: &str) -> bool {
        self.release_listener(guid)
    }
}
