//! # apteryx
//!
//! A shared, hierarchical, path-addressed datastore for the processes of a
//! single host (and, over TCP, a small cluster). Clients set, get, search,
//! prune and atomically compare-and-swap string values at slash-separated
//! paths, and extend the store with callbacks: **watchers** notified of
//! changes, **validators** that veto them, **providers** that synthesize
//! values on read, **indexers** that enumerate dynamic children,
//! **refreshers** that repopulate stale subtrees, and **proxies** that
//! forward subtrees to other instances.
//!
//! This crate re-exports the pieces:
//!
//! - [`Engine`] / [`EngineConfig`] - the in-process engine (`apteryx-core`)
//! - [`Server`] - the RPC daemon side (`apteryx-server`)
//! - [`Client`] - typed access over a socket (`apteryx-client`)
//!
//! ## Embedded
//!
//! ```rust,ignore
//! use apteryx::{Engine, EngineConfig, Origin};
//!
//! let engine = Engine::start(EngineConfig::load()?);
//! engine.set(Origin::LOCAL, "/interfaces/eth0/state", Some("up".into())).await?;
//! ```
//!
//! ## Daemon + client
//!
//! Run `apteryxd`, then from any process:
//!
//! ```rust,ignore
//! use apteryx::Client;
//!
//! let client = Client::connect("unix:///tmp/apteryx").await?;
//! client.set("/interfaces/eth0/state", "up").await?;
//! ```

pub use apteryx_core::Engine;
pub use apteryx_core::EngineConfig;
pub use apteryx_core::Error;
pub use apteryx_core::Kind;
pub use apteryx_core::Origin;
pub use apteryx_core::PathTree;
pub use apteryx_core::Result;

pub use apteryx_client::Client;
pub use apteryx_client::ClientBuilder;

pub use apteryx_server::Server;

pub use apteryx_proto::ListenUri;
pub use apteryx_proto::Status;
