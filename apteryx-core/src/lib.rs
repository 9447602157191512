//! # apteryx-core
//!
//! The apteryx engine: a shared, hierarchical, path-addressed datastore
//! with derived behaviors attached through callbacks.
//!
//! This crate is transport-agnostic. It owns:
//!
//! - the in-memory path tree with per-node timestamps and CAS ([`db`])
//! - the callback registry with longest-prefix matching over wildcarded
//!   patterns ([`callbacks`])
//! - the refresh ledger that rate-limits refresher invocations ([`refresh`])
//! - the operation engine composing the above ([`engine`])
//! - the watcher dispatcher with per-originator ordering ([`dispatch`])
//! - the `/apteryx/*` self-configuration surface ([`surface`])
//!
//! Embedding the engine in-process:
//!
//! ```rust,ignore
//! use apteryx_core::{Engine, EngineConfig, Origin};
//!
//! let engine = Engine::start(EngineConfig::load()?);
//! engine.set(Origin::LOCAL, "/test/a/b", Some("1".into())).await?;
//! assert_eq!(engine.get(Origin::LOCAL, "/test/a/b").await?.as_deref(), Some(&b"1"[..]));
//! ```
//!
//! Networked use goes through `apteryx-server` and `apteryx-client`, which
//! carry the same operations over the wire protocol in `apteryx-proto`.

pub mod callbacks;
pub mod config;
pub mod counters;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod handles;
pub mod path;
pub mod refresh;
pub mod surface;
pub mod tree;

mod errors;

#[cfg(test)]
mod callbacks_test;
#[cfg(test)]
mod config_test;
#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod path_test;
#[cfg(test)]
mod refresh_test;

pub use callbacks::make_guid;
pub use callbacks::parse_guid;
pub use callbacks::Callback;
pub use callbacks::Kind;
pub use callbacks::Registry;
pub use config::EngineConfig;
pub use engine::CallbackChannel;
pub use engine::Engine;
pub use engine::Origin;
pub use engine::ProxyForwarder;
pub use engine::SocketHook;
pub use errors::DispatchError;
pub use errors::Error;
pub use errors::Result;
pub use errors::RpcError;
pub use errors::StoreError;
pub use handles::IndexFn;
pub use handles::ProvideFn;
pub use handles::RefreshFn;
pub use handles::ValidateFn;
pub use handles::WatchFn;
pub use handles::WatchTreeFn;
pub use tree::PathTree;
