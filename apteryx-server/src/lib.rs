//! # apteryx-server
//!
//! The RPC side of an apteryx daemon: listener management, the
//! per-connection request service, the callback channel that reaches back
//! into registered clients, and proxy forwarding between instances.
//!
//! ```rust,ignore
//! use apteryx_core::{Engine, EngineConfig};
//! use apteryx_server::Server;
//!
//! let engine = Engine::start(EngineConfig::load()?);
//! let server = Server::start(engine.clone()).await?;
//! // ... run until shutdown ...
//! server.shutdown().await;
//! engine.shutdown().await;
//! ```
//!
//! Additional listeners come and go at runtime through writes to
//! `/apteryx/sockets/<guid>`; the server installs itself as the engine's
//! socket hook to react to them.

mod channel;
mod listener;
mod service;


pub use channel::ProxyClient;
pub use channel::RemoteChannel;
pub use listener::Server;
