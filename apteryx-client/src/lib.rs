//! # apteryx-client
//!
//! Client access to an apteryx daemon over the wire protocol: pooled
//! connections, the typed operation API, and the callback service that lets
//! the daemon invoke watchers / validators / providers / indexers /
//! refreshers registered by this process.
//!
//! ```rust,ignore
//! use apteryx_client::Client;
//!
//! let client = Client::connect("unix:///tmp/apteryx").await?;
//! client.set("/interfaces/eth0/state", "up").await?;
//! let state = client.get("/interfaces/eth0/state").await?;
//! ```

mod callback;
mod client;
pub mod pool;


pub use client::Client;
pub use client::ClientBuilder;

pub use apteryx_core::IndexFn;
pub use apteryx_core::ProvideFn;
pub use apteryx_core::RefreshFn;
pub use apteryx_core::ValidateFn;
pub use apteryx_core::WatchFn;
pub use apteryx_core::WatchTreeFn;
