//! Engine configuration.
//!
//! Hierarchical loading with later sources overriding earlier ones:
//! 1. defaults from code
//! 2. configuration file named by the `CONFIG_PATH` environment variable
//! 3. environment variables with the `APTERYX__` prefix and `__` separator
//!    (e.g. `APTERYX__DISPATCH__WORKERS=16`)

use std::env;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;

/// Default daemon listen URI.
pub const DEFAULT_SOCKET: &str = "unix:///tmp/apteryx";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Core engine settings
    #[serde(default)]
    pub engine: EngineSection,
    /// RPC transport settings
    #[serde(default)]
    pub rpc: RpcSection,
    /// Watcher dispatch settings
    #[serde(default)]
    pub dispatch: DispatchSection,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineSection {
    /// Primary listen URI for the daemon
    #[serde(default = "default_socket")]
    pub socket: String,
    /// Verbose debug logging, also toggled at runtime via `/apteryx/debug`
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcSection {
    /// Per-request reply budget in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Idle pooled connections kept per remote
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatchSection {
    /// Concurrent watcher invocations across all originators
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-callback wall-clock budget in milliseconds
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    /// Bound on the shutdown drain of in-flight callbacks, milliseconds
    #[serde(default = "default_drain_ms")]
    pub shutdown_drain_ms: u64,
}

fn default_socket() -> String {
    DEFAULT_SOCKET.to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    1_000
}

fn default_pool_size() -> usize {
    4
}

fn default_workers() -> usize {
    8
}

fn default_callback_timeout_ms() -> u64 {
    1_000
}

fn default_drain_ms() -> u64 {
    5_000
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            socket: default_socket(),
            debug: false,
        }
    }
}

impl Default for RpcSection {
    fn default() -> Self {
        RpcSection {
            request_timeout_ms: default_rpc_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        DispatchSection {
            workers: default_workers(),
            callback_timeout_ms: default_callback_timeout_ms(),
            shutdown_drain_ms: default_drain_ms(),
        }
    }
}

impl EngineConfig {
    /// Load from defaults, `CONFIG_PATH` and the environment.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("APTERYX")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.request_timeout_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.callback_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_drain_ms)
    }
}
