//! The `/apteryx/*` self-configuration surface.
//!
//! The registry is exposed as ordinary store paths: clients register and
//! deregister callbacks by writing a pattern under the matching prefix,
//! keyed by the registration GUID. The handlers here are themselves normal
//! watcher / provider / indexer / refresher registrations owned by the
//! engine process, so configuration changes flow through the same set,
//! dispatch and statistics machinery as any other write.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::debug;
use tracing::error;

use crate::callbacks::make_guid;
use crate::callbacks::Kind;
use crate::engine::Engine;
use crate::engine::Origin;
use crate::handles::LocalCallback;
use crate::path;

pub const ROOT: &str = "/apteryx";
pub const DEBUG_PATH: &str = "/apteryx/debug";
pub const SOCKETS_PATH: &str = "/apteryx/sockets";
pub const WATCHERS_PATH: &str = "/apteryx/watchers";
pub const TREE_WATCHERS_PATH: &str = "/apteryx/tree-watchers";
pub const VALIDATORS_PATH: &str = "/apteryx/validators";
pub const REFRESHERS_PATH: &str = "/apteryx/refreshers";
pub const PROVIDERS_PATH: &str = "/apteryx/providers";
pub const INDEXERS_PATH: &str = "/apteryx/indexers";
pub const PROXIES_PATH: &str = "/apteryx/proxies";
pub const COUNTERS_PATH: &str = "/apteryx/counters";
pub const STATISTICS_PATH: &str = "/apteryx/statistics";

/// Registry prefix for a callback kind.
pub fn prefix_for(kind: Kind) -> &'static str {
    match kind {
        Kind::Watch => WATCHERS_PATH,
        Kind::WatchTree => TREE_WATCHERS_PATH,
        Kind::Validate => VALIDATORS_PATH,
        Kind::Refresh => REFRESHERS_PATH,
        Kind::Provide => PROVIDERS_PATH,
        Kind::Index => INDEXERS_PATH,
        Kind::Proxy => PROXIES_PATH,
    }
}

const REGISTRY_KINDS: [Kind; 6] = [
    Kind::Watch,
    Kind::WatchTree,
    Kind::Validate,
    Kind::Refresh,
    Kind::Provide,
    Kind::Index,
];

/// Install the built-in registrations. Called once from [`Engine::start`].
pub(crate) fn install(engine: &Arc<Engine>) {
    let weak = Arc::downgrade(engine);

    // Log level toggle.
    {
        let weak = weak.clone();
        direct_watch(engine, DEBUG_PATH, move |_, value| {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    let level = value
                        .as_deref()
                        .and_then(|v| std::str::from_utf8(v).ok())
                        .and_then(|s| s.parse::<i32>().ok())
                        .unwrap_or(0);
                    engine.set_debug(level != 0);
                    debug!(level, "debug level changed");
                }
            }
            .boxed()
        });
    }

    // Listener management.
    {
        let weak = weak.clone();
        direct_watch(engine, &format!("{SOCKETS_PATH}/"), move |path, value| {
            let weak = weak.clone();
            async move {
                let Some(engine) = weak.upgrade() else { return };
                let guid = path::leaf(&path).to_string();
                let hook = engine.socket_hook.read().clone();
                let Some(hook) = hook else {
                    error!(guid, "socket write with no listener hook installed");
                    return;
                };
                match value.as_deref().and_then(|v| std::str::from_utf8(v).ok()) {
                    Some(uri) => {
                        hook.bind(&guid, uri).await;
                    }
                    None => {
                        hook.release(&guid).await;
                    }
                }
            }
            .boxed()
        });
    }

    // One watcher per registry prefix.
    for kind in REGISTRY_KINDS {
        let weak = weak.clone();
        direct_watch(engine, &format!("{}/", prefix_for(kind)), move |path, value| {
            let weak = weak.clone();
            async move {
                let Some(engine) = weak.upgrade() else { return };
                let guid = path::leaf(&path).to_string();
                match value.as_deref().and_then(|v| std::str::from_utf8(v).ok()) {
                    Some(pattern) => {
                        if path::validate_pattern(pattern).is_err() {
                            error!(guid, pattern, "rejecting malformed callback pattern");
                            return;
                        }
                        if engine.registry.create(kind, &guid, pattern, None).is_none() {
                            error!(guid, "rejecting malformed callback GUID");
                        }
                    }
                    None => {
                        if engine.registry.destroy(&guid).is_none() {
                            debug!(guid, "deregistration of unknown callback");
                        }
                        engine.refreshes.forget(&guid);
                    }
                }
            }
            .boxed()
        });
    }

    // Proxies carry "uri:pattern" values.
    {
        let weak = weak.clone();
        direct_watch(engine, &format!("{PROXIES_PATH}/"), move |path, value| {
            let weak = weak.clone();
            async move {
                let Some(engine) = weak.upgrade() else { return };
                let guid = path::leaf(&path).to_string();
                match value.as_deref().and_then(|v| std::str::from_utf8(v).ok()) {
                    Some(target) => {
                        if !target.starts_with("unix://") && !target.starts_with("tcp://") {
                            error!(guid, target, "rejecting proxy with unsupported URI");
                            return;
                        }
                        let Some(split) = target.rfind(':') else {
                            error!(guid, target, "rejecting malformed proxy value");
                            return;
                        };
                        let (uri, pattern) = (&target[..split], &target[split + 1..]);
                        if path::validate_pattern(pattern).is_err() {
                            error!(guid, pattern, "rejecting malformed proxy pattern");
                            return;
                        }
                        engine
                            .registry
                            .create(Kind::Proxy, &guid, pattern, Some(uri.to_string()));
                    }
                    None => {
                        engine.registry.destroy(&guid);
                    }
                }
            }
            .boxed()
        });
    }

    // Counters: an indexer to enumerate them, a provider to render them.
    {
        direct_register(
            engine,
            Kind::Index,
            &format!("{COUNTERS_PATH}/"),
            LocalCallback::Index(Arc::new(move |_path| {
                async move {
                    crate::counters::Counters::NAMES
                        .iter()
                        .map(|name| format!("{COUNTERS_PATH}/{name}"))
                        .collect()
                }
                .boxed()
            })),
        );
        let weak_counters = weak.clone();
        direct_register(
            engine,
            Kind::Provide,
            &format!("{COUNTERS_PATH}/"),
            LocalCallback::Provide(Arc::new(move |path| {
                let weak = weak_counters.clone();
                async move {
                    let engine = weak.upgrade()?;
                    let value = engine.counters().get(path::leaf(&path))?;
                    Some(Bytes::from(value.to_string()))
                }
                .boxed()
            })),
        );
    }

    // Statistics: a refresher that rewrites the per-callback stats leaves
    // through the public set path, once a second at most.
    {
        let weak_stats = weak;
        direct_register(
            engine,
            Kind::Refresh,
            &format!("{STATISTICS_PATH}/*"),
            LocalCallback::Refresh(Arc::new(move |_path| {
                let weak = weak_stats.clone();
                async move {
                    let Some(engine) = weak.upgrade() else { return 0 };
                    let _ = engine.prune(Origin::ENGINE, STATISTICS_PATH).await;
                    let mut rows: Vec<(String, String)> = Vec::new();
                    for kind in [
                        Kind::Watch,
                        Kind::WatchTree,
                        Kind::Validate,
                        Kind::Refresh,
                        Kind::Provide,
                        Kind::Index,
                        Kind::Proxy,
                    ] {
                        engine.registry.foreach(kind, |cb| {
                            rows.push((
                                format!("{STATISTICS_PATH}/{}/{}", kind.plural(), cb.guid),
                                cb.stats.render(),
                            ));
                        });
                    }
                    for (stat_path, value) in rows {
                        let _ = engine
                            .set(Origin::ENGINE, &stat_path, Some(Bytes::from(value)))
                            .await;
                    }
                    1_000_000 // 1 s
                }
                .boxed()
            })),
        );
    }
}

/// Register a built-in watcher bypassing the store (these exist before the
/// surface is usable).
fn direct_watch<F>(engine: &Arc<Engine>, pattern: &str, f: F)
where
    F: Fn(String, Option<Bytes>) -> futures::future::BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
{
    direct_register(engine, Kind::Watch, pattern, LocalCallback::Watch(Arc::new(f)));
}

fn direct_register(engine: &Arc<Engine>, kind: Kind, pattern: &str, cb: LocalCallback) {
    let handle = engine.invoker.handles.register(cb);
    let guid = make_guid(engine.pid(), handle, handle);
    engine.registry.create(kind, &guid, pattern, None);
}
