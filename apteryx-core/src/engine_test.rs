use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;

use apteryx_proto::Status;

use super::config::EngineConfig;
use super::engine::Engine;
use super::engine::Origin;
use super::errors::Error;
use super::errors::StoreError;
use super::tree::PathTree;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn engine() -> Arc<Engine> {
    Engine::start(EngineConfig::default())
}

#[tokio::test]
async fn set_get_unset() {
    let engine = engine();
    engine.set(Origin::LOCAL, "/test/a/b", Some(b("1"))).await.unwrap();
    assert_eq!(engine.get(Origin::LOCAL, "/test/a/b").await.unwrap(), Some(b("1")));

    // The empty value unsets.
    engine.set(Origin::LOCAL, "/test/a/b", Some(Bytes::new())).await.unwrap();
    assert_eq!(engine.get(Origin::LOCAL, "/test/a/b").await.unwrap(), None);
}

#[tokio::test]
async fn get_missing_is_none_not_error() {
    let engine = engine();
    assert_eq!(engine.get(Origin::LOCAL, "/test/nothing").await.unwrap(), None);
}

#[tokio::test]
async fn invalid_paths_are_rejected() {
    let engine = engine();
    assert!(engine.set(Origin::LOCAL, "no-slash", Some(b("x"))).await.is_err());
    assert!(engine.get(Origin::LOCAL, "/trailing/").await.is_err());
    assert!(engine.search(Origin::LOCAL, "/no/trailing").await.is_err());
}

#[tokio::test]
async fn cas_guards_on_timestamp() {
    let engine = engine();
    engine.set(Origin::LOCAL, "/test/ifindex", Some(b("1"))).await.unwrap();
    let ts = engine.timestamp(Origin::LOCAL, "/test/ifindex").await.unwrap();
    assert_ne!(ts, 0);

    // Zero expects "not present" and must lose against an existing path.
    let err = engine
        .cas(Origin::LOCAL, "/test/ifindex", Some(b("2")), 0)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::Busy);

    engine
        .cas(Origin::LOCAL, "/test/ifindex", Some(b("3")), ts)
        .await
        .unwrap();
    assert_eq!(engine.get(Origin::LOCAL, "/test/ifindex").await.unwrap(), Some(b("3")));
}

#[tokio::test]
async fn cas_zero_succeeds_on_absent_path() {
    let engine = engine();
    engine
        .cas(Origin::LOCAL, "/test/fresh", Some(b("1")), 0)
        .await
        .unwrap();
    assert_eq!(engine.get(Origin::LOCAL, "/test/fresh").await.unwrap(), Some(b("1")));
}

#[tokio::test]
async fn watcher_fires_once_per_matching_set() {
    let engine = engine();
    let events: Arc<Mutex<Vec<(String, Option<Bytes>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .watch(
            "/test/zones/*",
            Arc::new(move |path, value| {
                let sink = sink.clone();
                async move {
                    sink.lock().push((path, value));
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    engine
        .set_wait(Origin::LOCAL, "/test/zones/private", Some(b("up")))
        .await
        .unwrap();
    engine.set_wait(Origin::LOCAL, "/test/zones/private", None).await.unwrap();

    let events = events.lock();
    assert_eq!(
        *events,
        vec![
            ("/test/zones/private".to_string(), Some(b("up"))),
            ("/test/zones/private".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn watcher_does_not_fire_on_miss() {
    let engine = engine();
    let count = Arc::new(AtomicU32::new(0));
    let sink = count.clone();
    engine
        .watch(
            "/test/zones/private/*",
            Arc::new(move |_, _| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    engine
        .set_wait(Origin::LOCAL, "/test/zones/public/state", Some(b("up")))
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unregistered_watcher_stops_firing() {
    let engine = engine();
    let count = Arc::new(AtomicU32::new(0));
    let sink = count.clone();
    let guid = engine
        .watch(
            "/test/a",
            Arc::new(move |_, _| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    engine.set_wait(Origin::LOCAL, "/test/a", Some(b("1"))).await.unwrap();
    engine.unregister(&guid).await.unwrap();
    engine.set_wait(Origin::LOCAL, "/test/a", Some(b("2"))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn validator_vetoes_and_no_watcher_fires() {
    let engine = engine();
    let fired = Arc::new(AtomicU32::new(0));
    let sink = fired.clone();
    engine
        .watch(
            "/test/guarded/*",
            Arc::new(move |_, _| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        )
        .await
        .unwrap();
    engine
        .validate(
            "/test/guarded/*",
            Arc::new(|_, value| {
                async move {
                    match value.as_deref() {
                        Some(b"down") => Status::Refused.as_i32(),
                        _ => 0,
                    }
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    engine
        .set_wait(Origin::LOCAL, "/test/guarded/door", Some(b("up")))
        .await
        .unwrap();

    let err = engine
        .set_wait(Origin::LOCAL, "/test/guarded/door", Some(b("down")))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::Refused);
    // Tree unchanged, exactly one watch event (the accepted one).
    assert_eq!(engine.get(Origin::LOCAL, "/test/guarded/door").await.unwrap(), Some(b("up")));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn set_tree_validates_all_before_any_leaf_lands() {
    let engine = engine();
    let validated = Arc::new(AtomicU32::new(0));
    let sink = validated.clone();
    engine
        .validate(
            "/test/zones/private/*",
            Arc::new(move |path, _| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                    if path.ends_with("/leaf6") {
                        Status::Refused.as_i32()
                    } else {
                        0
                    }
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    let mut tree = PathTree::new("/test/zones/private");
    for i in 0..10 {
        tree = tree.with_leaf(&format!("leaf{i}"), "v");
    }
    let err = engine
        .set_tree(Origin::LOCAL, &tree, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Refused(_))));
    assert_eq!(validated.load(Ordering::SeqCst), 10);
    // Nothing landed.
    assert!(engine.search(Origin::LOCAL, "/test/zones/private/").await.unwrap().is_empty());
}

#[tokio::test]
async fn set_tree_applies_atomically_and_watchers_see_each_leaf() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine
        .watch(
            "/test/routing/*",
            Arc::new(move |path, _| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(path);
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    let tree = PathTree::new("/test/routing/rib/1")
        .with_leaf("proto", "static")
        .with_leaf("ifname", "eth0");
    engine.set_tree(Origin::LOCAL, &tree, None, true).await.unwrap();

    assert_eq!(
        engine.get(Origin::LOCAL, "/test/routing/rib/1/proto").await.unwrap(),
        Some(b("static"))
    );
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test]
async fn refresher_runs_once_per_ttl_window() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let writer = engine.clone();
    engine
        .refresh(
            "/test/if/*",
            Arc::new(move |path| {
                let counter = counter.clone();
                let writer = writer.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let _ = writer
                        .set(Origin::ENGINE, &path, Some(Bytes::from(n.to_string())))
                        .await;
                    5_000 // 5 ms
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    assert_eq!(engine.get(Origin::LOCAL, "/test/if/eth0").await.unwrap(), Some(b("0")));
    assert_eq!(engine.get(Origin::LOCAL, "/test/if/eth0").await.unwrap(), Some(b("0")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(6)).await;
    assert_eq!(engine.get(Origin::LOCAL, "/test/if/eth0").await.unwrap(), Some(b("1")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn provider_answers_when_db_has_nothing() {
    let engine = engine();
    engine
        .provide(
            "/test/dog/sound",
            Arc::new(|_| async { Some(Bytes::from_static(b"woof")) }.boxed()),
        )
        .await
        .unwrap();

    assert_eq!(engine.get(Origin::LOCAL, "/test/dog/sound").await.unwrap(), Some(b("woof")));
}

#[tokio::test]
async fn stored_value_shadows_provider() {
    let engine = engine();
    engine
        .provide(
            "/test/dog/sound",
            Arc::new(|_| async { Some(Bytes::from_static(b"woof")) }.boxed()),
        )
        .await
        .unwrap();
    engine.set(Origin::LOCAL, "/test/dog/sound", Some(b("meow"))).await.unwrap();
    assert_eq!(engine.get(Origin::LOCAL, "/test/dog/sound").await.unwrap(), Some(b("meow")));
}

#[tokio::test]
async fn search_merges_db_and_indexer() {
    let engine = engine();
    engine
        .index(
            "/test/counters/",
            Arc::new(|_| {
                async {
                    vec![
                        "/test/counters/rx".to_string(),
                        "/test/counters/tx".to_string(),
                    ]
                }
                .boxed()
            }),
        )
        .await
        .unwrap();
    engine.set(Origin::LOCAL, "/test/counters/up", Some(b("1"))).await.unwrap();

    let found = engine.search(Origin::LOCAL, "/test/counters/").await.unwrap();
    assert_eq!(
        found,
        vec![
            "/test/counters/rx".to_string(),
            "/test/counters/tx".to_string(),
            "/test/counters/up".to_string(),
        ]
    );
}

#[tokio::test]
async fn search_of_the_root_prefix() {
    let engine = engine();
    engine.set(Origin::LOCAL, "/test/a", Some(b("1"))).await.unwrap();
    let found = engine.search(Origin::LOCAL, "/").await.unwrap();
    assert!(found.contains(&"/test".to_string()));
}

#[tokio::test]
async fn search_ignores_providers() {
    let engine = engine();
    engine
        .provide(
            "/test/counters/hidden",
            Arc::new(|_| async { Some(Bytes::from_static(b"1")) }.boxed()),
        )
        .await
        .unwrap();
    assert!(engine.search(Origin::LOCAL, "/test/counters/").await.unwrap().is_empty());
}

#[tokio::test]
async fn traverse_composes_concrete_providers() {
    let engine = engine();
    engine
        .provide(
            "/test/interfaces/eth0/state",
            Arc::new(|_| async { Some(Bytes::from_static(b"up")) }.boxed()),
        )
        .await
        .unwrap();

    let tree = engine.traverse(Origin::LOCAL, "/test/interfaces").await.unwrap();
    assert_eq!(tree.get("/test/interfaces/eth0/state").map(|v| &v[..]), Some(&b"up"[..]));
}

#[tokio::test]
async fn traverse_composes_indexer_plus_provider() {
    let engine = engine();
    engine
        .index(
            "/test/ends/with/slash/*",
            Arc::new(|path| {
                async move {
                    if path == "/test/ends/with/slash/" {
                        vec!["/test/ends/with/slash/yes".to_string()]
                    } else {
                        Vec::new()
                    }
                }
                .boxed()
            }),
        )
        .await
        .unwrap();
    engine
        .provide(
            "/test/ends/with/slash/*",
            Arc::new(|path| {
                async move {
                    (path == "/test/ends/with/slash/yes").then(|| Bytes::from_static(b"yes"))
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    let tree = engine.traverse(Origin::LOCAL, "/test/ends/with/slash").await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.get("/test/ends/with/slash/yes").map(|v| &v[..]), Some(&b"yes"[..]));
}

#[tokio::test]
async fn prune_fires_deletion_watchers() {
    let engine = engine();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .watch(
            "/test/entity/*",
            Arc::new(move |path, value| {
                let sink = sink.clone();
                async move {
                    sink.lock().push((path, value));
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    engine
        .set(Origin::LOCAL, "/test/entity/zones/private/state", Some(b("up")))
        .await
        .unwrap();
    engine.prune(Origin::LOCAL, "/test/entity").await.unwrap();
    // Drain the async watcher queue.
    engine.set_wait(Origin::LOCAL, "/test/entity/marker", Some(b("x"))).await.unwrap();

    let events = events.lock();
    assert!(events.contains(&("/test/entity/zones/private/state".to_string(), None)));
}

#[tokio::test]
async fn find_returns_bound_roots() {
    let engine = engine();
    for (rib, ifname) in [("1", "eth0"), ("2", "eth1")] {
        let tree = PathTree::new(format!("/test/routing/ipv4/rib/{rib}"))
            .with_leaf("proto", "static")
            .with_leaf("ifname", ifname);
        engine.set_tree(Origin::LOCAL, &tree, None, false).await.unwrap();
    }

    let found = engine
        .find(
            Origin::LOCAL,
            "/test/routing/ipv4/rib/*",
            &[("ifname".to_string(), b("eth0"))],
        )
        .await
        .unwrap();
    assert_eq!(found, vec!["/test/routing/ipv4/rib/1".to_string()]);
}

#[tokio::test]
async fn find_multi_leaf_is_an_and_filter() {
    let engine = engine();
    for (rib, proto, ifname) in [("1", "static", "eth0"), ("2", "ospf", "eth0")] {
        let tree = PathTree::new(format!("/test/routing/rib/{rib}"))
            .with_leaf("proto", proto)
            .with_leaf("ifname", ifname);
        engine.set_tree(Origin::LOCAL, &tree, None, false).await.unwrap();
    }
    let found = engine
        .find(
            Origin::LOCAL,
            "/test/routing/rib/*",
            &[
                ("ifname".to_string(), b("eth0")),
                ("proto".to_string(), b("static")),
            ],
        )
        .await
        .unwrap();
    assert_eq!(found, vec!["/test/routing/rib/1".to_string()]);
}

#[tokio::test]
async fn query_expands_stars() {
    let engine = engine();
    for (rib, ifname) in [("1", "eth0"), ("2", "eth1")] {
        let tree = PathTree::new(format!("/test/routing/rib/{rib}"))
            .with_leaf("proto", "static")
            .with_leaf("ifname", ifname);
        engine.set_tree(Origin::LOCAL, &tree, None, false).await.unwrap();
    }

    let mut template = PathTree::new("/");
    template.insert("/test/routing/rib/*/ifname", Bytes::new());
    let result = engine.query(Origin::LOCAL, &template).await.unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.get("/test/routing/rib/1/ifname").map(|v| &v[..]), Some(&b"eth0"[..]));
    assert_eq!(result.get("/test/routing/rib/2/ifname").map(|v| &v[..]), Some(&b"eth1"[..]));
}

#[tokio::test]
async fn timestamps_move_with_mutations() {
    let engine = engine();
    engine.set(Origin::LOCAL, "/test/stamp/value", Some(b("10"))).await.unwrap();
    let t1 = engine.timestamp(Origin::LOCAL, "/test/stamp").await.unwrap();
    engine.set(Origin::LOCAL, "/test/stamp/value2", Some(b("11"))).await.unwrap();
    let t2 = engine.timestamp(Origin::LOCAL, "/test/stamp").await.unwrap();
    assert!(t2 > t1);
    engine.prune(Origin::LOCAL, "/test/stamp/value").await.unwrap();
    let t3 = engine.timestamp(Origin::LOCAL, "/test/stamp").await.unwrap();
    assert!(t3 > t2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cas_loses_no_update() {
    let engine = engine();
    engine
        .set(Origin::LOCAL, "/test/bitmap", Some(b(&format!("{:08x}", 0xFFFF0000u32))))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for bit in 0..16u32 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let ts = engine.timestamp(Origin::LOCAL, "/test/bitmap").await.unwrap();
                let raw = engine.get(Origin::LOCAL, "/test/bitmap").await.unwrap().unwrap();
                let current =
                    u32::from_str_radix(std::str::from_utf8(&raw).unwrap(), 16).unwrap();
                let next = (current | (1 << bit)) & !(1 << (bit + 16));
                let value = Bytes::from(format!("{next:08x}"));
                match engine.cas(Origin::LOCAL, "/test/bitmap", Some(value), ts).await {
                    Ok(()) => break,
                    Err(err) if err.status() == Status::Busy => continue,
                    Err(err) => panic!("unexpected cas error: {err}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let raw = engine.get(Origin::LOCAL, "/test/bitmap").await.unwrap().unwrap();
    assert_eq!(std::str::from_utf8(&raw).unwrap(), "0000ffff");
}

#[tokio::test]
async fn reentrant_set_wait_reports_timeout_without_deadlock() {
    let engine = engine();
    let inner = engine.clone();
    let status = Arc::new(Mutex::new(None));
    let sink = status.clone();
    engine
        .watch(
            "/test/recurse",
            Arc::new(move |_, value| {
                let inner = inner.clone();
                let sink = sink.clone();
                async move {
                    // Only recurse on the first event.
                    if value.as_deref() == Some(b"first") {
                        let res = inner
                            .set_wait(Origin::LOCAL, "/test/recurse", Some(Bytes::from_static(b"second")))
                            .await;
                        *sink.lock() = Some(res.map_err(|e| e.status()));
                    }
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

    // Must complete rather than deadlock.
    tokio::time::timeout(
        Duration::from_secs(5),
        engine.set_wait(Origin::LOCAL, "/test/recurse", Some(b("first"))),
    )
    .await
    .expect("set_wait deadlocked")
    .unwrap();
    engine.shutdown().await;

    let status = status.lock().clone();
    assert_eq!(status, Some(Err(Status::Timeout)));
}

#[tokio::test]
async fn registrations_are_visible_in_the_store() {
    let engine = engine();
    let guid = engine
        .watch("/test/visible/*", Arc::new(|_, _| async {}.boxed()))
        .await
        .unwrap();

    let listed = engine.search(Origin::LOCAL, "/apteryx/watchers/").await.unwrap();
    assert!(listed.contains(&format!("/apteryx/watchers/{guid}")));
    let stored = engine
        .get(Origin::LOCAL, &format!("/apteryx/watchers/{guid}"))
        .await
        .unwrap();
    assert_eq!(stored, Some(b("/test/visible/*")));

    engine.unregister(&guid).await.unwrap();
    let listed = engine.search(Origin::LOCAL, "/apteryx/watchers/").await.unwrap();
    assert!(!listed.contains(&format!("/apteryx/watchers/{guid}")));
}
