use super::callbacks::make_guid;
use super::callbacks::parse_guid;
use super::callbacks::Kind;
use super::callbacks::Registry;

fn reg(registry: &Registry, kind: Kind, pattern: &str, handle: u64) -> String {
    let guid = make_guid(std::process::id() as u64, handle, handle * 7 + 1);
    registry.create(kind, &guid, pattern, None).expect("create");
    guid
}

#[test]
fn guid_roundtrip() {
    let guid = make_guid(0x1234, 0xdeadbeef, 0xcafe);
    assert_eq!(guid, "1234-deadbeef-cafe");
    assert_eq!(parse_guid(&guid), Some((0x1234, 0xdeadbeef, 0xcafe)));
    assert_eq!(parse_guid("not-a-guid"), None);
    assert_eq!(parse_guid("12"), None);
}

#[test]
fn exact_match() {
    let registry = Registry::new();
    reg(&registry, Kind::Watch, "/test/zones/private/active", 1);

    let hits = registry.match_path(Kind::Watch, "/test/zones/private/active");
    assert_eq!(hits.len(), 1);
    assert!(registry.match_path(Kind::Watch, "/test/zones/private").is_empty());
    assert!(registry
        .match_path(Kind::Watch, "/test/zones/private/active/deeper")
        .is_empty());
}

#[test]
fn trailing_star_matches_whole_subtree() {
    let registry = Registry::new();
    reg(&registry, Kind::Watch, "/test/entity/zones/*", 1);

    // One level below and far below both match; the anchor itself does not.
    assert_eq!(registry.match_path(Kind::Watch, "/test/entity/zones/private").len(), 1);
    assert_eq!(
        registry.match_path(Kind::Watch, "/test/entity/zones/private/state").len(),
        1
    );
    assert!(registry.match_path(Kind::Watch, "/test/entity/zones").is_empty());
    assert!(registry.match_path(Kind::Watch, "/test/entity/other").is_empty());
}

#[test]
fn trailing_slash_matches_one_level_only() {
    let registry = Registry::new();
    reg(&registry, Kind::Watch, "/test/entity/zones/private/", 1);

    assert_eq!(
        registry
            .match_path(Kind::Watch, "/test/entity/zones/private/state")
            .len(),
        1
    );
    assert!(registry
        .match_path(Kind::Watch, "/test/entity/zones/private/state/deeper")
        .is_empty());
    assert!(registry.match_path(Kind::Watch, "/test/entity/zones/private").is_empty());
}

#[test]
fn interior_star_matches_exactly_one_segment() {
    let registry = Registry::new();
    reg(&registry, Kind::Watch, "/test/entity/zones/*/state", 1);

    assert_eq!(
        registry.match_path(Kind::Watch, "/test/entity/zones/public/state").len(),
        1
    );
    assert!(registry
        .match_path(Kind::Watch, "/test/entity/zones/public/extra/state")
        .is_empty());
    assert!(registry.match_path(Kind::Watch, "/test/entity/zones/state").is_empty());
}

#[test]
fn stars_at_both_ends() {
    let registry = Registry::new();
    reg(&registry, Kind::Watch, "/test/entity/zones/*/interface/*", 1);

    assert_eq!(
        registry
            .match_path(Kind::Watch, "/test/entity/zones/private/interface/state")
            .len(),
        1
    );
    assert!(registry
        .match_path(Kind::Watch, "/test/entity/zones/private/other/state")
        .is_empty());
}

#[test]
fn most_specific_first() {
    let registry = Registry::new();
    let wild = reg(&registry, Kind::Watch, "/test/zones/*", 1);
    let exact = reg(&registry, Kind::Watch, "/test/zones/private", 2);

    let hits = registry.match_path(Kind::Watch, "/test/zones/private");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].guid, exact);
    assert_eq!(hits[1].guid, wild);
}

#[test]
fn newer_registration_wins_ties() {
    let registry = Registry::new();
    let first = reg(&registry, Kind::Index, "/test/counters/", 1);
    let second = reg(&registry, Kind::Index, "/test/counters/", 2);

    let hits = registry.match_path(Kind::Index, "/test/counters/probe");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].guid, second);
    assert_eq!(hits[1].guid, first);
}

#[test]
fn destroy_detaches_but_record_survives() {
    let registry = Registry::new();
    let guid = reg(&registry, Kind::Watch, "/test/a", 1);
    let held = registry.find(&guid).unwrap();

    registry.destroy(&guid);
    assert!(registry.match_path(Kind::Watch, "/test/a").is_empty());
    assert!(registry.find(&guid).is_none());
    // The held Arc is still usable, just disabled.
    assert!(!held.is_active());
}

#[test]
fn replace_same_guid_disables_old() {
    let registry = Registry::new();
    let guid = make_guid(42, 7, 9);
    let old = registry.create(Kind::Watch, &guid, "/test/old", None).unwrap();
    let new = registry.create(Kind::Watch, &guid, "/test/new", None).unwrap();

    assert!(!old.is_active());
    assert!(new.is_active());
    assert!(registry.match_path(Kind::Watch, "/test/old").is_empty());
    assert_eq!(registry.match_path(Kind::Watch, "/test/new").len(), 1);
}

#[test]
fn search_names_next_level_registrations() {
    let registry = Registry::new();
    reg(&registry, Kind::Provide, "/test/dog/sound", 1);
    reg(&registry, Kind::Provide, "/test/cat/sound", 2);
    reg(&registry, Kind::Provide, "/test/*/hidden", 3);

    let mut found = registry.search(Kind::Provide, "/test/");
    found.sort();
    // Wildcard branches are unnameable and skipped.
    assert_eq!(found, vec!["/test/cat".to_string(), "/test/dog".to_string()]);

    assert_eq!(
        registry.search(Kind::Provide, "/test/dog/"),
        vec!["/test/dog/sound".to_string()]
    );
}

#[test]
fn exists_sees_deep_and_covering_patterns() {
    let registry = Registry::new();
    reg(&registry, Kind::Refresh, "/test/statistics/*", 1);
    reg(&registry, Kind::Provide, "/test/counters/set", 2);

    assert!(registry.exists(Kind::Refresh, "/test/statistics"));
    assert!(registry.exists(Kind::Refresh, "/test/statistics/deep/leaf"));
    assert!(registry.exists(Kind::Refresh, "/test"));
    assert!(!registry.exists(Kind::Refresh, "/test/counters"));

    assert!(registry.exists(Kind::Provide, "/test/counters"));
    assert!(!registry.exists(Kind::Provide, "/test/statistics"));
}

#[test]
fn drop_pid_removes_only_that_owner() {
    let registry = Registry::new();
    let mine = make_guid(100, 1, 1);
    let theirs = make_guid(200, 1, 1);
    registry.create(Kind::Watch, &mine, "/test/mine", None);
    registry.create(Kind::Watch, &theirs, "/test/theirs", None);

    let dropped = registry.drop_pid(100);
    assert_eq!(dropped.len(), 1);
    assert!(registry.match_path(Kind::Watch, "/test/mine").is_empty());
    assert_eq!(registry.match_path(Kind::Watch, "/test/theirs").len(), 1);
}

#[test]
fn stats_render() {
    let registry = Registry::new();
    let guid = reg(&registry, Kind::Watch, "/test/a", 1);
    let cb = registry.find(&guid).unwrap();
    assert_eq!(cb.stats.render(), "0,0,0,0");
    cb.stats.record(10);
    cb.stats.record(30);
    assert_eq!(cb.stats.render(), "2,10,20,30");
}
