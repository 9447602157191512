use super::config::EngineConfig;
use super::config::DEFAULT_SOCKET;

#[test]
fn defaults() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.engine.socket, DEFAULT_SOCKET);
    assert_eq!(cfg.dispatch.workers, 8);
    assert_eq!(cfg.dispatch.callback_timeout_ms, 1_000);
    assert_eq!(cfg.rpc.request_timeout_ms, 1_000);
    assert!(!cfg.engine.debug);
}

#[test]
fn durations() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.rpc_timeout().as_millis(), 1_000);
    assert_eq!(cfg.callback_timeout().as_millis(), 1_000);
    assert_eq!(cfg.shutdown_drain().as_millis(), 5_000);
}

#[test]
fn load_without_file_or_env_matches_defaults() {
    // CONFIG_PATH is not set in the test environment.
    let cfg = EngineConfig::load().expect("load");
    assert_eq!(cfg.engine.socket, DEFAULT_SOCKET);
    assert_eq!(cfg.dispatch.workers, 8);
}
