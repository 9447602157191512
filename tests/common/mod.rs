use std::sync::Arc;

use apteryx::Client;
use apteryx::Engine;
use apteryx::EngineConfig;
use apteryx::Server;

pub struct Daemon {
    #[allow(dead_code)]
    pub engine: Arc<Engine>,
    #[allow(dead_code)]
    pub server: Arc<Server>,
    pub uri: String,
    // Held for the socket directory's lifetime.
    _dir: tempfile::TempDir,
}

/// One daemon on a unix socket in its own temp directory.
pub async fn start_daemon() -> Daemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let uri = format!("unix://{}", dir.path().join("apteryx").display());
    let mut config = EngineConfig::default();
    config.engine.socket = uri.clone();
    let engine = Engine::start(config);
    let server = Server::start(engine.clone()).await.expect("server start");
    Daemon {
        engine,
        server,
        uri,
        _dir: dir,
    }
}

pub async fn connect(daemon: &Daemon) -> Client {
    Client::connect(daemon.uri.clone()).await.expect("connect")
}
