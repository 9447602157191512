use std::path::PathBuf;

use super::uri::ListenUri;
use super::uri::UriError;

#[test]
fn parses_unix() {
    let uri: ListenUri = "unix:///tmp/apteryx".parse().unwrap();
    assert_eq!(uri, ListenUri::Unix(PathBuf::from("/tmp/apteryx")));
    assert_eq!(uri.to_string(), "unix:///tmp/apteryx");
}

#[test]
fn parses_tcp4_and_tcp6() {
    let uri: ListenUri = "tcp://127.0.0.1:9999".parse().unwrap();
    assert_eq!(uri.to_string(), "tcp://127.0.0.1:9999");

    let uri: ListenUri = "tcp://[::1]:9999".parse().unwrap();
    assert_eq!(uri.to_string(), "tcp://[::1]:9999");
}

#[test]
fn rejects_relative_unix_paths() {
    assert!("unix://tmp/apteryx".parse::<ListenUri>().is_err());
    assert!("unix://".parse::<ListenUri>().is_err());
}

#[test]
fn rejects_unknown_schemes() {
    assert_eq!(
        "udp://1.2.3.4:1".parse::<ListenUri>(),
        Err(UriError::Scheme("udp".into()))
    );
    assert!("nonsense".parse::<ListenUri>().is_err());
}
