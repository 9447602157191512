//! Listener URIs.
//!
//! Listeners and proxies are addressed as `unix:///path/to/socket` or
//! `tcp://HOST:PORT`; IPv6 hosts are bracketed (`tcp://[::1]:9999`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid URI format: {0}")]
    Invalid(String),

    #[error("unsupported URI scheme: {0}")]
    Scheme(String),
}

/// A parsed listen or connect address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenUri {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for ListenUri {
    type Err = UriError;

    fn from_str(uri: &str) -> Result<Self, UriError> {
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() || !path.starts_with('/') {
                return Err(UriError::Invalid(uri.to_string()));
            }
            return Ok(ListenUri::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = uri.strip_prefix("tcp://") {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| UriError::Invalid(uri.to_string()))?;
            return Ok(ListenUri::Tcp(addr));
        }
        match uri.split_once("://") {
            Some((scheme, _)) => Err(UriError::Scheme(scheme.to_string())),
            None => Err(UriError::Invalid(uri.to_string())),
        }
    }
}

impl std::fmt::Display for ListenUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenUri::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenUri::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}
