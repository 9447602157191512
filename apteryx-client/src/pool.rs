//! Pooled RPC connections.
//!
//! One pool per remote URI. Connections are checked out for a single
//! request/reply exchange and returned on success; a connection that times
//! out or errors is closed and dropped from the pool. A request that fails
//! on a reused connection is retried once on a fresh one, so a remote
//! restart does not surface as a spurious error.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::trace;

use apteryx_core::RpcError;
use apteryx_proto::read_frame;
use apteryx_proto::write_frame;
use apteryx_proto::ListenUri;
use apteryx_proto::Reply;
use apteryx_proto::Request;

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn split_mut(&mut self) -> (impl AsyncRead + Unpin + '_, impl AsyncWrite + Unpin + '_) {
        match self {
            Stream::Unix(s) => {
                let (r, w) = s.split();
                (EitherRead::Unix(r), EitherWrite::Unix(w))
            }
            Stream::Tcp(s) => {
                let (r, w) = s.split();
                (EitherRead::Tcp(r), EitherWrite::Tcp(w))
            }
        }
    }
}

enum EitherRead<'a> {
    Unix(tokio::net::unix::ReadHalf<'a>),
    Tcp(tokio::net::tcp::ReadHalf<'a>),
}

enum EitherWrite<'a> {
    Unix(tokio::net::unix::WriteHalf<'a>),
    Tcp(tokio::net::tcp::WriteHalf<'a>),
}

impl AsyncRead for EitherRead<'_> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            EitherRead::Unix(r) => std::pin::Pin::new(r).poll_read(cx, buf),
            EitherRead::Tcp(r) => std::pin::Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EitherWrite<'_> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            EitherWrite::Unix(w) => std::pin::Pin::new(w).poll_write(cx, buf),
            EitherWrite::Tcp(w) => std::pin::Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            EitherWrite::Unix(w) => std::pin::Pin::new(w).poll_flush(cx),
            EitherWrite::Tcp(w) => std::pin::Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            EitherWrite::Unix(w) => std::pin::Pin::new(w).poll_shutdown(cx),
            EitherWrite::Tcp(w) => std::pin::Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// One live connection.
pub struct Connection {
    stream: Stream,
}

impl Connection {
    pub async fn connect(uri: &ListenUri) -> Result<Self, RpcError> {
        let stream = match uri {
            ListenUri::Unix(path) => Stream::Unix(UnixStream::connect(path).await?),
            ListenUri::Tcp(addr) => Stream::Tcp(TcpStream::connect(addr).await?),
        };
        Ok(Connection { stream })
    }

    /// One request/reply exchange, bounded by `timeout`.
    pub async fn request(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Reply, RpcError> {
        let op = request.opcode();
        let body = request.encode();
        let (mut reader, mut writer) = self.stream.split_mut();
        let exchange = async {
            write_frame(&mut writer, &body).await?;
            match read_frame(&mut reader).await? {
                Some(frame) => Ok(Reply::decode_for(op, frame)?),
                None => Err(RpcError::Closed),
            }
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }
}

/// Connection pool for one remote.
pub struct Pool {
    uri: ListenUri,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    timeout: Duration,
}

impl Pool {
    pub fn new(uri: ListenUri, max_idle: usize, timeout: Duration) -> Self {
        Pool {
            uri,
            idle: Mutex::new(Vec::new()),
            max_idle,
            timeout,
        }
    }

    pub fn uri(&self) -> &ListenUri {
        &self.uri
    }

    async fn checkout(&self) -> Result<(Connection, bool), RpcError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok((conn, true));
        }
        trace!(uri = %self.uri, "dialing");
        Ok((Connection::connect(&self.uri).await?, false))
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// Issue a request, retrying once when a pooled connection turns out to
    /// be stale. Timeouts are never retried.
    pub async fn request(&self, request: &Request) -> Result<Reply, RpcError> {
        let (mut conn, reused) = self.checkout().await?;
        match conn.request(request, self.timeout).await {
            Ok(reply) => {
                self.checkin(conn);
                Ok(reply)
            }
            Err(RpcError::Timeout) => {
                debug!(uri = %self.uri, "request timed out, dropping connection");
                Err(RpcError::Timeout)
            }
            Err(err) if reused => {
                debug!(uri = %self.uri, %err, "pooled connection stale, retrying");
                let mut fresh = Connection::connect(&self.uri).await?;
                let reply = fresh.request(request, self.timeout).await?;
                self.checkin(fresh);
                Ok(reply)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop every idle connection.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}
