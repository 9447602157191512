//! The client-side callback service.
//!
//! Once a process registers any callback, the daemon needs a way back in:
//! the client binds a UNIX listener next to the daemon's own socket, named
//! `<daemon-socket>.<pid>`, and answers WATCH / VALIDATE / PROVIDE / INDEX /
//! REFRESH requests by running the registered closure for the handle the
//! request names.

use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::warn;

use apteryx_core::handles::HandleTable;
use apteryx_core::handles::LocalCallback;
use apteryx_core::PathTree;
use apteryx_proto::read_frame;
use apteryx_proto::write_frame;
use apteryx_proto::Reply;
use apteryx_proto::Request;
use apteryx_proto::Status;

/// Accept loop; runs until the listener is dropped or the task aborted.
pub(crate) async fn serve(listener: UnixListener, callbacks: Arc<HandleTable>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let callbacks = callbacks.clone();
                tokio::spawn(serve_connection(stream, callbacks));
            }
            Err(err) => {
                warn!(%err, "callback listener accept failed");
                return;
            }
        }
    }
}

pub(crate) async fn serve_connection(mut stream: UnixStream, callbacks: Arc<HandleTable>) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                debug!(%err, "callback connection read failed");
                return;
            }
        };
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed callback request, closing");
                return;
            }
        };
        let reply = answer(&callbacks, request).await;
        if write_frame(&mut stream, &reply.encode()).await.is_err() {
            return;
        }
    }
}

async fn answer(callbacks: &HandleTable, request: Request) -> Reply {
    match request {
        Request::Watch { handle, path, value } => match callbacks.get(handle) {
            Some(LocalCallback::Watch(f)) => {
                f(path, value).await;
                Reply::Status(Status::Ok.as_i32())
            }
            Some(LocalCallback::WatchTree(f)) => {
                // The engine relays tree events leaf by leaf; rebuild a
                // one-leaf document, an empty value marking deletion.
                let mut tree = PathTree::new(path.clone());
                tree.insert(path, value.unwrap_or_default());
                f(tree).await;
                Reply::Status(Status::Ok.as_i32())
            }
            _ => Reply::Status(Status::Invalid.as_i32()),
        },
        Request::Validate { handle, path, value } => match callbacks.get(handle) {
            Some(LocalCallback::Validate(f)) => Reply::Status(f(path, value).await),
            _ => Reply::Status(Status::Ok.as_i32()), // can't veto without a handler
        },
        Request::Provide { handle, path } => match callbacks.get(handle) {
            Some(LocalCallback::Provide(f)) => Reply::Value(f(path).await),
            _ => Reply::Value(None),
        },
        Request::Index { handle, path } => match callbacks.get(handle) {
            Some(LocalCallback::Index(f)) => Reply::Paths(f(path).await),
            _ => Reply::Paths(Vec::new()),
        },
        Request::Refresh { handle, path } => match callbacks.get(handle) {
            Some(LocalCallback::Refresh(f)) => Reply::Uint64(f(path).await),
            _ => Reply::Uint64(0),
        },
        other => {
            warn!(op = ?other.opcode(), "unexpected opcode on callback socket");
            Reply::Status(Status::Invalid.as_i32())
        }
    }
}
