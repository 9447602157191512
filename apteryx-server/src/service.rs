//! Per-connection request service.
//!
//! Requests on one connection are answered strictly in order. A malformed
//! frame or an opcode that does not belong on a server socket closes the
//! connection. When the connection goes away, every registration created
//! through it is torn down - clients keep a dedicated connection open for
//! registry writes precisely so this cleanup fires when the process dies.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use apteryx_core::parse_guid;
use apteryx_core::path;
use apteryx_core::surface;
use apteryx_core::Engine;
use apteryx_core::Origin;
use apteryx_core::PathTree;
use apteryx_core::Result;
use apteryx_proto::read_frame;
use apteryx_proto::write_frame;
use apteryx_proto::Reply;
use apteryx_proto::Request;
use apteryx_proto::SetOp;
use apteryx_proto::TS_UNCONDITIONAL;

pub(crate) async fn serve_connection<S>(engine: Arc<Engine>, mut stream: S, origin: Origin)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut owned_pids: HashSet<u64> = HashSet::new();
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "connection read failed");
                break;
            }
        };
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "protocol violation, closing connection");
                break;
            }
        };
        trace!(origin = origin.0, op = ?request.opcode(), "request");
        let Some(reply) = dispatch(&engine, origin, request, &mut owned_pids).await else {
            warn!(origin = origin.0, "unexpected opcode, closing connection");
            break;
        };
        if let Err(err) = write_frame(&mut stream, &reply.encode()).await {
            debug!(%err, "connection write failed");
            break;
        }
    }
    // Registrations die with the connection that created them.
    for pid in owned_pids {
        debug!(pid, "dropping registrations for disconnected peer");
        engine.drop_peer(pid);
    }
}

/// Serve one request. `None` means the opcode is not valid here and the
/// connection must close.
pub(crate) async fn dispatch(
    engine: &Arc<Engine>,
    origin: Origin,
    request: Request,
    owned_pids: &mut HashSet<u64>,
) -> Option<Reply> {
    let reply = match request {
        Request::Set { ops, expected, wait } => {
            note_registrations(&ops, owned_pids);
            let pairs: Vec<(String, Option<Bytes>)> =
                ops.into_iter().map(|op| (op.path, op.value)).collect();
            let cas_root = path::common_prefix(pairs.iter().map(|(p, _)| p.as_str()));
            let expected = (expected != TS_UNCONDITIONAL).then_some(expected);
            let result = engine.set_batch(origin, cas_root, pairs, expected, wait).await;
            Reply::Status(result_status(result))
        }
        Request::Get { path } => match engine.get(origin, &path).await {
            Ok(value) => Reply::Value(value),
            Err(_) => Reply::Value(None),
        },
        Request::Search { prefix } => {
            Reply::Paths(engine.search(origin, &prefix).await.unwrap_or_default())
        }
        Request::Traverse { path } => match engine.traverse(origin, &path).await {
            Ok(tree) => Reply::Tree(tree.to_wire()),
            Err(_) => Reply::Tree(Vec::new()),
        },
        Request::Prune { path, ts: _ } => {
            Reply::Status(result_status(engine.prune(origin, &path).await))
        }
        Request::Timestamp { path } => {
            Reply::Uint64(engine.timestamp(origin, &path).await.unwrap_or(0))
        }
        Request::Find { pattern, matches } => {
            let filters: Vec<(String, Bytes)> = matches
                .into_iter()
                .map(|leaf| (leaf.path, leaf.value))
                .collect();
            Reply::Paths(engine.find(origin, &pattern, &filters).await.unwrap_or_default())
        }
        Request::Query { template } => {
            let template = PathTree::from_wire(template);
            match engine.query(origin, &template).await {
                Ok(tree) => Reply::Tree(tree.to_wire()),
                Err(_) => Reply::Tree(Vec::new()),
            }
        }
        Request::Memuse { path } => {
            Reply::Uint64(engine.memuse(origin, &path).await.unwrap_or(0))
        }
        Request::Test { mode, echo } => {
            // Mode 1 stalls past the client budget to exercise timeouts.
            if mode == 1 {
                tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
            }
            Reply::Echo(echo)
        }
        Request::Watch { .. }
        | Request::Validate { .. }
        | Request::Provide { .. }
        | Request::Index { .. }
        | Request::Refresh { .. } => return None,
    };
    Some(reply)
}

fn result_status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.status().as_i32(),
    }
}

/// Remember the pid of every registration GUID written on this connection.
fn note_registrations(ops: &[SetOp], owned_pids: &mut HashSet<u64>) {
    const PREFIXES: [&str; 7] = [
        surface::WATCHERS_PATH,
        surface::TREE_WATCHERS_PATH,
        surface::VALIDATORS_PATH,
        surface::REFRESHERS_PATH,
        surface::PROVIDERS_PATH,
        surface::INDEXERS_PATH,
        surface::PROXIES_PATH,
    ];
    for op in ops {
        for prefix in PREFIXES {
            if let Some(guid) = op.path.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
                if let Some((pid, _, _)) = parse_guid(guid) {
                    owned_pids.insert(pid);
                }
            }
        }
    }
}
