//! Message codec.
//!
//! Every payload is built from four primitives: `u8`, `u64`/`i32`,
//! length-prefixed UTF-8 strings and optional byte-string values with a
//! presence tag. A tree travels as the flat list of its value-bearing
//! leaves; the receiver reconstructs the branching.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::op::OpCode;

/// Codec-level failures. Any of these closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("truncated payload decoding {0}")]
    Truncated(&'static str),

    #[error("string field is not valid UTF-8")]
    BadString,

    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// One leaf of a serialized tree document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub path: String,
    pub value: Bytes,
}

/// One path/value pair of a SET batch.
///
/// `value: None` unsets the leaf. `ts` is the origin's stamp for the write;
/// clients send 0 and let the server allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOp {
    pub path: String,
    pub value: Option<Bytes>,
    pub ts: u64,
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Multi-path mutation. `expected` is the CAS guard for the root path;
    /// [`crate::TS_UNCONDITIONAL`] disables the check. `wait` selects the
    /// SET_WAIT opcode.
    Set {
        ops: Vec<SetOp>,
        expected: u64,
        wait: bool,
    },
    Get {
        path: String,
    },
    Search {
        prefix: String,
    },
    Traverse {
        path: String,
    },
    Prune {
        path: String,
        ts: u64,
    },
    Timestamp {
        path: String,
    },
    Find {
        pattern: String,
        matches: Vec<Leaf>,
    },
    Query {
        template: Vec<Leaf>,
    },
    Memuse {
        path: String,
    },
    Test {
        mode: u8,
        echo: String,
    },

    /// Server-to-client watcher invocation. `handle` identifies the
    /// registered closure on the client side.
    Watch {
        handle: u64,
        path: String,
        value: Option<Bytes>,
    },
    Validate {
        handle: u64,
        path: String,
        value: Option<Bytes>,
    },
    Provide {
        handle: u64,
        path: String,
    },
    Index {
        handle: u64,
        path: String,
    },
    Refresh {
        handle: u64,
        path: String,
    },
}

/// A decoded reply frame.
///
/// Replies are not self-describing: decode with [`Reply::decode_for`] and
/// the opcode of the request the reply answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(i32),
    Value(Option<Bytes>),
    Paths(Vec<String>),
    Tree(Vec<Leaf>),
    Uint64(u64),
    Echo(String),
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Set { wait: false, .. } => OpCode::Set,
            Request::Set { wait: true, .. } => OpCode::SetWait,
            Request::Get { .. } => OpCode::Get,
            Request::Search { .. } => OpCode::Search,
            Request::Traverse { .. } => OpCode::Traverse,
            Request::Prune { .. } => OpCode::Prune,
            Request::Timestamp { .. } => OpCode::Timestamp,
            Request::Find { .. } => OpCode::Find,
            Request::Query { .. } => OpCode::Query,
            Request::Memuse { .. } => OpCode::Memuse,
            Request::Test { .. } => OpCode::Test,
            Request::Watch { .. } => OpCode::Watch,
            Request::Validate { .. } => OpCode::Validate,
            Request::Provide { .. } => OpCode::Provide,
            Request::Index { .. } => OpCode::Index,
            Request::Refresh { .. } => OpCode::Refresh,
        }
    }

    /// Encode into a frame body (opcode byte included).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.opcode() as u8);
        match self {
            Request::Set { ops, expected, .. } => {
                buf.put_u32(ops.len() as u32);
                for op in ops {
                    put_str(&mut buf, &op.path);
                    put_value(&mut buf, op.value.as_ref());
                    buf.put_u64(op.ts);
                }
                buf.put_u64(*expected);
            }
            Request::Get { path }
            | Request::Search { prefix: path }
            | Request::Traverse { path }
            | Request::Timestamp { path }
            | Request::Memuse { path } => {
                put_str(&mut buf, path);
            }
            Request::Prune { path, ts } => {
                put_str(&mut buf, path);
                buf.put_u64(*ts);
            }
            Request::Find { pattern, matches } => {
                put_str(&mut buf, pattern);
                put_leaves(&mut buf, matches);
            }
            Request::Query { template } => {
                put_leaves(&mut buf, template);
            }
            Request::Test { mode, echo } => {
                buf.put_u8(*mode);
                put_str(&mut buf, echo);
            }
            Request::Watch { handle, path, value } | Request::Validate { handle, path, value } => {
                buf.put_u64(*handle);
                put_str(&mut buf, path);
                put_value(&mut buf, value.as_ref());
            }
            Request::Provide { handle, path }
            | Request::Index { handle, path }
            | Request::Refresh { handle, path } => {
                buf.put_u64(*handle);
                put_str(&mut buf, path);
            }
        }
        buf.freeze()
    }

    /// Decode a frame body (opcode byte included).
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Truncated("opcode"));
        }
        let op = OpCode::try_from(buf.get_u8())?;
        let req = match op {
            OpCode::Set | OpCode::SetWait => {
                let count = get_u32(&mut buf, "set count")?;
                let mut ops = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let path = get_str(&mut buf)?;
                    let value = get_value(&mut buf)?;
                    let ts = get_u64(&mut buf, "set ts")?;
                    ops.push(SetOp { path, value, ts });
                }
                let expected = get_u64(&mut buf, "cas ts")?;
                Request::Set {
                    ops,
                    expected,
                    wait: op == OpCode::SetWait,
                }
            }
            OpCode::Get => Request::Get { path: get_str(&mut buf)? },
            OpCode::Search => Request::Search { prefix: get_str(&mut buf)? },
            OpCode::Traverse => Request::Traverse { path: get_str(&mut buf)? },
            OpCode::Prune => Request::Prune {
                path: get_str(&mut buf)?,
                ts: get_u64(&mut buf, "prune ts")?,
            },
            OpCode::Timestamp => Request::Timestamp { path: get_str(&mut buf)? },
            OpCode::Find => Request::Find {
                pattern: get_str(&mut buf)?,
                matches: get_leaves(&mut buf)?,
            },
            OpCode::Query => Request::Query { template: get_leaves(&mut buf)? },
            OpCode::Memuse => Request::Memuse { path: get_str(&mut buf)? },
            OpCode::Test => Request::Test {
                mode: get_u8(&mut buf, "test mode")?,
                echo: get_str(&mut buf)?,
            },
            OpCode::Watch => Request::Watch {
                handle: get_u64(&mut buf, "handle")?,
                path: get_str(&mut buf)?,
                value: get_value(&mut buf)?,
            },
            OpCode::Validate => Request::Validate {
                handle: get_u64(&mut buf, "handle")?,
                path: get_str(&mut buf)?,
                value: get_value(&mut buf)?,
            },
            OpCode::Provide => Request::Provide {
                handle: get_u64(&mut buf, "handle")?,
                path: get_str(&mut buf)?,
            },
            OpCode::Index => Request::Index {
                handle: get_u64(&mut buf, "handle")?,
                path: get_str(&mut buf)?,
            },
            OpCode::Refresh => Request::Refresh {
                handle: get_u64(&mut buf, "handle")?,
                path: get_str(&mut buf)?,
            },
        };
        Ok(req)
    }
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Reply::Status(code) => buf.put_i32(*code),
            Reply::Value(value) => put_value(&mut buf, value.as_ref()),
            Reply::Paths(paths) => {
                buf.put_u32(paths.len() as u32);
                for p in paths {
                    put_str(&mut buf, p);
                }
            }
            Reply::Tree(leaves) => put_leaves(&mut buf, leaves),
            Reply::Uint64(v) => buf.put_u64(*v),
            Reply::Echo(s) => put_str(&mut buf, s),
        }
        buf.freeze()
    }

    /// Decode the reply to a request issued with `op`.
    pub fn decode_for(op: OpCode, mut buf: Bytes) -> Result<Self, ProtocolError> {
        Ok(match op {
            OpCode::Set | OpCode::SetWait | OpCode::Prune | OpCode::Watch | OpCode::Validate => {
                Reply::Status(get_i32(&mut buf, "status")?)
            }
            OpCode::Get | OpCode::Provide => Reply::Value(get_value(&mut buf)?),
            OpCode::Search | OpCode::Find | OpCode::Index => {
                let count = get_u32(&mut buf, "path count")?;
                let mut paths = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    paths.push(get_str(&mut buf)?);
                }
                Reply::Paths(paths)
            }
            OpCode::Traverse | OpCode::Query => Reply::Tree(get_leaves(&mut buf)?),
            OpCode::Timestamp | OpCode::Memuse | OpCode::Refresh => {
                Reply::Uint64(get_u64(&mut buf, "u64 reply")?)
            }
            OpCode::Test => Reply::Echo(get_str(&mut buf)?),
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_value(buf: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_leaves(buf: &mut BytesMut, leaves: &[Leaf]) {
    buf.put_u32(leaves.len() as u32);
    for leaf in leaves {
        put_str(buf, &leaf.path);
        buf.put_u32(leaf.value.len() as u32);
        buf.put_slice(&leaf.value);
    }
}

fn get_u8(buf: &mut Bytes, what: &'static str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes, what: &'static str) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes, what: &'static str) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u64())
}

fn get_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let len = get_u32(buf, "string length")? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated("string body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadString)
}

fn get_value(buf: &mut Bytes) -> Result<Option<Bytes>, ProtocolError> {
    match get_u8(buf, "value tag")? {
        0 => Ok(None),
        1 => {
            let len = get_u32(buf, "value length")? as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::Truncated("value body"));
            }
            Ok(Some(buf.split_to(len)))
        }
        _ => Err(ProtocolError::Malformed("value tag")),
    }
}

fn get_leaves(buf: &mut Bytes) -> Result<Vec<Leaf>, ProtocolError> {
    let count = get_u32(buf, "leaf count")?;
    let mut leaves = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let path = get_str(buf)?;
        let len = get_u32(buf, "leaf value length")? as usize;
        if buf.remaining() < len {
            return Err(ProtocolError::Truncated("leaf value"));
        }
        leaves.push(Leaf {
            path,
            value: buf.split_to(len),
        });
    }
    Ok(leaves)
}
