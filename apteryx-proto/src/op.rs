//! Opcodes and errno-style status codes.

use crate::message::ProtocolError;

/// Request opcodes.
///
/// `Set` through `Test` are issued by clients against a server; `Watch`
/// through `Refresh` travel the other way, from a server to the client that
/// owns a callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Set = 0x01,
    Get = 0x02,
    Search = 0x03,
    Traverse = 0x04,
    Prune = 0x05,
    Timestamp = 0x06,
    Find = 0x07,
    Query = 0x08,
    Memuse = 0x09,
    Test = 0x10,
    /// SET that blocks until every watcher queued by the mutation has run.
    SetWait = 0x11,

    Watch = 0x20,
    Validate = 0x21,
    Provide = 0x22,
    Index = 0x23,
    Refresh = 0x24,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0x01 => OpCode::Set,
            0x02 => OpCode::Get,
            0x03 => OpCode::Search,
            0x04 => OpCode::Traverse,
            0x05 => OpCode::Prune,
            0x06 => OpCode::Timestamp,
            0x07 => OpCode::Find,
            0x08 => OpCode::Query,
            0x09 => OpCode::Memuse,
            0x10 => OpCode::Test,
            0x11 => OpCode::SetWait,
            0x20 => OpCode::Watch,
            0x21 => OpCode::Validate,
            0x22 => OpCode::Provide,
            0x23 => OpCode::Index,
            0x24 => OpCode::Refresh,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Operation status carried as a 32-bit signed integer on the wire.
///
/// Zero is success; negative values mirror the usual errno meanings so that
/// callers in any language can interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation applied.
    Ok,
    /// A validator refused the mutation.
    Refused,
    /// Compare-and-swap timestamp mismatch.
    Busy,
    /// Callback or RPC exceeded its per-call budget.
    Timeout,
    /// Malformed path.
    Invalid,
    /// Value did not parse as the requested type.
    Range,
    /// Any other errno-style failure.
    Errno(i32),
}

const EPERM: i32 = 1;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;
const ETIMEDOUT: i32 = 110;

impl Status {
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Refused => -EPERM,
            Status::Busy => -EBUSY,
            Status::Timeout => -ETIMEDOUT,
            Status::Invalid => -EINVAL,
            Status::Range => -ERANGE,
            Status::Errno(code) => code,
        }
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            c if c == -EPERM => Status::Refused,
            c if c == -EBUSY => Status::Busy,
            c if c == -ETIMEDOUT => Status::Timeout,
            c if c == -EINVAL => Status::Invalid,
            c if c == -ERANGE => Status::Range,
            other => Status::Errno(other),
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Refused => write!(f, "refused by validator"),
            Status::Busy => write!(f, "timestamp mismatch"),
            Status::Timeout => write!(f, "timed out"),
            Status::Invalid => write!(f, "invalid path"),
            Status::Range => write!(f, "value out of range"),
            Status::Errno(code) => write!(f, "errno {code}"),
        }
    }
}
