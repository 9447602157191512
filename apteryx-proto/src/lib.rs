//! # apteryx-proto
//!
//! Wire protocol definitions for apteryx - foundation for the client and
//! server crates.
//!
//! The protocol is a length-delimited binary framing carried over UNIX or
//! TCP stream sockets:
//!
//! ```text
//! ┌────────────────┬──────────┬──────────────────────────┐
//! │ length: u32 BE │ op: u8   │ opcode-specific payload  │
//! └────────────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Strings are length-prefixed UTF-8; values are optional byte strings with
//! a presence tag. Replies carry no opcode of their own - responses travel
//! on the same socket in request order, so the receiver decodes them
//! against the opcode it sent ([`Reply::decode_for`]).
//!
//! This crate has no I/O of its own beyond the async frame helpers in
//! [`frame`]; connection management lives in `apteryx-client` and
//! `apteryx-server`.

mod frame;
mod message;
mod op;
mod uri;

#[cfg(test)]
mod frame_test;
#[cfg(test)]
mod message_test;
#[cfg(test)]
mod uri_test;

pub use frame::read_frame;
pub use frame::write_frame;
pub use frame::MAX_FRAME_LEN;
pub use message::Leaf;
pub use message::ProtocolError;
pub use message::Reply;
pub use message::Request;
pub use message::SetOp;
pub use op::OpCode;
pub use op::Status;
pub use uri::ListenUri;
pub use uri::UriError;

/// Sentinel timestamp meaning "no compare-and-swap check".
pub const TS_UNCONDITIONAL: u64 = u64::MAX;
