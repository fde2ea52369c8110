//! Wire Protocol Definitions
//!
//! This crate defines the envelope types and the tagged text-frame codec
//! carried on the pgrok control channel.

pub mod envelope;
pub mod frame;

pub use envelope::{
    HttpRequestEnvelope, HttpResponseEnvelope, TcpEnvelope, TcpMessageKind, WsRelayEnvelope,
};
pub use frame::{CodecError, Frame};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Chunk size for TCP sub-stream reads
pub const TCP_CHUNK_SIZE: usize = 8 * 1024;
