//! Cross-shard command envelopes.
//!
//! When a parsed command targets another shard, the owning thread builds an
//! envelope and enqueues it on the SPSC queue toward the target. The target
//! executes against its log, rewrites the opcode into a response code, and
//! enqueues the envelope back; the origin serializes the wire response on
//! the originating socket. Envelopes own their bytes; no references cross
//! threads.

use std::net::SocketAddr;

use io_reactor::{ConnId, UdpId};
use protocol_memcache::FrameHeader;

/// Envelope operation, rewritten in place as the request becomes a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Request: store `key` -> `blob` on the target shard.
    Set,
    /// Response: the set succeeded.
    SetOk,
    /// Response: the target shard was out of memory.
    SetErrorOutOfMemory,
    /// Request: look up `key` on the target shard.
    Get,
    /// Response: lookup finished; `blob` is the hit, if any.
    GetOk,
}

/// Where the final wire response must be written.
#[derive(Debug, Clone, Copy)]
pub enum ReplyTo {
    Tcp {
        conn: ConnId,
    },
    Udp {
        socket: UdpId,
        peer: SocketAddr,
        /// Request frame, echoed into the response.
        frame: FrameHeader,
    },
}

/// One cross-shard command or its response.
#[derive(Debug)]
pub struct Envelope {
    pub op: Opcode,
    pub key: Box<[u8]>,
    pub blob: Option<Box<[u8]>>,
    /// Shard that accepted the request and owns the reply socket.
    pub origin: usize,
    pub reply: ReplyTo,
}
