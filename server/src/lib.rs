//! Sharded memcache-compatible cache server.
//!
//! Keys are partitioned across shard threads by a stable hash. Each shard
//! owns one log-structured store and one reactor; commands for another
//! shard travel as envelopes over the wait-free SPSC mesh and their
//! responses are serialized back on the originating socket.

pub mod affinity;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod logging;
pub mod metrics;
pub mod router;
pub mod signal;
pub mod worker;

pub use config::{Args, Config};
pub use envelope::{Envelope, Opcode, ReplyTo};
