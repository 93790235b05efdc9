//! Memcache ASCII protocol, server-side subset.
//!
//! Supports the `get` and `set` commands over TCP and UDP:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes>\r\n<data>\r\n   -> STORED\r\n
//! get <key>\r\n                                      -> VALUE <key> 0 <bytes>\r\n<data>\r\nEND\r\n
//! ```
//!
//! `flags` and `exptime` are parsed but ignored by the store. Malformed
//! input is answered with `ERROR\r\n`. UDP requests and responses carry an
//! 8-byte big-endian frame header (see [`FrameHeader`]).

mod command;
mod frame;
pub mod response;

pub use command::{Command, ParseError};
pub use frame::{FRAME_SIZE, FrameHeader};
