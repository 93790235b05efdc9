//! Log-structured object store for a single cache shard.
//!
//! The store manages one contiguous memory region as a log. The region is
//! carved into fixed-size segments, each a bump allocator for variable-sized
//! objects. Segments hold objects of any size, which eliminates class-based
//! internal fragmentation; external fragmentation stays bounded because
//! segments are reclaimed whole.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                            Log                                |
//! |                                                               |
//! |  index: key -> (segment, offset)                              |
//! |                                                               |
//! |  +-----------+-----------+-----------+-----------+            |
//! |  | Segment 0 | Segment 1 | Segment 2 | Segment 3 |  (ring)    |
//! |  +-----------+-----------+-----------+-----------+            |
//! |       ^ head                   ^ tail                         |
//! +---------------------------------------------------------------+
//! ```
//!
//! The writer appends into the tail segment and advances the tail around the
//! ring. When the ring is exhausted, reclamation drains segments starting at
//! the head: expired and superseded objects are discarded, live objects are
//! relocated to the tail, and the drained segment is reset for reuse.
//!
//! A [`Log`] is owned by exactly one thread; no operation takes a lock.
//!
//! # Example
//!
//! ```ignore
//! use logstore::{Log, LogConfig};
//!
//! let mut log = Log::new(LogConfig {
//!     region_size: 64 * 1024 * 1024,
//!     segment_size: 2 * 1024 * 1024,
//! })?;
//!
//! log.append(b"key", b"value")?;
//! assert_eq!(log.find(b"key"), Some(&b"value"[..]));
//! ```

mod error;
mod log;
mod metrics;
mod object;
mod segment;

pub use error::{StoreError, StoreResult};
pub use log::{Location, Log, LogConfig};
pub use object::{HEADER_SIZE, ObjectView, size_of};
pub use segment::{ObjectIter, Segment};
