//! Per-thread readiness reactor with cross-thread SPSC messaging.
//!
//! Each shard thread owns one [`Reactor`]. A reactor combines three things:
//!
//! - a readiness poller (epoll via mio) for its sockets,
//! - polling of inbound wait-free [`spsc::Queue`]s from every peer thread,
//! - an explicit sleep/wakeup protocol so a thread blocked in the poller is
//!   woken when a peer enqueues a message for it.
//!
//! The cross-thread side lives in [`Mesh`]: one SPSC queue per ordered pair
//! of threads, one eventfd wakeup handle per thread, and one seq-cst
//! sleeping flag per thread. Only opaque message envelopes cross threads;
//! sockets and storage stay with their owning shard.
//!
//! The reactor is completion-shaped: callers run `poll()` then handle the
//! events from `drain_events()`, issuing `recv`/`send`/`close` back into the
//! reactor. Sends that cannot complete immediately are buffered per socket
//! and flushed on writable readiness.

mod error;
mod mesh;
mod metrics;
mod poller;
mod reactor;
pub mod spsc;

pub use error::Error;
pub use mesh::{MSG_QUEUE_CAPACITY, Mesh};
pub use poller::{Backend, Interest, MioPoller, Poller, Readiness};
pub use reactor::{ConnId, Event, ListenerId, Reactor, UdpId};
