//! Readiness poller capability trait and the mio (epoll) backend.
//!
//! The reactor is generic over `{register, modify, unregister, wait}` so
//! other readiness backends can slot in without touching the loop.

use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

/// Which readiness to watch for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable only.
    Readable,
    /// Readable and writable.
    ReadWrite,
}

/// One ready descriptor reported by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

/// Capability interface over a readiness notification facility.
pub trait Poller {
    /// Start watching `fd` under `token`.
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Change the watched readiness of an already-registered `fd`.
    fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until readiness or `timeout`; `None` blocks indefinitely.
    ///
    /// Ready descriptors are appended to `ready`; returns how many were
    /// appended. `Interrupted` surfaces to the caller untouched.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<usize>;
}

/// mio-backed poller: epoll on Linux, kqueue elsewhere.
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match interest {
        Interest::Readable => mio::Interest::READABLE,
        Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
    }
}

impl Poller for MioPoller {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), to_mio(interest))
    }

    fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), to_mio(interest))
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;

        let mut count = 0;
        for event in self.events.iter() {
            ready.push(Readiness {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
            });
            count += 1;
        }
        Ok(count)
    }
}

/// Readiness backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Level/edge multiplexed readiness via mio (epoll on Linux).
    #[default]
    Epoll,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Epoll => write!(f, "epoll"),
        }
    }
}

impl FromStr for Backend {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "epoll" | "mio" => Ok(Backend::Epoll),
            other => Err(crate::Error::UnknownBackend(other.to_string())),
        }
    }
}
