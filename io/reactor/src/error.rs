//! Error type for reactor setup and operation.

use std::fmt;
use std::io;

/// Errors returned by the reactor.
#[derive(Debug)]
pub enum Error {
    /// An I/O or poller syscall failed.
    Io(io::Error),
    /// The requested backend is not available.
    UnknownBackend(String),
    /// A connection token did not resolve to a live connection.
    InvalidConnection,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::UnknownBackend(name) => write!(f, "unknown io backend: {name}"),
            Error::InvalidConnection => write!(f, "invalid connection"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            Error::InvalidConnection => {
                io::Error::new(io::ErrorKind::NotFound, Error::InvalidConnection)
            }
            Error::UnknownBackend(name) => {
                io::Error::new(io::ErrorKind::InvalidInput, Error::UnknownBackend(name))
            }
        }
    }
}
