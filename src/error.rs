use std::fmt;
use std::io;

/// Errors surfaced by the library's startup paths.
///
/// Per-connection failures never appear here; they are delivered through the
/// connection's error and closed callbacks and tear down only that
/// connection.
#[derive(Debug)]
pub enum Error {
    /// A socket, bind, listen, or notification-fd syscall failed.
    Io(io::Error),
    /// A listen or connect address could not be parsed.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
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
