use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for slotmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cluster router and its connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred on a node connection.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// Establishing a connection to a node failed.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Node address (host:port).
        address: String,
        /// Description of the failure.
        message: String,
    },

    /// A connect or command timeout elapsed.
    #[error("timed out waiting for {address}")]
    Timeout {
        /// Node address (host:port).
        address: String,
    },

    /// Authentication was rejected by a node.
    #[error("authentication failed: {message}")]
    Auth {
        /// Error reply returned by the node.
        message: String,
    },

    /// The connection was closed before a reply arrived.
    #[error("connection closed")]
    Closed,

    /// A malformed reply was received.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error reply where a value was required.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Invalid configuration or command argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// No node serves the slot.
    #[error("no route to slot {slot}")]
    NoRoute {
        /// The unmapped slot.
        slot: u16,
    },

    /// A non-splittable command has keys in more than one slot.
    #[error("CROSSSLOT keys of command {command} map to different slots")]
    CrossSlot {
        /// Upper-cased command name.
        command: String,
    },

    /// The cluster reported itself down.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// An allocation was refused.
    #[error("out of memory")]
    OutOfMemory,

    /// The redirect/error loop reached `max_retry`.
    #[error("too many cluster retries ({attempts} attempts): {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// The error seen on the final attempt.
        #[source]
        last: Box<Error>,
    },
}

/// Coarse classification of an [`Error`], stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad address list, option or command shape. Never involves I/O.
    Config,
    /// Slot is not mapped to any node.
    NoRoute,
    /// Keys of a non-splittable command span slots.
    CrossSlot,
    /// I/O failure, timeout, TLS or authentication failure.
    Connection,
    /// Malformed reply.
    Protocol,
    /// Error reply from a node.
    Server,
    /// Allocation failure.
    OutOfMemory,
    /// Retry bound reached.
    RetriesExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::NoRoute => "no route",
            ErrorKind::CrossSlot => "cross slot",
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Server => "server",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::RetriesExhausted => "retries exhausted",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. }
            | Error::Connect { .. }
            | Error::Timeout { .. }
            | Error::Auth { .. }
            | Error::Closed => ErrorKind::Connection,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Server { .. } | Error::ClusterDown => ErrorKind::Server,
            Error::InvalidArgument { .. } => ErrorKind::Config,
            Error::NoRoute { .. } => ErrorKind::NoRoute,
            Error::CrossSlot { .. } => ErrorKind::CrossSlot,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// Returns true if the router may retry the command after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Returns true if the connection that produced this error must not be reused.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Protocol)
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}

/// Snapshot of the most recent failure recorded on a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&Error> for LastError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let error = Error::Io { source: io_err };
        assert!(error.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_protocol() {
        let error = Error::protocol("invalid frame");
        assert_eq!(error.to_string(), "protocol error: invalid frame");
    }

    #[test]
    fn test_error_display_cross_slot() {
        let error = Error::CrossSlot {
            command: "SUNION".to_string(),
        };
        assert!(error.to_string().starts_with("CROSSSLOT"));
        assert_eq!(error.kind(), ErrorKind::CrossSlot);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::Closed.kind(), ErrorKind::Connection);
        assert_eq!(
            Error::Timeout {
                address: "127.0.0.1:7000".into()
            }
            .kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            Error::Auth {
                message: "WRONGPASS".into()
            }
            .kind(),
            ErrorKind::Connection
        );
        assert_eq!(Error::invalid("bad").kind(), ErrorKind::Config);
        assert_eq!(Error::NoRoute { slot: 1 }.kind(), ErrorKind::NoRoute);
        assert_eq!(Error::OutOfMemory.kind(), ErrorKind::OutOfMemory);
        assert_eq!(Error::ClusterDown.kind(), ErrorKind::Server);
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Closed.is_retryable());
        assert!(!Error::OutOfMemory.is_retryable());
        assert!(!Error::protocol("x").is_retryable());
        assert!(Error::protocol("x").poisons_connection());
        assert!(!Error::invalid("x").poisons_connection());
    }

    #[test]
    fn test_retries_exhausted_keeps_last() {
        let error = Error::RetriesExhausted {
            attempts: 6,
            last: Box::new(Error::Closed),
        };
        assert_eq!(error.kind(), ErrorKind::RetriesExhausted);
        assert!(error.to_string().contains("connection closed"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_last_error_from_error() {
        let last = LastError::from(&Error::NoRoute { slot: 42 });
        assert_eq!(last.kind, ErrorKind::NoRoute);
        assert_eq!(last.message, "no route to slot 42");
        assert_eq!(last.to_string(), "no route error: no route to slot 42");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let error: Error = io_err.into();
        assert!(matches!(error, Error::Io { .. }));
    }
}
