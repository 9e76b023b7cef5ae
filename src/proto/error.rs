use std::io;

use thiserror::Error;

/// Result type alias for shardis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the client.
///
/// Transport failures (`Io`, `ConnectionClosed`) are retried by the cluster
/// executor; redirects (`Moved`, `Ask`) are routing instructions it acts
/// on; everything else reaches the caller unchanged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport-level failure: refused, reset or timed out.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Malformed or unexpected reply.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server answered with an error reply (wrong type, syntax, ...).
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// The slot has permanently moved to another node.
    #[error("MOVED slot {slot} to {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// Address of the node now owning the slot.
        address: String,
    },

    /// The slot is being migrated; ask the target node for this key once.
    #[error("ASK slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// Address of the node importing the slot.
        address: String,
    },

    /// The cluster reported itself as down.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// Keys of a multi-key command hash to different slots.
    #[error("CROSSSLOT keys in request don't hash to the same slot")]
    CrossSlot,

    /// Nodes answered a broadcast command differently.
    #[error("broadcast replies differ: {node} disagrees")]
    BroadcastMismatch {
        /// First node whose reply differed.
        node: String,
    },

    /// No node of the cluster could be reached.
    #[error("no reachable node in cluster")]
    NoReachableNode,

    /// The retry budget ran out.
    #[error("no more cluster attempts left after {attempts} attempts")]
    MaxAttemptsExceeded {
        /// Attempts made.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// The retry deadline elapsed before the command succeeded.
    #[error("cluster retry deadline exceeded")]
    DeadlineExceeded {
        /// The error of the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// A pooled resource could not be created.
    #[error("failed to create pooled resource: {source}")]
    ResourceCreation {
        /// The factory error.
        #[source]
        source: Box<Error>,
    },

    /// The pool has been closed.
    #[error("resource pool is closed")]
    PoolClosed,

    /// A deferred response was read before its batch was synchronized.
    #[error("response {position} read before its batch was synchronized")]
    NotReady {
        /// Position of the response in its batch.
        position: usize,
    },

    /// The transaction was aborted; no queued command ran.
    #[error("transaction aborted")]
    TransactionAborted,
}

impl Error {
    /// Returns true for transport-class failures worth retrying on another
    /// connection.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Io { .. } | Error::ConnectionClosed => true,
            Error::ResourceCreation { source } => source.is_connection_error(),
            _ => false,
        }
    }

    /// Returns true for `MOVED` and `ASK` redirects.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::Moved { .. } | Error::Ask { .. })
    }

    /// Builds an error from a server error reply.
    ///
    /// `MOVED <slot> <host>:<port>` and `ASK <slot> <host>:<port>` become
    /// [`Error::Moved`] and [`Error::Ask`]; a redirect with a malformed
    /// payload falls back to [`Error::Server`].
    pub fn from_reply(reply: &[u8]) -> Self {
        let msg = String::from_utf8_lossy(reply);
        let msg = msg.trim();

        if let Some(rest) = msg.strip_prefix("MOVED ") {
            if let Some((slot, address)) = parse_redirect(rest) {
                return Error::Moved { slot, address };
            }
        }

        if let Some(rest) = msg.strip_prefix("ASK ") {
            if let Some((slot, address)) = parse_redirect(rest) {
                return Error::Ask { slot, address };
            }
        }

        if msg.starts_with("CLUSTERDOWN") {
            return Error::ClusterDown;
        }

        if msg.starts_with("CROSSSLOT") {
            return Error::CrossSlot;
        }

        Error::Server {
            message: msg.to_string(),
        }
    }

    pub(crate) fn unexpected(expected: &str, found: &str) -> Self {
        Error::Protocol {
            message: format!("expected {}, got {}", expected, found),
        }
    }
}

/// Parses redirect arguments: `<slot> <host>:<port>`.
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?;
    if parts.next().is_some() || !address.contains(':') {
        return None;
    }
    Some((slot, address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved_redirect() {
        match Error::from_reply(b"MOVED 3999 127.0.0.1:7000") {
            Error::Moved { slot, address } => {
                assert_eq!(slot, 3999);
                assert_eq!(address, "127.0.0.1:7000");
            }
            other => panic!("expected Moved, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ask_redirect() {
        match Error::from_reply(b"ASK 12345 192.168.1.100:6379") {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 12345);
                assert_eq!(address, "192.168.1.100:6379");
            }
            other => panic!("expected Ask, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_redirect_with_ipv6_and_whitespace() {
        match Error::from_reply(b"  MOVED 1234 [::1]:7000  ") {
            Error::Moved { slot, address } => {
                assert_eq!(slot, 1234);
                assert_eq!(address, "[::1]:7000");
            }
            other => panic!("expected Moved, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_redirects_fall_back_to_server() {
        assert!(matches!(Error::from_reply(b"MOVED invalid 127.0.0.1:7000"), Error::Server { .. }));
        assert!(matches!(Error::from_reply(b"MOVED 3999"), Error::Server { .. }));
        assert!(matches!(Error::from_reply(b"ASK 1 nohostport"), Error::Server { .. }));
    }

    #[test]
    fn test_parse_cluster_errors() {
        assert!(matches!(Error::from_reply(b"CLUSTERDOWN Hash slot not served"), Error::ClusterDown));
        assert!(matches!(
            Error::from_reply(b"CROSSSLOT Keys in request don't hash to the same slot"),
            Error::CrossSlot
        ));
    }

    #[test]
    fn test_parse_generic_error() {
        match Error::from_reply(b"WRONGTYPE Operation against a key holding the wrong kind of value") {
            Error::Server { message } => assert!(message.starts_with("WRONGTYPE")),
            other => panic!("expected Server, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_error_classification() {
        let io = Error::Io {
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(io.is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::ResourceCreation { source: Box::new(io) }.is_connection_error());
        assert!(!Error::ResourceCreation { source: Box::new(Error::Auth) }.is_connection_error());
        assert!(!Error::Server { message: "ERR".into() }.is_connection_error());
        assert!(!Error::NoReachableNode.is_connection_error());
    }

    #[test]
    fn test_max_attempts_keeps_last_cause() {
        let err = Error::MaxAttemptsExceeded {
            attempts: 5,
            source: Box::new(Error::ConnectionClosed),
        };
        assert_eq!(err.to_string(), "no more cluster attempts left after 5 attempts");
        let cause = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(cause.as_deref(), Some("connection closed by peer"));
    }

    #[test]
    fn test_error_display_server() {
        let error = Error::Server {
            message: "ERR wrong type".to_string(),
        };
        assert_eq!(error.to_string(), "server error: ERR wrong type");
    }
}
