use std::io;

use mcmeta_proto::ProtoError;
use thiserror::Error;

/// Everything an operation can fail with, by kind.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed key")]
    MalformedKey,
    #[error("no servers available")]
    NoServers,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("cache miss")]
    CacheMiss,
    #[error("item not stored")]
    NotStored,
    #[error("key already exists")]
    KeyExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("protocol: {0}")]
    Protocol(ProtoError),
    #[error("server error: {0}")]
    Server(String),
    #[error("client error: {0}")]
    Client(String),
    #[error("circuit open")]
    CircuitOpen,
    #[error("operation timed out")]
    Timeout,
    #[error("pool closed")]
    PoolClosed,
    #[error("command already executed")]
    SpentCommand,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtoError> for Error {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::MalformedKey => Error::MalformedKey,
            ProtoError::Io(err) => Error::Io(err),
            other => Error::Protocol(other),
        }
    }
}

impl Error {
    /// Whether this error counts against the circuit breaker. Application
    /// outcomes (misses, not-stored, cas conflicts) never do, and neither
    /// does a fast-failed call that never reached the server.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::Protocol(_)
                | Error::Server(_)
                | Error::Client(_)
                | Error::Timeout
                | Error::Io(_)
        )
    }
}

/// What the pool should do with a connection after a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Disposition {
    /// The connection is still aligned with the server; return it.
    Release,
    /// The byte stream can no longer be trusted; close and drop it.
    Discard,
}

impl Disposition {
    /// Classifies the outcome of a call.
    ///
    /// Socket-level deadline errors leave the stream usable, but a wait that
    /// timed out with a command still unanswered discards: the reply will
    /// arrive for a caller that is no longer listening and the connection's
    /// backlog is of unknown depth.
    pub fn of(err: Option<&Error>) -> Self {
        let Some(err) = err else { return Disposition::Release };
        match err {
            Error::ConnectionClosed | Error::Client(_) | Error::Timeout => Disposition::Discard,
            Error::Protocol(proto) if proto.is_framing() => Disposition::Discard,
            Error::Io(io) => match io.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Disposition::Release,
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => Disposition::Discard,
                _ => Disposition::Release,
            },
            _ => Disposition::Release,
        }
    }
}
