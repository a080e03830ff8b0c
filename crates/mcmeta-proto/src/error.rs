use thiserror::Error;

/// Errors raised while encoding requests or framing responses.
///
/// Every variant other than `MalformedKey` indicates that the byte stream is
/// no longer aligned with the server and the connection carrying it must be
/// discarded.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("key is empty, too long, or contains forbidden bytes")]
    MalformedKey,
    #[error("malformed response line: {0:?}")]
    MalformedLine(String),
    #[error("bad value size token: {0:?}")]
    BadValueSize(String),
    #[error("value short read: wanted {wanted} bytes, got {got}")]
    ShortValueRead { wanted: usize, got: usize },
    #[error("value frame missing CRLF terminator")]
    MissingTerminator,
    #[error("unexpected response token: {0:?}")]
    UnexpectedToken(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// True when the stream framing is broken (as opposed to a request that
    /// was rejected before any bytes hit the wire).
    pub fn is_framing(&self) -> bool {
        !matches!(self, ProtoError::MalformedKey)
    }
}
