//! Error taxonomy for the wire protocol.

use std::io;

/// Alias for `Result<T, adbx_wire::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while speaking the host, sync or shell protocols.
///
/// None of these are recoverable in-protocol: after any variant other than
/// [`Error::Server`] (returned for a cleanly framed `FAIL` status) or the
/// pre-flight checks ([`Error::Assertion`], [`Error::Parse`]), the framing
/// position of the connection is unknown and it must be discarded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The stream ended before any byte of a new frame arrived.
    #[error("connection reset: stream ended before a new message started")]
    ConnectionReset,

    /// The stream ended in the middle of a frame.
    #[error("incomplete {stage}: read {got} bytes, expecting {want}")]
    IncompleteMessage {
        /// Which part of the frame was being read (`"length"`, `"message data"`, …).
        stage: &'static str,
        /// Bytes actually read.
        got: usize,
        /// Bytes the frame announced.
        want: usize,
        /// The bytes read before the stream ended.
        partial: Vec<u8>,
    },

    /// A status word could not be read in full.
    #[error("error reading status for {request}: {source}")]
    Status {
        /// The request the status belongs to.
        request: String,
        /// The underlying framing failure.
        #[source]
        source: Box<Error>,
    },

    /// The server answered with a `FAIL` status and an error message.
    #[error("AdbError: request {request}, server error: {message}")]
    Server {
        /// The request that failed.
        request: String,
        /// The message the server sent after `FAIL`.
        message: String,
    },

    /// The server answered `FAIL` but the error message itself was truncated.
    #[error("server returned error for {request}, but couldn't read the error message")]
    ServerMessageUnreadable {
        /// The request that failed.
        request: String,
        /// Why the message could not be read.
        #[source]
        source: Box<Error>,
    },

    /// The remote path does not exist.
    #[error("no such file or directory: {0}")]
    FileNoExist(String),

    /// A local precondition does not hold (empty command, reused session, …).
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// An argument could not be encoded for the wire.
    #[error("parse error: {0}")]
    Parse(String),

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No device matched the requested selector.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// I/O failure on the underlying connection, including expired deadlines.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl Error {
    /// Returns `true` if this is (or wraps) [`Error::FileNoExist`].
    pub fn is_file_not_exist(&self) -> bool {
        matches!(self, Self::FileNoExist(_))
    }

    /// Returns `true` if the error came from an expired read deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// Returns the server-reported message for `FAIL` responses.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Server { message, .. } => Some(message),
            _ => None,
        }
    }

    pub(crate) fn incomplete(stage: &'static str, partial: Vec<u8>, want: usize) -> Self {
        Self::IncompleteMessage {
            stage,
            got: partial.len(),
            want,
            partial,
        }
    }
}
