//! Error types for adbx operations.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, adbx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by host, device and transfer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A protocol operation scoped to one device failed.
    #[error("{op} on {device}: {source}")]
    Device {
        /// The operation, including its path argument if any.
        op: String,
        /// The device selector, as displayed by [`DeviceDescriptor`](crate::DeviceDescriptor).
        device: String,
        /// The underlying protocol failure.
        #[source]
        source: adbx_wire::Error,
    },

    /// A request to the relay server itself failed.
    #[error("{op}: {source}")]
    Host {
        /// The host request that failed.
        op: String,
        /// The underlying protocol failure.
        #[source]
        source: adbx_wire::Error,
    },

    /// A local file system operation failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// The local path involved.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: io::Error,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Several independent steps failed; one message per line.
    #[error("{}", .0.join("\n"))]
    Aggregate(Vec<String>),

    /// Invalid server configuration or selector.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A protocol error without operation context.
    #[error(transparent)]
    Wire(#[from] adbx_wire::Error),
}

impl Error {
    /// Returns the protocol error this wraps, if any.
    pub fn wire(&self) -> Option<&adbx_wire::Error> {
        match self {
            Self::Device { source, .. } | Self::Host { source, .. } => Some(source),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the remote path does not exist.
    pub fn is_file_not_exist(&self) -> bool {
        self.wire().is_some_and(adbx_wire::Error::is_file_not_exist)
    }

    /// One line per failure for [`Error::Aggregate`], the display text otherwise.
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Aggregate(lines) => lines.clone(),
            other => vec![other.to_string()],
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
