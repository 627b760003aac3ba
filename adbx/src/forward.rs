//! Port and socket forwarding endpoints.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// One end of a forward, in the server's `<kind>:<address>` notation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ForwardSpec {
    /// `tcp:<port>`; `tcp:0` on the local side picks a free port.
    Tcp(u16),
    /// `localabstract:<name>`.
    LocalAbstract(String),
    /// `localreserved:<name>`.
    LocalReserved(String),
    /// `localfilesystem:<path>`.
    LocalFilesystem(String),
    /// `dev:<character device>`.
    Dev(String),
    /// `jdwp:<pid>`; remote side only.
    Jdwp(u32),
    /// `vsock:<cid>:<port>`; remote side only.
    Vsock {
        /// Context id.
        cid: u32,
        /// Port.
        port: u32,
    },
    /// `acceptfd:<fd>`; listen side only.
    AcceptFd(i32),
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::LocalAbstract(name) => write!(f, "localabstract:{name}"),
            Self::LocalReserved(name) => write!(f, "localreserved:{name}"),
            Self::LocalFilesystem(path) => write!(f, "localfilesystem:{path}"),
            Self::Dev(name) => write!(f, "dev:{name}"),
            Self::Jdwp(pid) => write!(f, "jdwp:{pid}"),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            Self::AcceptFd(fd) => write!(f, "acceptfd:{fd}"),
        }
    }
}

impl FromStr for ForwardSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Wire(adbx_wire::Error::Parse(format!("invalid forward spec {s:?}")));
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        let spec = match kind {
            "tcp" => Self::Tcp(rest.parse().map_err(|_| invalid())?),
            "localabstract" => Self::LocalAbstract(rest.to_owned()),
            "localreserved" => Self::LocalReserved(rest.to_owned()),
            "localfilesystem" => Self::LocalFilesystem(rest.to_owned()),
            "dev" => Self::Dev(rest.to_owned()),
            "jdwp" => Self::Jdwp(rest.parse().map_err(|_| invalid())?),
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;
                Self::Vsock {
                    cid: cid.parse().map_err(|_| invalid())?,
                    port: port.parse().map_err(|_| invalid())?,
                }
            }
            "acceptfd" => Self::AcceptFd(rest.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };
        Ok(spec)
    }
}
