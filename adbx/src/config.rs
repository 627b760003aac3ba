//! Relay server address and timeouts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use adbx_wire::consts::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the relay server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ServerAddress {
    /// TCP socket, `tcp:<host>:<port>`.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix domain socket, `localfilesystem:<path>`.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Unix { path } => write!(f, "localfilesystem:{}", path.display()),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("localfilesystem:") {
            if path.is_empty() {
                return Err(Error::Config(format!("empty socket path in {s:?}")));
            }
            return Ok(Self::Unix { path: path.into() });
        }
        let rest = s
            .strip_prefix("tcp:")
            .ok_or_else(|| Error::Config(format!("unsupported server socket {s:?}")))?;
        // A bare port means the loopback interface.
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("127.0.0.1", rest),
        };
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in {s:?}")))?;
        Ok(Self::Tcp {
            host: host.to_owned(),
            port,
        })
    }
}

/// Connection settings for the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ServerConfig {
    /// Relay server address.
    pub address: ServerAddress,
    /// Upper bound for establishing the TCP/Unix connection.
    pub connect_timeout: Duration,
    /// Status reads and short commands (`run_command`).
    pub short_timeout: Duration,
    /// Commands expected to take a while (`mkdir` batches, remount).
    pub long_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ServerAddress::default(),
            connect_timeout: Duration::from_secs(5),
            short_timeout: Duration::from_secs(2),
            long_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults adjusted by `ADB_SERVER_SOCKET` and `ANDROID_ADB_SERVER_PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            env::var("ADB_SERVER_SOCKET").ok().as_deref(),
            env::var("ANDROID_ADB_SERVER_PORT").ok().as_deref(),
        )
    }

    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&data).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Replaces the TCP port, keeping the host.
    pub fn with_port(mut self, port: u16) -> Self {
        self.address = match self.address {
            ServerAddress::Tcp { host, .. } => ServerAddress::Tcp { host, port },
            ServerAddress::Unix { .. } => ServerAddress::Tcp {
                host: "127.0.0.1".into(),
                port,
            },
        };
        self
    }

    /// Replaces the TCP host, keeping the port.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let port = match self.address {
            ServerAddress::Tcp { port, .. } => port,
            ServerAddress::Unix { .. } => DEFAULT_PORT,
        };
        self.address = ServerAddress::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    fn from_vars(socket: Option<&str>, port: Option<&str>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(socket) = socket.filter(|s| !s.is_empty()) {
            config.address = socket.parse()?;
        } else if let Some(port) = port.filter(|s| !s.is_empty()) {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid ANDROID_ADB_SERVER_PORT {port:?}")))?;
            config = config.with_port(port);
        }
        Ok(config)
    }
}
