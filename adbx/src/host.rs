//! Requests answered by the relay server itself.

use std::sync::Arc;

use adbx_wire::Conn;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::descriptor::DeviceDescriptor;
use crate::device::Device;
use crate::info::{self, DeviceInfo, Features};
use crate::server::{self, ServerStream};
use crate::{Error, Result};

/// Handle to the relay server.
///
/// Cheap to clone; every request opens its own connection.
#[derive(Debug, Clone)]
pub struct Adb {
    config: Arc<ServerConfig>,
}

impl Adb {
    /// Creates a handle for the server described by `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Creates a handle from [`ServerConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ServerConfig::from_env()?))
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns a session for the device chosen by `descriptor`.
    pub fn device(&self, descriptor: DeviceDescriptor) -> Device {
        Device::new(self.clone(), descriptor)
    }

    /// Protocol version of the running server (`host:version`).
    pub async fn server_version(&self) -> Result<u32> {
        let op = "host:version";
        let resp = self.round_trip(op).await?;
        let text = String::from_utf8_lossy(&resp);
        u32::from_str_radix(text.trim(), 16).map_err(|_| Error::Host {
            op: op.into(),
            source: adbx_wire::Error::Parse(format!("invalid server version {text:?}")),
        })
    }

    /// Connected devices with their attributes (`host:devices-l`).
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let resp = self.round_trip("host:devices-l").await?;
        info::parse_device_list(&String::from_utf8_lossy(&resp))
    }

    /// Serials of connected devices (`host:devices`).
    pub async fn list_serials(&self) -> Result<Vec<String>> {
        let resp = self.round_trip("host:devices").await?;
        Ok(info::parse_serials(&String::from_utf8_lossy(&resp)))
    }

    /// Features supported by the server (`host:host-features`).
    pub async fn host_features(&self) -> Result<Features> {
        let resp = self.round_trip("host:host-features").await?;
        Ok(Features::parse(&String::from_utf8_lossy(&resp)))
    }

    /// Connects the server to a network device at `addr` (`host:connect`).
    ///
    /// Returns the server's message, e.g. `connected to 10.0.0.5:5555`.
    pub async fn connect(&self, addr: &str) -> Result<String> {
        let resp = self.round_trip(&format!("host:connect:{addr}")).await?;
        Ok(String::from_utf8_lossy(&resp).into_owned())
    }

    /// Drops a network device (`host:disconnect`).
    pub async fn disconnect(&self, addr: &str) -> Result<String> {
        let resp = self.round_trip(&format!("host:disconnect:{addr}")).await?;
        Ok(String::from_utf8_lossy(&resp).into_owned())
    }

    /// Asks the server to exit (`host:kill`).
    pub async fn kill_server(&self) -> Result<()> {
        let op = "host:kill";
        let res = async {
            let mut conn = self.dial().await?;
            conn.send_message(op.as_bytes()).await?;
            conn.read_status_timeout(op, self.config.short_timeout).await
        }
        .await;
        res.map_err(|source| Error::Host {
            op: op.into(),
            source,
        })?;
        tracing::debug!("server asked to exit");
        Ok(())
    }

    /// Sends `request` on a fresh connection and reads one response message.
    pub(crate) async fn request(&self, request: &str) -> adbx_wire::Result<Vec<u8>> {
        let mut conn = self.dial().await?;
        conn.set_read_deadline(Some(Instant::now() + self.config.short_timeout));
        let res = conn.round_trip_single_response(request.as_bytes()).await;
        tracing::debug!(request, ok = res.is_ok(), "host request");
        res
    }

    async fn round_trip(&self, request: &str) -> Result<Vec<u8>> {
        self.request(request).await.map_err(|source| Error::Host {
            op: request.to_owned(),
            source,
        })
    }

    pub(crate) async fn dial(&self) -> adbx_wire::Result<Conn<ServerStream>> {
        Ok(Conn::new(server::dial(&self.config).await?))
    }
}
