//! Requests scoped to one device.

use std::time::{Duration, SystemTime};

use adbx_wire::{Conn, DirEntry, SyncConn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::descriptor::DeviceDescriptor;
use crate::forward::ForwardSpec;
use crate::host::Adb;
use crate::info::{self, DeviceInfo, DeviceState, Features, ForwardEntry};
use crate::server::ServerStream;
use crate::{Error, Result};

/// A session with one device, selected by a [`DeviceDescriptor`].
///
/// Holds no connection of its own: every operation dials the server,
/// routes to the device and closes the connection when done. The
/// [`Adb`] handle is kept to look the device up in the server's list.
#[derive(Debug, Clone)]
pub struct Device {
    host: Adb,
    descriptor: DeviceDescriptor,
}

impl Device {
    pub(crate) fn new(host: Adb, descriptor: DeviceDescriptor) -> Self {
        Self { host, descriptor }
    }

    /// The selector this session routes with.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// The server handle this session was created from.
    pub fn host(&self) -> &Adb {
        &self.host
    }

    /// Serial as known to the server (`get-serialno`).
    pub async fn serial(&self) -> Result<String> {
        self.attribute("get-serialno").await
    }

    /// Device path such as `usb:1-1` (`get-devpath`).
    pub async fn device_path(&self) -> Result<String> {
        self.attribute("get-devpath").await
    }

    /// Features the device daemon supports.
    pub async fn features(&self) -> Result<Features> {
        Ok(Features::parse(&self.attribute("features").await?))
    }

    /// Connection state (`get-state`).
    ///
    /// A device waiting for key authorisation makes the server fail the
    /// request; that failure is reported as [`DeviceState::Unauthorized`].
    pub async fn state(&self) -> Result<DeviceState> {
        let request = self.host_request("get-state");
        match self.host.request(&request).await {
            Ok(resp) => {
                let text = String::from_utf8_lossy(&resp);
                text.parse().map_err(|_| {
                    self.wrap(
                        "get-state",
                        adbx_wire::Error::Parse(format!("invalid device state {text:?}")),
                    )
                })
            }
            Err(e) if e.server_message().is_some_and(|m| m.contains("unauthorized")) => {
                Ok(DeviceState::Unauthorized)
            }
            Err(e) => Err(self.wrap("get-state", e)),
        }
    }

    /// This device's row of the server's device list.
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        let serial = self.serial().await?;
        let devices = self.host.list_devices().await?;
        devices
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| {
                self.wrap(
                    "device-info",
                    adbx_wire::Error::DeviceNotFound(format!("device list doesn't contain serial {serial}")),
                )
            })
    }

    /// Opens a tunnel to `remote` on the device and returns the live stream.
    pub async fn forward(&self, remote: &ForwardSpec) -> Result<ServerStream> {
        let op = format!("forward({remote})");
        let res = async {
            let mut conn = self.dial_device().await?;
            let target = remote.to_string();
            conn.send_message(target.as_bytes()).await?;
            conn.read_status_timeout(&target, self.short_timeout()).await?;
            Ok::<_, adbx_wire::Error>(conn.into_inner())
        }
        .await;
        let stream = res.map_err(|e| self.wrap(&op, e))?;
        tracing::debug!(device = %self.descriptor, %remote, "tunnel open");
        Ok(stream)
    }

    /// Makes the server listen on `local` and forward connections to `remote`.
    pub async fn create_forward(
        &self,
        local: &ForwardSpec,
        remote: &ForwardSpec,
        no_rebind: bool,
    ) -> Result<()> {
        let verb = if no_rebind { "forward:norebind" } else { "forward" };
        let request = self.host_request(&format!("{verb}:{local};{remote}"));
        self.host_command(&request)
            .await
            .map_err(|e| self.wrap(&format!("forward({local} -> {remote})"), e))?;
        tracing::debug!(device = %self.descriptor, %local, %remote, "forward created");
        Ok(())
    }

    /// Forwards that belong to this device (`host:list-forward`).
    pub async fn list_forward(&self) -> Result<Vec<ForwardEntry>> {
        let serial = self.serial().await?;
        let resp = self
            .host
            .request("host:list-forward")
            .await
            .map_err(|e| self.wrap("list-forward", e))?;
        let mut list = info::parse_forward_list(&String::from_utf8_lossy(&resp));
        list.retain(|f| f.serial == serial);
        Ok(list)
    }

    /// Removes the forward listening on `local`.
    pub async fn remove_forward(&self, local: &ForwardSpec) -> Result<()> {
        let request = self.host_request(&format!("killforward:{local}"));
        self.host_command(&request)
            .await
            .map_err(|e| self.wrap(&format!("killforward({local})"), e))
    }

    /// Asks the daemon to remount system partitions read-write.
    ///
    /// Returns the daemon's output; whether the remount worked is only
    /// visible in that text.
    pub async fn remount(&self) -> Result<String> {
        let res = async {
            let mut conn = self.dial_device().await?;
            conn.send_message(b"remount:").await?;
            conn.read_status_timeout("remount", self.short_timeout()).await?;
            conn.set_read_deadline(Some(Instant::now() + self.long_timeout()));
            conn.read_until_eof().await
        }
        .await;
        let out = res.map_err(|e| self.wrap("remount", e))?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Opens a new connection in sync mode.
    pub async fn sync_session(&self) -> Result<SyncConn<ServerStream>> {
        self.open_sync().await.map_err(|e| self.wrap("sync", e))
    }

    /// Stats a remote path.
    ///
    /// Uses `STA2` when the device advertises `stat_v2`, so sizes past
    /// 4 GiB are reported in full.
    pub async fn stat(&self, path: &str) -> Result<DirEntry> {
        let res = async {
            let records = self.meta_records().await?;
            let mut sync = self.open_sync().await?;
            let entry = records.stat(&mut sync, path).await?;
            sync.quit().await?;
            Ok::<_, adbx_wire::Error>(entry)
        }
        .await;
        res.map_err(|e| self.wrap(&format!("stat({path})"), e))
    }

    /// Lists a remote directory, including `.` and `..`.
    ///
    /// Uses `LIS2` when the device advertises `ls_v2`.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let res = async {
            let records = self.meta_records().await?;
            let mut sync = self.open_sync().await?;
            let entries = records.list(&mut sync, path).await?;
            sync.quit().await?;
            Ok::<_, adbx_wire::Error>(entries)
        }
        .await;
        res.map_err(|e| self.wrap(&format!("list({path})"), e))
    }

    /// Reads a whole remote file into memory.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let res = async {
            let mut sync = self.open_sync().await?;
            let data = sync.recv(path).await?.read_to_end().await?;
            sync.quit().await?;
            Ok::<_, adbx_wire::Error>(data)
        }
        .await;
        res.map_err(|e| self.wrap(&format!("read({path})"), e))
    }

    /// Writes `data` to a remote file, creating or truncating it.
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: u32,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let res = async {
            let mut sync = self.open_sync().await?;
            let mut writer = sync.send(path, mode, mtime).await?;
            writer.write(data).await?;
            writer.close().await?;
            sync.quit().await
        }
        .await;
        res.map_err(|e| self.wrap(&format!("write({path})"), e))
    }

    /// Dials the server and switches the connection to this device.
    pub(crate) async fn dial_device(&self) -> adbx_wire::Result<Conn<ServerStream>> {
        let mut conn = self.host.dial().await?;
        let request = format!("host:{}", self.descriptor.transport());
        conn.send_message(request.as_bytes()).await?;
        conn.read_status_timeout(&request, self.short_timeout()).await?;
        tracing::trace!(device = %self.descriptor, "transport selected");
        Ok(conn)
    }

    pub(crate) async fn open_sync(&self) -> adbx_wire::Result<SyncConn<ServerStream>> {
        self.dial_device().await?.into_sync(self.short_timeout()).await
    }

    /// Asks the device which stat and listing records it understands.
    pub(crate) async fn meta_records(&self) -> adbx_wire::Result<MetaRecords> {
        let resp = self.host.request(&self.host_request("features")).await?;
        let records = MetaRecords::from_features(&Features::parse(&String::from_utf8_lossy(&resp)));
        tracing::trace!(device = %self.descriptor, ?records, "metadata records");
        Ok(records)
    }

    /// Attaches operation and device context to a protocol error.
    pub(crate) fn wrap(&self, op: &str, source: adbx_wire::Error) -> Error {
        Error::Device {
            op: op.to_owned(),
            device: self.descriptor.to_string(),
            source,
        }
    }

    pub(crate) fn short_timeout(&self) -> Duration {
        self.host.config().short_timeout
    }

    pub(crate) fn long_timeout(&self) -> Duration {
        self.host.config().long_timeout
    }

    async fn attribute(&self, attr: &str) -> Result<String> {
        let resp = self
            .host
            .request(&self.host_request(attr))
            .await
            .map_err(|e| self.wrap(attr, e))?;
        Ok(String::from_utf8_lossy(&resp).into_owned())
    }

    /// Sends a host request that is answered by a status only.
    async fn host_command(&self, request: &str) -> adbx_wire::Result<()> {
        let mut conn = self.host.dial().await?;
        conn.send_message(request.as_bytes()).await?;
        conn.read_status_timeout(request, self.short_timeout()).await
    }

    fn host_request(&self, request: &str) -> String {
        format!("{}:{request}", self.descriptor.host_prefix())
    }
}

/// Stat and listing record versions a device understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MetaRecords {
    stat_v2: bool,
    ls_v2: bool,
}

impl MetaRecords {
    pub(crate) fn from_features(features: &Features) -> Self {
        Self {
            stat_v2: features.contains(Features::STAT_V2),
            ls_v2: features.contains(Features::LS_V2),
        }
    }

    pub(crate) async fn stat<S>(self, sync: &mut SyncConn<S>, path: &str) -> adbx_wire::Result<DirEntry>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.stat_v2 {
            sync.stat_v2(path).await
        } else {
            sync.stat(path).await
        }
    }

    /// Reads the whole listing of `path`, dot entries included.
    pub(crate) async fn list<S>(self, sync: &mut SyncConn<S>, path: &str) -> adbx_wire::Result<Vec<DirEntry>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.ls_v2 {
            sync.list_v2(path).await?.collect().await
        } else {
            sync.list(path).await?.collect().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_follow_advertised_features() {
        let both = MetaRecords::from_features(&Features::parse("shell_v2,stat_v2,ls_v2"));
        assert_eq!(both, MetaRecords { stat_v2: true, ls_v2: true });

        let old = MetaRecords::from_features(&Features::parse("shell_v2,cmd"));
        assert_eq!(old, MetaRecords::default());
    }
}
