//! Parsed server replies: device lists, states, features and forwards.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Connection state of a device as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceState {
    /// Not connected or not responding.
    Offline,
    /// Connected and ready (`device`).
    Online,
    /// Waiting for the user to accept the debugging key.
    Unauthorized,
    /// In the bootloader.
    Bootloader,
    /// In recovery.
    Recovery,
    /// In sideload mode.
    Sideload,
    /// The host side of a device-to-device link.
    Host,
    /// Authentication in progress.
    Authorizing,
    /// Transport is being set up.
    Connecting,
    /// The server lacks permissions to open the device.
    NoPermissions,
    /// The transport went away.
    Disconnected,
    /// Anything the server reported that is not known here.
    Invalid,
}

impl DeviceState {
    /// The server's spelling of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "device",
            Self::Unauthorized => "unauthorized",
            Self::Bootloader => "bootloader",
            Self::Recovery => "recovery",
            Self::Sideload => "sideload",
            Self::Host => "host",
            Self::Authorizing => "authorizing",
            Self::Connecting => "connecting",
            Self::NoPermissions => "no permissions",
            Self::Disconnected => "disconnected",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let state = match s.trim() {
            "offline" => Self::Offline,
            "device" => Self::Online,
            "unauthorized" => Self::Unauthorized,
            "bootloader" => Self::Bootloader,
            "recovery" => Self::Recovery,
            "sideload" => Self::Sideload,
            "host" => Self::Host,
            "authorizing" => Self::Authorizing,
            "connecting" => Self::Connecting,
            "disconnected" => Self::Disconnected,
            s if s.starts_with("no permissions") => Self::NoPermissions,
            other => {
                return Err(Error::Wire(adbx_wire::Error::Parse(format!(
                    "invalid device state {other:?}"
                ))));
            }
        };
        Ok(state)
    }
}

/// One row of `host:devices-l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Serial as known to the server (`ip:port` for network devices).
    pub serial: String,
    /// Connection state.
    pub state: DeviceState,
    /// `product:` attribute.
    pub product: String,
    /// `model:` attribute.
    pub model: String,
    /// `device:` attribute.
    pub device: String,
    /// `usb:` attribute; empty for non-USB transports.
    pub usb: String,
    /// Server-assigned transport id, 0 if not reported.
    pub transport_id: u64,
}

impl DeviceInfo {
    /// Returns `true` for devices attached over USB.
    pub fn is_usb(&self) -> bool {
        !self.usb.is_empty()
    }
}

/// Parses the body of `host:devices-l`.
///
/// Unknown attributes are ignored. States spanning several words
/// (`no permissions (…)`) are recognised by their first words.
pub(crate) fn parse_device_list(text: &str) -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut words = line.split_whitespace();
        let Some(serial) = words.next() else { continue };
        let rest: Vec<&str> = words.collect();
        let first = rest.first().copied().unwrap_or_default();

        let state = if first == "no" && rest.get(1).is_some_and(|w| w.starts_with("permissions")) {
            DeviceState::NoPermissions
        } else {
            first.parse().unwrap_or(DeviceState::Invalid)
        };

        let mut info = DeviceInfo {
            serial: serial.to_owned(),
            state,
            product: String::new(),
            model: String::new(),
            device: String::new(),
            usb: String::new(),
            transport_id: 0,
        };
        for word in rest.iter().skip(1) {
            let Some((key, value)) = word.split_once(':') else {
                continue;
            };
            match key {
                "product" => info.product = value.to_owned(),
                "model" => info.model = value.to_owned(),
                "device" => info.device = value.to_owned(),
                "usb" => info.usb = value.to_owned(),
                "transport_id" => {
                    info.transport_id = value.parse().map_err(|_| {
                        adbx_wire::Error::Parse(format!("invalid transport id in {line:?}"))
                    })?;
                }
                _ => {}
            }
        }
        devices.push(info);
    }
    Ok(devices)
}

/// Parses the body of `host:devices`: one serial per line.
pub(crate) fn parse_serials(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_owned)
        .collect()
}

/// One row of `host:list-forward`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ForwardEntry {
    /// Device the forward belongs to.
    pub serial: String,
    /// Local (host) endpoint.
    pub local: String,
    /// Remote (device) endpoint.
    pub remote: String,
}

/// Parses the body of `host:list-forward`; malformed lines are skipped.
pub(crate) fn parse_forward_list(text: &str) -> Vec<ForwardEntry> {
    text.lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some(serial), Some(local), Some(remote)) => Some(ForwardEntry {
                    serial: serial.to_owned(),
                    local: local.to_owned(),
                    remote: remote.to_owned(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Feature words advertised by a device or the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(BTreeSet<String>);

impl Features {
    /// Packetised shell with exit status.
    pub const SHELL_V2: &'static str = "shell_v2";
    /// `cmd` service.
    pub const CMD: &'static str = "cmd";
    /// `STA2` sync stat.
    pub const STAT_V2: &'static str = "stat_v2";
    /// `LIS2` sync listing.
    pub const LS_V2: &'static str = "ls_v2";
    /// Server can talk to USB devices itself.
    pub const LIBUSB: &'static str = "libusb";
    /// `push --sync`.
    pub const PUSH_SYNC: &'static str = "push_sync";
    /// APEX packages.
    pub const APEX: &'static str = "apex";
    /// The daemon creates parent directories on push.
    pub const FIXED_PUSH_MKDIR: &'static str = "fixed_push_mkdir";
    /// Android binder bridge.
    pub const ABB: &'static str = "abb";
    /// `abb_exec` service.
    pub const ABB_EXEC: &'static str = "abb_exec";
    /// `remount` is implemented as a shell command.
    pub const REMOUNT_SHELL: &'static str = "remount_shell";

    /// Parses a comma-separated feature list.
    pub fn parse(text: &str) -> Self {
        Self(
            text.trim()
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Returns `true` if `feature` is advertised.
    pub fn contains(&self, feature: &str) -> bool {
        self.0.contains(feature)
    }

    /// Iterates the features in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of advertised features.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing is advertised.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}
