//! Device selectors and the request prefixes they map to.

use std::fmt;

/// Selects which device a request is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum DeviceDescriptor {
    /// The only connected device; fails if there are several.
    #[default]
    Any,
    /// The device with this serial.
    Serial(String),
    /// The only device attached over USB.
    Usb,
    /// The only emulator or TCP/IP device.
    Local,
    /// The device with this server-assigned transport id.
    TransportId(u64),
}

impl DeviceDescriptor {
    /// Prefix for host requests about this device (`<prefix>:<request>`).
    pub fn host_prefix(&self) -> String {
        match self {
            Self::Any => "host".into(),
            Self::Serial(serial) => format!("host-serial:{serial}"),
            Self::Usb => "host-usb".into(),
            Self::Local => "host-local".into(),
            Self::TransportId(id) => format!("host-transport-id:{id}"),
        }
    }

    /// Transport request that routes a connection to this device,
    /// sent as `host:<transport>`.
    pub fn transport(&self) -> String {
        match self {
            Self::Any => "transport-any".into(),
            Self::Serial(serial) => format!("transport:{serial}"),
            Self::Usb => "transport-usb".into(),
            Self::Local => "transport-local".into(),
            Self::TransportId(id) => format!("transport-id:{id}"),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any device"),
            Self::Serial(serial) => write!(f, "device {serial}"),
            Self::Usb => f.write_str("usb device"),
            Self::Local => f.write_str("local device"),
            Self::TransportId(id) => write!(f, "transport {id}"),
        }
    }
}
