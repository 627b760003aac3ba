//! Async client for the Android debug bridge.
//!
//! `adbx` talks to a running relay server (`adb server`, port 5037 by
//! default) and, through it, to the daemon on each attached device. It
//! covers host queries, shell commands, port forwarding and file sync,
//! including recursive directory transfers with progress reporting.
//!
//! The wire protocol itself lives in [`adbx_wire`]; this crate adds
//! server configuration, device routing and error context.
//!
//! # Quick start
//!
//! ```no_run
//! use adbx::{Adb, DeviceDescriptor, ShellProtocol};
//!
//! # async fn demo() -> adbx::Result<()> {
//! let adb = Adb::from_env()?;
//! for info in adb.list_devices().await? {
//!     println!("{} {}", info.serial, info.state);
//! }
//!
//! let device = adb.device(DeviceDescriptor::Any);
//! let out = device.run_shell(ShellProtocol::V2, "getprop", &["ro.build.version.sdk"]).await?;
//! println!("sdk {}", String::from_utf8_lossy(out.stdout()).trim());
//! # Ok(())
//! # }
//! ```

mod config;
mod descriptor;
mod device;
mod error;
mod forward;
mod host;
mod info;
mod server;
mod shell;
mod transfer;
mod tree;

pub use adbx_wire::{DirEntry, ShellConn, ShellPacket, ShellProtocol, ShellResult, SyncConn};
pub use config::{ServerAddress, ServerConfig};
pub use descriptor::DeviceDescriptor;
pub use device::Device;
pub use error::{Error, Result};
pub use forward::ForwardSpec;
pub use host::Adb;
pub use info::{DeviceInfo, DeviceState, Features, ForwardEntry};
pub use server::ServerStream;
pub use shell::prepare_command_line;
pub use transfer::TransferProgress;
pub use tree::{PlannedFile, PushPlan, PushProgress, TreeSummary};
