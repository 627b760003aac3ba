//! CLI for the Android debug bridge client.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod shell;
mod transfer;

use std::path::PathBuf;

use adbx::{Adb, Device, DeviceDescriptor, ForwardSpec, ServerConfig};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adbx", version, about = "Android debug bridge client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

/// Server and device selection shared by every subcommand.
#[derive(clap::Args)]
pub(crate) struct GlobalArgs {
    /// Server host name.
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Server port.
    #[arg(short = 'P', long, global = true)]
    port: Option<u16>,

    /// JSON server configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the device with this serial (default: $ANDROID_SERIAL).
    #[arg(short = 's', long, global = true, conflicts_with_all = ["usb", "emulator", "transport_id"])]
    serial: Option<String>,

    /// Use the only USB device.
    #[arg(short = 'd', long, global = true, conflicts_with_all = ["emulator", "transport_id"])]
    usb: bool,

    /// Use the only emulator or TCP/IP device.
    #[arg(short = 'e', long, global = true, conflicts_with = "transport_id")]
    emulator: bool,

    /// Use the device with this transport id.
    #[arg(short = 't', long, global = true)]
    transport_id: Option<u64>,

    /// Log protocol activity to stderr.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List connected devices.
    Devices {
        /// Include product, model and transport id.
        #[arg(short = 'l', long)]
        long: bool,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print the server protocol version.
    Version,

    /// Print the features of the device and the server.
    Features {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Connect the server to a device over TCP/IP.
    Connect {
        /// Address, e.g. 10.0.0.5:5555.
        addr: String,
    },

    /// Disconnect a TCP/IP device.
    Disconnect {
        /// Address, e.g. 10.0.0.5:5555.
        addr: String,
    },

    /// Ask the server to exit.
    KillServer,

    /// Print the state of the selected device.
    GetState,

    /// Run a command on the device.
    Shell(shell::ShellArgs),

    /// Show metadata of a remote path.
    Stat {
        /// Remote path.
        path: String,
    },

    /// List a remote directory.
    Ls {
        /// Remote directory.
        path: String,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Copy a remote file to this machine.
    Pull(transfer::PullArgs),

    /// Copy a local file to the device.
    Push(transfer::PushArgs),

    /// Copy a local directory tree to the device.
    PushDir(transfer::TreeArgs),

    /// Copy a remote directory tree to this machine.
    PullDir(transfer::TreeArgs),

    /// Create remote directories; existing ones are left alone.
    Mkdir {
        /// Remote paths, parents first.
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
    },

    /// Manage port forwards.
    Forward(ForwardArgs),

    /// Remount system partitions read-write.
    Remount,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Arguments for `adbx forward`.
#[derive(clap::Args)]
struct ForwardArgs {
    /// List forwards of the selected device.
    #[arg(long, conflicts_with_all = ["remove", "local", "remote"])]
    list: bool,

    /// Remove the forward listening on LOCAL.
    #[arg(long, value_name = "LOCAL", conflicts_with = "remote")]
    remove: Option<ForwardSpec>,

    /// Fail if LOCAL is already forwarded.
    #[arg(long)]
    no_rebind: bool,

    /// Local endpoint, e.g. tcp:8080.
    #[arg(required_unless_present_any = ["list", "remove"])]
    local: Option<ForwardSpec>,

    /// Remote endpoint, e.g. localabstract:chrome_devtools_remote.
    #[arg(required_unless_present_any = ["list", "remove"])]
    remote: Option<ForwardSpec>,
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    match cli.dispatch().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("adbx: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr, filtered by `ADBX_LOG`.
fn init_logging(verbose: bool) {
    let default = if verbose { "adbx=debug,adbx_wire=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("ADBX_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

impl GlobalArgs {
    fn adb(&self) -> Result<Adb> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::from_env()?,
        };
        if let Some(host) = &self.host {
            config = config.with_host(host.clone());
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        tracing::debug!(address = %config.address, "server");
        Ok(Adb::new(config))
    }

    fn descriptor(&self) -> DeviceDescriptor {
        if let Some(serial) = &self.serial {
            DeviceDescriptor::Serial(serial.clone())
        } else if self.usb {
            DeviceDescriptor::Usb
        } else if self.emulator {
            DeviceDescriptor::Local
        } else if let Some(id) = self.transport_id {
            DeviceDescriptor::TransportId(id)
        } else if let Ok(serial) = std::env::var("ANDROID_SERIAL") {
            DeviceDescriptor::Serial(serial)
        } else {
            DeviceDescriptor::Any
        }
    }

    pub(crate) fn device(&self) -> Result<Device> {
        Ok(self.adb()?.device(self.descriptor()))
    }
}

impl Cli {
    async fn dispatch(self) -> Result<i32> {
        let g = &self.global;
        match self.command {
            Command::Devices { long, format } => devices(&g.adb()?, long, format).await?,
            Command::Version => {
                let version = g.adb()?.server_version().await?;
                println!("Android Debug Bridge protocol version {version} ({version:#x})");
            }
            Command::Features { format } => features(g, format).await?,
            Command::Connect { addr } => println!("{}", g.adb()?.connect(&addr).await?),
            Command::Disconnect { addr } => println!("{}", g.adb()?.disconnect(&addr).await?),
            Command::KillServer => g.adb()?.kill_server().await?,
            Command::GetState => println!("{}", g.device()?.state().await?),
            Command::Shell(args) => return shell::run(g.device()?, args).await,
            Command::Stat { path } => stat(&g.device()?, &path).await?,
            Command::Ls { path, format } => ls(&g.device()?, &path, format).await?,
            Command::Pull(args) => transfer::pull(&g.device()?, args).await?,
            Command::Push(args) => transfer::push(&g.device()?, args).await?,
            Command::PushDir(args) => transfer::push_dir(&g.device()?, args).await?,
            Command::PullDir(args) => transfer::pull_dir(&g.device()?, args).await?,
            Command::Mkdir { paths } => g.device()?.mkdirs(&paths).await?,
            Command::Forward(args) => forward(&g.device()?, args).await?,
            Command::Remount => print!("{}", g.device()?.remount().await?),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "adbx", &mut std::io::stdout());
            }
        }
        Ok(0)
    }
}

async fn devices(adb: &Adb, long: bool, format: OutputFormat) -> Result<()> {
    let list = adb.list_devices().await?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No devices.");
        return Ok(());
    }
    for d in &list {
        if long {
            println!(
                "{:<24} {:<14} product:{} model:{} device:{} transport_id:{}",
                d.serial,
                d.state.as_str(),
                d.product,
                d.model,
                d.device,
                d.transport_id
            );
        } else {
            println!("{}\t{}", d.serial, d.state);
        }
    }
    Ok(())
}

async fn features(g: &GlobalArgs, format: OutputFormat) -> Result<()> {
    let device = g.device()?.features().await.context("device features")?;
    let host = g.adb()?.host_features().await.context("server features")?;

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({ "device": device, "host": host });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    println!("device: {device}");
    println!("host:   {host}");
    Ok(())
}

async fn stat(device: &Device, path: &str) -> Result<()> {
    let entry = device.stat(path).await?;
    println!("{path}");
    println!("  mode:  {:o}", entry.mode);
    println!("  size:  {} ({})", entry.size, human_size(entry.size));
    println!("  mtime: {}", unix_secs(entry.mtime));
    Ok(())
}

async fn ls(device: &Device, path: &str, format: OutputFormat) -> Result<()> {
    let mut entries = device.list_dir(path).await?;
    entries.retain(|e| !e.is_dot());
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    if matches!(format, OutputFormat::Json) {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "mode": e.mode,
                    "size": e.size,
                    "mtime": unix_secs(e.mtime),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for e in &entries {
        let kind = if e.is_dir() {
            'd'
        } else if e.is_symlink() {
            'l'
        } else {
            '-'
        };
        println!(
            "{kind}{:04o} {:>10} {:>12} {}",
            e.permissions(),
            human_size(e.size),
            unix_secs(e.mtime),
            e.name
        );
    }
    Ok(())
}

async fn forward(device: &Device, args: ForwardArgs) -> Result<()> {
    if args.list {
        for f in device.list_forward().await? {
            println!("{} {} {}", f.serial, f.local, f.remote);
        }
        return Ok(());
    }
    if let Some(local) = args.remove {
        return Ok(device.remove_forward(&local).await?);
    }
    let (Some(local), Some(remote)) = (args.local, args.remote) else {
        anyhow::bail!("forward needs LOCAL and REMOTE");
    };
    device.create_forward(&local, &remote, args.no_rebind).await?;
    Ok(())
}

fn unix_secs(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Formats a byte count with binary units, e.g. `1.5 MiB`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
