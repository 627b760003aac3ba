//! `adbx shell`: run a command on the device.

use std::time::Duration;

use adbx::{Device, Error, ShellProtocol};
use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

/// Exit status reported when the user interrupts the command.
const INTERRUPTED: i32 = 130;

/// Arguments for `adbx shell`.
///
/// Usage: `adbx shell [OPTIONS] COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct ShellArgs {
    /// Use the v2 protocol: separate stderr and the command's exit status.
    #[arg(long)]
    v2: bool,

    /// Give up after this many seconds (0 waits forever).
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

/// Runs the command and returns the status this process should exit with.
///
/// v1 output carries no status, so a completed v1 command exits 0.
pub async fn run(device: Device, args: ShellArgs) -> Result<i32> {
    let (cmd, rest) = args.command.split_first().context("missing command")?;
    let timeout = Duration::from_secs(args.timeout);
    let mut stdout = tokio::io::stdout();

    if args.v2 {
        let mut shell = device.open_shell(ShellProtocol::V2, cmd, rest).await?;
        if !timeout.is_zero() {
            shell.set_read_deadline(Some(Instant::now() + timeout));
        }
        let mut stderr = tokio::io::stderr();
        let code = tokio::select! {
            res = shell.demux(&mut stdout, &mut stderr) => res.context("shell")?,
            _ = tokio::signal::ctrl_c() => return Ok(INTERRUPTED),
        };
        stdout.flush().await?;
        tracing::debug!(code, "remote command exited");
        return Ok(i32::from(code));
    }

    let cancel = async move {
        if timeout.is_zero() {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                () = tokio::time::sleep(timeout) => {}
            }
        }
    };
    let res = device.run_command_until(&mut stdout, cancel, cmd, rest).await;
    stdout.flush().await?;
    match res {
        Ok(_) => Ok(0),
        Err(Error::Cancelled) => Ok(INTERRUPTED),
        Err(e) => Err(e.into()),
    }
}
