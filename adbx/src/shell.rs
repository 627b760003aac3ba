//! Running commands on the device.

use std::future::Future;
use std::time::Duration;

use adbx_wire::consts::MAX_MESSAGE_LEN;
use adbx_wire::{ShellConn, ShellProtocol, ShellResult};
use tokio::io::AsyncWrite;
use tokio::time::Instant;

use crate::device::Device;
use crate::server::ServerStream;
use crate::{Error, Result};

/// Validates `command` and `args` and joins them into one command line.
///
/// Arguments containing whitespace are wrapped in double quotes. Double
/// quotes inside arguments cannot be expressed and are rejected.
pub fn prepare_command_line<A: AsRef<str>>(command: &str, args: &[A]) -> adbx_wire::Result<String> {
    if command.trim().is_empty() {
        return Err(adbx_wire::Error::Assertion("command cannot be empty".into()));
    }
    let mut line = command.to_owned();
    for (i, arg) in args.iter().enumerate() {
        let arg = arg.as_ref();
        if arg.contains('"') {
            return Err(adbx_wire::Error::Parse(format!(
                "arg at index {i} contains an invalid double quote: {arg}"
            )));
        }
        line.push(' ');
        if arg.contains(char::is_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    Ok(line)
}

/// The failure line for a path that cannot be passed to `mkdir`, if any.
pub(crate) fn rejected_mkdir_path(path: &str) -> Option<String> {
    prepare_command_line("mkdir", &[path])
        .is_err()
        .then(|| format!("mkdir: '{path}': contains a double quote"))
}

impl Device {
    /// Starts `command` and returns the live shell for streaming callers.
    pub async fn open_shell<A: AsRef<str>>(
        &self,
        protocol: ShellProtocol,
        command: &str,
        args: &[A],
    ) -> Result<ShellConn<ServerStream>> {
        let line = prepare_command_line(command, args).map_err(|e| self.wrap("shell", e))?;
        self.start_shell(protocol, &line)
            .await
            .map_err(|e| self.wrap(&format!("shell({line})"), e))
    }

    /// Runs a v1 command and returns its output, bounded by the short timeout.
    pub async fn run_command<A: AsRef<str>>(&self, command: &str, args: &[A]) -> Result<Vec<u8>> {
        self.run_command_timeout(self.short_timeout(), command, args)
            .await
    }

    /// Runs a v1 command and returns its output.
    ///
    /// Output is read until the device closes the stream or `timeout`
    /// elapses (a zero `timeout` waits forever). The end of the stream says
    /// nothing about how the command ended.
    pub async fn run_command_timeout<A: AsRef<str>>(
        &self,
        timeout: Duration,
        command: &str,
        args: &[A],
    ) -> Result<Vec<u8>> {
        let line = prepare_command_line(command, args).map_err(|e| self.wrap("shell", e))?;
        let res = async {
            let mut shell = self.start_shell(ShellProtocol::V1, &line).await?;
            if !timeout.is_zero() {
                shell.set_read_deadline(Some(Instant::now() + timeout));
            }
            shell.read_raw_to_end().await
        }
        .await;
        res.map_err(|e| self.wrap(&format!("shell({line})"), e))
    }

    /// Streams a v1 command's output into `out` until the stream ends or
    /// `cancel` completes, whichever comes first.
    ///
    /// On cancellation the connection is dropped and [`Error::Cancelled`]
    /// is returned; output already written stays written.
    pub async fn run_command_until<W, C, A>(
        &self,
        out: &mut W,
        cancel: C,
        command: &str,
        args: &[A],
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
        C: Future<Output = ()>,
        A: AsRef<str>,
    {
        let line = prepare_command_line(command, args).map_err(|e| self.wrap("shell", e))?;
        let mut shell = self
            .start_shell(ShellProtocol::V1, &line)
            .await
            .map_err(|e| self.wrap(&format!("shell({line})"), e))?;
        tokio::select! {
            res = shell.copy_raw(out) => res.map_err(|e| self.wrap(&format!("shell({line})"), e)),
            () = cancel => {
                tracing::debug!(command = %line, "shell cancelled");
                Err(Error::Cancelled)
            }
        }
    }

    /// Runs a command to completion and collects its result.
    ///
    /// With [`ShellProtocol::V2`] the result carries separate stderr and the
    /// exit status; with v1 only the combined output.
    pub async fn run_shell<A: AsRef<str>>(
        &self,
        protocol: ShellProtocol,
        command: &str,
        args: &[A],
    ) -> Result<ShellResult> {
        let line = prepare_command_line(command, args).map_err(|e| self.wrap("shell", e))?;
        let res = async {
            let shell = self.start_shell(protocol, &line).await?;
            shell.read_to_end().await
        }
        .await;
        res.map_err(|e| self.wrap(&format!("shell({line})"), e))
    }

    /// Creates remote directories with `mkdir`, parents first.
    ///
    /// Paths that already exist are fine. Every other failure is collected
    /// and returned as [`Error::Aggregate`] with the daemon's message for
    /// each failing path on its own line. Paths are split over as many
    /// commands as needed to fit the request size limit. A path containing
    /// a double quote is never sent and fails on its own line.
    pub async fn mkdirs<P: AsRef<str>>(&self, paths: &[P]) -> Result<()> {
        let mut failures = Vec::new();
        let mut sendable = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            match rejected_mkdir_path(path) {
                Some(line) => failures.push(line),
                None => sendable.push(path),
            }
        }
        for batch in mkdir_batches(&sendable) {
            let out = self
                .run_command_timeout(self.long_timeout(), "mkdir", &batch)
                .await?;
            failures.extend(
                String::from_utf8_lossy(&out)
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.contains("File exists"))
                    .map(str::to_owned),
            );
        }
        if failures.is_empty() {
            return Ok(());
        }
        tracing::warn!(failed = failures.len(), "mkdir failures");
        Err(Error::Aggregate(failures))
    }

    async fn start_shell(
        &self,
        protocol: ShellProtocol,
        line: &str,
    ) -> adbx_wire::Result<ShellConn<ServerStream>> {
        self.dial_device()
            .await?
            .into_shell(protocol, line, self.short_timeout())
            .await
    }
}

/// Splits `paths` into argument lists whose `shell:mkdir …` request fits
/// in one message.
fn mkdir_batches<P: AsRef<str>>(paths: &[P]) -> Vec<Vec<&str>> {
    const BASE: usize = "shell:mkdir".len();
    let mut batches = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut len = BASE;
    for path in paths {
        let path = path.as_ref();
        // Separator plus possible quotes.
        let cost = path.len() + 3;
        if !current.is_empty() && len + cost > MAX_MESSAGE_LEN {
            batches.push(std::mem::take(&mut current));
            len = BASE;
        }
        current.push(path);
        len += cost;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_arguments_with_whitespace() {
        let line = prepare_command_line("ls", &["-l", "/sdcard/My Files"]).unwrap();
        assert_eq!(line, r#"ls -l "/sdcard/My Files""#);
        assert_eq!(prepare_command_line::<&str>("id", &[]).unwrap(), "id");
    }

    #[test]
    fn rejects_blank_command() {
        assert!(matches!(
            prepare_command_line::<&str>("  ", &[]),
            Err(adbx_wire::Error::Assertion(_))
        ));
    }

    #[test]
    fn rejects_embedded_quote() {
        let err = prepare_command_line("echo", &["ok", "say \"hi\""]).unwrap_err();
        match err {
            adbx_wire::Error::Parse(msg) => assert!(msg.contains("index 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn batches_fit_one_message() {
        let paths: Vec<String> = (0..4000).map(|i| format!("/sdcard/tree/dir-{i:05}/leaf")).collect();
        let batches = mkdir_batches(&paths);
        assert!(batches.len() > 1);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), paths.len());
        for batch in &batches {
            let line = prepare_command_line("mkdir", batch).unwrap();
            assert!(format!("shell:{line}").len() <= MAX_MESSAGE_LEN);
        }
        assert_eq!(batches[0][0], paths[0]);
    }

    #[test]
    fn quoted_mkdir_paths_are_rejected() {
        assert_eq!(rejected_mkdir_path("/sdcard/My Files"), None);
        assert_eq!(
            rejected_mkdir_path("/sdcard/we\"ird").as_deref(),
            Some("mkdir: '/sdcard/we\"ird': contains a double quote")
        );
    }

    #[test]
    fn no_paths_no_batches() {
        assert!(mkdir_batches::<&str>(&[]).is_empty());
    }
}
