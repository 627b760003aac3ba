//! Remote command channel: raw `shell:` and packetised `shell,v2:`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::codec;
use crate::consts::shell_id;
use crate::conn::with_deadline;
use crate::{Conn, Error, Result};

/// Largest v2 packet payload accepted from the daemon.
const MAX_PACKET_PAYLOAD: usize = 1 << 20;

/// Which shell wire format a request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellProtocol {
    /// Raw output stream terminated by end-of-stream.
    V1,
    /// Tagged packets with separate stderr and an exit status.
    V2,
}

impl ShellProtocol {
    /// Builds the host request for `command`.
    pub fn request(self, command: &str) -> String {
        match self {
            Self::V1 => format!("shell:{command}"),
            Self::V2 => format!("shell,v2:{command}"),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Starts `command` on the device.
    ///
    /// The status is awaited for at most `timeout`; the connection is
    /// consumed and becomes a [`ShellConn`].
    pub async fn into_shell(
        mut self,
        protocol: ShellProtocol,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellConn<S>> {
        let request = protocol.request(command);
        self.send_message(request.as_bytes()).await?;
        self.read_status_timeout(&request, timeout).await?;
        tracing::debug!(?protocol, command, "shell started");
        Ok(ShellConn {
            conn: self,
            protocol,
            exit_code: None,
        })
    }
}

/// One decoded v2 shell packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellPacket {
    /// Input for the remote process.
    Stdin(Vec<u8>),
    /// Output on the remote stdout.
    Stdout(Vec<u8>),
    /// Output on the remote stderr.
    Stderr(Vec<u8>),
    /// Exit status; always the last packet of a session.
    Exit(u8),
    /// The remote stdin was closed.
    CloseStdin,
    /// Terminal size change, as the raw `rowsxcols,xpixelsxypixels` text.
    WindowSizeChange(Vec<u8>),
}

/// Outcome of a completed shell command.
///
/// v1 output carries no exit status: a normal exit, a killed process and a
/// severed transport all end the stream the same way, so none is guessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellResult {
    /// Raw combined output of a `shell:` request.
    V1 {
        /// Everything read until end-of-stream.
        output: Vec<u8>,
    },
    /// Demultiplexed output of a `shell,v2:` request.
    V2 {
        /// Concatenated stdout payloads.
        stdout: Vec<u8>,
        /// Concatenated stderr payloads.
        stderr: Vec<u8>,
        /// Exit status of the remote process.
        exit_code: u8,
    },
}

impl ShellResult {
    /// Standard output (the combined stream for v1).
    pub fn stdout(&self) -> &[u8] {
        match self {
            Self::V1 { output } => output,
            Self::V2 { stdout, .. } => stdout,
        }
    }

    /// Standard error; always empty for v1.
    pub fn stderr(&self) -> &[u8] {
        match self {
            Self::V1 { .. } => &[],
            Self::V2 { stderr, .. } => stderr,
        }
    }

    /// The exit status, known only for v2.
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            Self::V1 { .. } => None,
            Self::V2 { exit_code, .. } => Some(*exit_code),
        }
    }
}

/// A connection running a remote command.
#[derive(Debug)]
pub struct ShellConn<S> {
    conn: Conn<S>,
    protocol: ShellProtocol,
    exit_code: Option<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ShellConn<S> {
    /// The protocol this session speaks.
    pub fn protocol(&self) -> ShellProtocol {
        self.protocol
    }

    /// Sets (or clears) the deadline applied to every read.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.conn.set_read_deadline(deadline);
    }

    /// Exit status, once the exit packet has been seen.
    pub fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    /// Reads raw output until the daemon closes the stream (v1).
    pub async fn read_raw_to_end(&mut self) -> Result<Vec<u8>> {
        self.expect(ShellProtocol::V1)?;
        self.conn.read_until_eof().await
    }

    /// Streams raw output into `out` until end-of-stream (v1).
    ///
    /// Returns the number of bytes copied.
    pub async fn copy_raw<W: AsyncWrite + Unpin + ?Sized>(&mut self, out: &mut W) -> Result<u64> {
        self.expect(ShellProtocol::V1)?;
        let stream = &mut self.conn.stream;
        with_deadline(self.conn.deadline, async {
            let n = tokio::io::copy(stream, out).await?;
            out.flush().await?;
            Ok::<_, Error>(n)
        })
        .await
    }

    /// Reads the next v2 packet.
    ///
    /// Returns `None` when the stream ends after the exit packet. Anything
    /// arriving after the exit packet is [`Error::ProtocolViolation`]; the
    /// stream ending before it is a transport error.
    pub async fn next_packet(&mut self) -> Result<Option<ShellPacket>> {
        self.expect(ShellProtocol::V2)?;
        let deadline = self.conn.deadline;
        let stream = &mut self.conn.stream;

        let mut header = [0u8; 5];
        let n = with_deadline(deadline, async {
            codec::read_full(stream, &mut header).await.map_err(Error::from)
        })
        .await?;
        if n == 0 {
            return match self.exit_code {
                Some(_) => Ok(None),
                None => Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "shell stream ended before the exit status",
                ))),
            };
        }
        if let Some(code) = self.exit_code {
            return Err(Error::ProtocolViolation(format!(
                "shell packet with tag {} after exit status {code}",
                header[0]
            )));
        }
        if n < header.len() {
            return Err(Error::incomplete("shell packet header", header[..n].to_vec(), header.len()));
        }

        let tag = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_PACKET_PAYLOAD {
            return Err(Error::ProtocolViolation(format!(
                "shell packet of {len} bytes exceeds {MAX_PACKET_PAYLOAD}"
            )));
        }
        let mut payload = vec![0u8; len];
        with_deadline(
            deadline,
            codec::read_exact_or(stream, &mut payload, "shell packet payload"),
        )
        .await?;

        let packet = match tag {
            shell_id::STDIN => ShellPacket::Stdin(payload),
            shell_id::STDOUT => ShellPacket::Stdout(payload),
            shell_id::STDERR => ShellPacket::Stderr(payload),
            shell_id::EXIT => {
                let code = *payload.first().ok_or_else(|| {
                    Error::ProtocolViolation("exit packet without a status byte".into())
                })?;
                self.exit_code = Some(code);
                tracing::debug!(code, "shell exited");
                ShellPacket::Exit(code)
            }
            shell_id::CLOSE_STDIN => ShellPacket::CloseStdin,
            shell_id::WINDOW_SIZE_CHANGE => ShellPacket::WindowSizeChange(payload),
            other => {
                return Err(Error::ProtocolViolation(format!("unknown shell packet tag {other}")));
            }
        };
        tracing::trace!(tag, len, "shell packet");
        Ok(Some(packet))
    }

    /// Routes stdout and stderr packets into the two sinks until the stream
    /// ends, then returns the exit status (v2).
    pub async fn demux<O, E>(&mut self, stdout: &mut O, stderr: &mut E) -> Result<u8>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        while let Some(packet) = self.next_packet().await? {
            match packet {
                ShellPacket::Stdout(data) => stdout.write_all(&data).await?,
                ShellPacket::Stderr(data) => stderr.write_all(&data).await?,
                _ => {}
            }
        }
        stdout.flush().await?;
        stderr.flush().await?;
        self.exit_code.ok_or_else(|| {
            Error::ProtocolViolation("shell stream ended without an exit status".into())
        })
    }

    /// Sends input to the remote process (v2).
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.expect(ShellProtocol::V2)?;
        self.write_packet(shell_id::STDIN, data).await
    }

    /// Closes the remote process's stdin (v2).
    pub async fn close_stdin(&mut self) -> Result<()> {
        self.expect(ShellProtocol::V2)?;
        self.write_packet(shell_id::CLOSE_STDIN, &[]).await
    }

    /// Collects the whole command outcome in memory.
    pub async fn read_to_end(mut self) -> Result<ShellResult> {
        match self.protocol {
            ShellProtocol::V1 => Ok(ShellResult::V1 {
                output: self.read_raw_to_end().await?,
            }),
            ShellProtocol::V2 => {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                let exit_code = self.demux(&mut stdout, &mut stderr).await?;
                Ok(ShellResult::V2 {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
        }
    }

    /// Shuts down the write side and drops the connection.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }

    async fn write_packet(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.conn.stream.write_all(&frame).await?;
        self.conn.stream.flush().await?;
        Ok(())
    }

    fn expect(&self, protocol: ShellProtocol) -> Result<()> {
        if self.protocol != protocol {
            return Err(Error::Assertion(format!(
                "operation needs a {protocol:?} shell, session speaks {:?}",
                self.protocol
            )));
        }
        Ok(())
    }
}
