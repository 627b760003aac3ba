//! Host-mode connection: framed requests, status words and read deadlines.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::codec::{self, LengthFormat};
use crate::{Error, Result};

/// A connection to the relay server in host-protocol mode.
///
/// A `Conn` is consumed when it switches to sync mode
/// ([`Conn::into_sync`](crate::SyncConn)) or shell mode
/// ([`Conn::into_shell`](crate::ShellConn)); there is no way back.
#[derive(Debug)]
pub struct Conn<S> {
    pub(crate) stream: S,
    pub(crate) deadline: Option<Instant>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Wraps a freshly dialed stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            deadline: None,
        }
    }

    /// Sets (or clears, with `None`) the deadline applied to every read.
    ///
    /// A read that hits the deadline fails with a `TimedOut` transport
    /// error and leaves the framing position unknown.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Returns the currently configured read deadline.
    pub fn read_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Sends one length-prefixed message.
    pub async fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        tracing::trace!(len = payload.len(), "send message");
        codec::send_message(&mut self.stream, payload).await
    }

    /// Reads one length-prefixed message.
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        with_deadline(self.deadline, codec::read_message(&mut self.stream)).await
    }

    /// Reads a status word for `request`.
    pub async fn read_status(&mut self, request: &str) -> Result<()> {
        with_deadline(
            self.deadline,
            codec::read_status(&mut self.stream, request, LengthFormat::Hex),
        )
        .await
    }

    /// Reads a status word under a deadline of `timeout` from now.
    ///
    /// The deadline is cleared again before returning, whatever the outcome.
    pub async fn read_status_timeout(&mut self, request: &str, timeout: Duration) -> Result<()> {
        self.set_read_deadline(Some(Instant::now() + timeout));
        let res = self.read_status(request).await;
        self.set_read_deadline(None);
        res
    }

    /// Sends `request`, reads its status and then exactly one response message.
    pub async fn round_trip_single_response(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.send_message(request).await?;
        self.read_status(&String::from_utf8_lossy(request)).await?;
        self.read_message().await
    }

    /// Reads everything until the peer closes the stream.
    pub async fn read_until_eof(&mut self) -> Result<Vec<u8>> {
        with_deadline(self.deadline, codec::read_until_eof(&mut self.stream)).await
    }

    /// Shuts down the write side and drops the connection.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Returns the raw stream, e.g. to use a forwarded port as a tunnel.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Runs `fut`, failing with a `TimedOut` transport error past `deadline`.
pub(crate) async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| {
            Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "read deadline exceeded",
            ))
        })?,
        None => fut.await,
    }
}
