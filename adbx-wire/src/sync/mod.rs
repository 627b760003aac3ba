//! File sync sub-protocol: stat, list, push and pull over a `sync:` connection.
//!
//! Every request is `[4-byte id][u32 LE length][path]`. Replies are
//! id-tagged records with little-endian integers. A session carries one
//! operation at a time; a listing or transfer must reach its `DONE` marker
//! before the next request is issued.

mod dir;
mod entry;
mod file;

use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

pub use dir::DirReader;
pub use entry::DirEntry;
pub use file::{FileReader, FileWriter};

use crate::codec::{self, LengthFormat};
use crate::consts::{SYNC_MAX_PATH, sync_id};
use crate::conn::with_deadline;
use crate::{Conn, Error, Result};

/// `errno` value the daemon reports for a missing path.
const ENOENT: u32 = 2;

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Switches this connection to sync mode.
    ///
    /// Sends `sync:` and waits up to `timeout` for the status. The host
    /// connection is consumed either way.
    pub async fn into_sync(mut self, timeout: Duration) -> Result<SyncConn<S>> {
        self.send_message(b"sync:").await?;
        self.read_status_timeout("sync", timeout).await?;
        tracing::debug!("connection switched to sync mode");
        Ok(SyncConn {
            conn: self,
            poisoned: false,
        })
    }
}

/// A connection in sync mode.
///
/// Operations borrow the session mutably, so only one can be in flight.
/// A listing or transfer abandoned before its terminal marker, or any
/// transport failure, leaves the session unusable: later calls fail with
/// [`Error::Assertion`] and the caller has to open a new session.
#[derive(Debug)]
pub struct SyncConn<S> {
    conn: Conn<S>,
    poisoned: bool,
}

/// Which record layout a listing uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    V1,
    V2,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SyncConn<S> {
    /// Returns `false` once an operation has left the session mid-stream.
    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    /// Sets (or clears) the deadline applied to every read.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.conn.set_read_deadline(deadline);
    }

    /// Stats `path` with the v1 record (32-bit size and mtime).
    ///
    /// Fails with [`Error::FileNoExist`] when the daemon reports no entry.
    pub async fn stat(&mut self, path: &str) -> Result<DirEntry> {
        self.check_usable()?;
        let res = self.stat_v1_inner(path).await;
        self.track(res)
    }

    /// Stats `path` with the v2 record (64-bit size, errno reporting).
    ///
    /// Requires the `stat_v2` device feature.
    pub async fn stat_v2(&mut self, path: &str) -> Result<DirEntry> {
        self.check_usable()?;
        let res = self.stat_v2_inner(path).await;
        self.track(res)
    }

    /// Starts listing the directory at `path` with v1 records.
    pub async fn list(&mut self, path: &str) -> Result<DirReader<'_, S>> {
        self.open_list(sync_id::LIST, path, Layout::V1).await
    }

    /// Starts listing the directory at `path` with v2 records.
    ///
    /// Requires the `ls_v2` device feature.
    pub async fn list_v2(&mut self, path: &str) -> Result<DirReader<'_, S>> {
        self.open_list(sync_id::LIST_V2, path, Layout::V2).await
    }

    /// Starts pushing a file to `path`.
    ///
    /// `mode` may be bare permission bits; the regular-file type is added.
    /// `mtime` is sent when the writer is closed; `None` means "the time
    /// of the close call".
    pub async fn send(
        &mut self,
        path: &str,
        mode: u32,
        mtime: Option<SystemTime>,
    ) -> Result<FileWriter<'_, S>> {
        self.check_usable()?;
        let target = format!("{path},{}", entry::regular_file_mode(mode));
        let res = self.send_request(sync_id::SEND, &target).await;
        self.track(res)?;
        tracing::debug!(path, mode, "sync send");
        Ok(FileWriter::new(self, path.to_owned(), mtime))
    }

    /// Starts pulling the file at `path`.
    pub async fn recv(&mut self, path: &str) -> Result<FileReader<'_, S>> {
        self.check_usable()?;
        let res = self.send_request(sync_id::RECV, path).await;
        self.track(res)?;
        tracing::debug!(path, "sync recv");
        Ok(FileReader::new(self, path.to_owned()))
    }

    /// Tells the daemon the session is over and closes the connection.
    pub async fn quit(mut self) -> Result<()> {
        if self.is_usable() {
            let mut frame = Vec::with_capacity(8);
            frame.extend_from_slice(&sync_id::QUIT);
            frame.extend_from_slice(&0u32.to_le_bytes());
            self.conn.stream.write_all(&frame).await?;
            self.conn.stream.flush().await?;
        }
        self.conn.close().await
    }

    async fn open_list(
        &mut self,
        id: [u8; 4],
        path: &str,
        layout: Layout,
    ) -> Result<DirReader<'_, S>> {
        self.check_usable()?;
        let res = self.send_request(id, path).await;
        self.track(res)?;
        tracing::debug!(path, ?layout, "sync list");
        Ok(DirReader::new(self, layout))
    }

    async fn stat_v1_inner(&mut self, path: &str) -> Result<DirEntry> {
        self.send_request(sync_id::STAT, path).await?;
        self.expect_id(sync_id::STAT).await?;
        let mut body = [0u8; 12];
        self.read_exact(&mut body, "stat record").await?;
        if body == [0u8; 12] {
            return Err(Error::FileNoExist(path.to_owned()));
        }
        Ok(entry::parse_v1(path.to_owned(), &body))
    }

    async fn stat_v2_inner(&mut self, path: &str) -> Result<DirEntry> {
        self.send_request(sync_id::STAT_V2, path).await?;
        self.expect_id(sync_id::STAT_V2).await?;
        let mut body = [0u8; entry::V2_BODY_LEN];
        self.read_exact(&mut body, "stat record").await?;
        let st = entry::parse_v2(&body);
        match st.error {
            0 => Ok(st.into_entry(path.to_owned())),
            ENOENT => Err(Error::FileNoExist(path.to_owned())),
            errno => Err(Error::Server {
                request: format!("STA2 {path}"),
                message: format!("stat failed with errno {errno}"),
            }),
        }
    }

    /// Writes `[id][len][path]` in one go.
    pub(crate) async fn send_request(&mut self, id: [u8; 4], path: &str) -> Result<()> {
        if path.len() > SYNC_MAX_PATH {
            return Err(Error::Assertion(format!(
                "path of {} bytes exceeds the {SYNC_MAX_PATH} byte sync limit",
                path.len()
            )));
        }
        let mut frame = Vec::with_capacity(8 + path.len());
        frame.extend_from_slice(&id);
        frame.extend_from_slice(&(path.len() as u32).to_le_bytes());
        frame.extend_from_slice(path.as_bytes());
        self.write_frame(&frame).await
    }

    pub(crate) async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.conn.stream.write_all(frame).await?;
        self.conn.stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn read_id(&mut self) -> Result<[u8; 4]> {
        with_deadline(
            self.conn.deadline,
            codec::read_word(&mut self.conn.stream, "sync id"),
        )
        .await
    }

    pub(crate) async fn read_u32(&mut self, stage: &'static str) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, stage).await?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8], stage: &'static str) -> Result<()> {
        with_deadline(
            self.conn.deadline,
            codec::read_exact_or(&mut self.conn.stream, buf, stage),
        )
        .await
    }

    /// Reads the message that follows a `FAIL` id and turns it into an error.
    pub(crate) async fn read_failure(&mut self, request: String) -> Result<Error> {
        let msg = with_deadline(
            self.conn.deadline,
            codec::read_message_with(&mut self.conn.stream, LengthFormat::Le32),
        )
        .await
        .map_err(|e| Error::ServerMessageUnreadable {
            request: request.clone(),
            source: Box::new(e),
        })?;
        Ok(Error::Server {
            request,
            message: String::from_utf8_lossy(&msg).into_owned(),
        })
    }

    async fn expect_id(&mut self, want: [u8; 4]) -> Result<()> {
        let got = self.read_id().await?;
        if got != want {
            return Err(unexpected_id(got, &want));
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Assertion(
                "sync session is unusable after an unfinished or failed operation; open a new one"
                    .into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Marks the session unusable if `res` left the stream mid-record.
    fn track<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res
            && !matches!(
                e,
                Error::FileNoExist(_) | Error::Assertion(_) | Error::Server { .. }
            )
        {
            self.poisoned = true;
        }
        res
    }
}

pub(crate) fn unexpected_id(got: [u8; 4], want: &[u8]) -> Error {
    Error::ProtocolViolation(format!(
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(want),
        String::from_utf8_lossy(&got)
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    /// Builds a sync session whose peer has already sent `script` and closed
    /// its write side. Returns the session and the peer end for inspecting
    /// what the client wrote.
    pub(crate) async fn scripted(script: &[u8]) -> (SyncConn<DuplexStream>, DuplexStream) {
        let (client, mut server) = duplex(4 << 20);
        server.write_all(script).await.unwrap();
        server.shutdown().await.unwrap();
        let sync = SyncConn {
            conn: Conn::new(client),
            poisoned: false,
        };
        (sync, server)
    }

    pub(crate) async fn sent_by_client(sync: SyncConn<DuplexStream>, mut server: DuplexStream) -> Vec<u8> {
        drop(sync);
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        sent
    }

    pub(crate) fn request(id: &[u8; 4], path: &str) -> Vec<u8> {
        let mut v = id.to_vec();
        v.extend_from_slice(&(path.len() as u32).to_le_bytes());
        v.extend_from_slice(path.as_bytes());
        v
    }

    fn stat_reply(mode: u32, size: u32, mtime: u32) -> Vec<u8> {
        let mut v = b"STAT".to_vec();
        for n in [mode, size, mtime] {
            v.extend_from_slice(&n.to_le_bytes());
        }
        v
    }

    #[tokio::test]
    async fn switches_to_sync_mode() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"OKAY").await.unwrap();
        let sync = Conn::new(client)
            .into_sync(Duration::from_secs(1))
            .await
            .unwrap();
        let sent = sent_by_client(sync, server).await;
        assert_eq!(sent, b"0005sync:");
    }

    #[tokio::test]
    async fn stat_decodes_record() {
        let (mut sync, server) = scripted(&stat_reply(0o100_644, 42, 1_600_000_000)).await;
        let e = sync.stat("/sdcard/a.txt").await.unwrap();
        assert!(e.is_file());
        assert_eq!(e.size, 42);
        assert_eq!(e.name, "/sdcard/a.txt");
        assert_eq!(entry::to_unix_u32(e.mtime), 1_600_000_000);
        assert_eq!(
            sent_by_client(sync, server).await,
            request(b"STAT", "/sdcard/a.txt")
        );
    }

    #[tokio::test]
    async fn stat_of_missing_path_is_file_no_exist() {
        let mut script = stat_reply(0, 0, 0);
        script.extend(stat_reply(0o040_755, 4096, 1));
        let (mut sync, _server) = scripted(&script).await;
        let err = sync.stat("/nope").await.unwrap_err();
        assert!(err.is_file_not_exist());
        assert!(sync.is_usable());
        assert!(sync.stat("/data").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn stat_v2_reports_enoent() {
        let mut script = b"STA2".to_vec();
        let mut body = [0u8; entry::V2_BODY_LEN];
        body[0..4].copy_from_slice(&ENOENT.to_le_bytes());
        script.extend_from_slice(&body);
        let (mut sync, _server) = scripted(&script).await;
        assert!(sync.stat_v2("/nope").await.unwrap_err().is_file_not_exist());
    }

    #[tokio::test]
    async fn truncated_stat_poisons_session() {
        let (mut sync, _server) = scripted(b"STAT\x01\x02").await;
        let err = sync.stat("/x").await.unwrap_err();
        assert!(matches!(err, Error::IncompleteMessage { .. }));
        assert!(!sync.is_usable());
        assert!(matches!(
            sync.stat("/x").await.unwrap_err(),
            Error::Assertion(_)
        ));
    }

    #[tokio::test]
    async fn rejects_overlong_path_without_sending() {
        let (mut sync, server) = scripted(b"").await;
        let long = "a".repeat(SYNC_MAX_PATH + 1);
        assert!(matches!(
            sync.stat(&long).await.unwrap_err(),
            Error::Assertion(_)
        ));
        assert!(sync.is_usable());
        assert!(sent_by_client(sync, server).await.is_empty());
    }

    #[tokio::test]
    async fn quit_sends_quit() {
        let (sync, mut server) = scripted(b"").await;
        sync.quit().await.unwrap();
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"QUIT\0\0\0\0");
    }
}
