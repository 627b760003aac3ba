//! Chunked file content transfer: `SEND`/`RECV` bodies.

use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};

use super::entry::to_unix_u32;
use super::{SyncConn, unexpected_id};
use crate::codec::{self, LengthFormat};
use crate::conn::with_deadline;
use crate::consts::{FAIL, SYNC_MAX_CHUNK, sync_id};
use crate::{Error, Result};

/// Writer for the body of a `SEND` request.
///
/// Content written here is not durable until [`FileWriter::close`]
/// returns `Ok`: the daemon only commits the file after `DONE`.
#[derive(Debug)]
pub struct FileWriter<'a, S> {
    sync: &'a mut SyncConn<S>,
    path: String,
    mtime: Option<SystemTime>,
    written: u64,
    closed: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> FileWriter<'a, S> {
    pub(crate) fn new(sync: &'a mut SyncConn<S>, path: String, mtime: Option<SystemTime>) -> Self {
        Self {
            sync,
            path,
            mtime,
            written: 0,
            closed: false,
        }
    }

    /// Sends `buf` as one or more `DATA` chunks of at most 64 KiB.
    ///
    /// Every call maps to whole chunks; nothing is buffered across calls.
    /// An empty `buf` sends nothing.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for chunk in buf.chunks(SYNC_MAX_CHUNK) {
            let mut frame = Vec::with_capacity(8 + chunk.len());
            frame.extend_from_slice(&sync_id::DATA);
            frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame.extend_from_slice(chunk);
            if let Err(e) = self.sync.write_frame(&frame).await {
                self.sync.poison();
                return Err(e);
            }
            self.written += chunk.len() as u64;
            tracing::trace!(path = %self.path, len = chunk.len(), "sync data chunk");
        }
        Ok(buf.len())
    }

    /// Total bytes sent so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Sends `DONE` with the modification time and waits for the daemon's verdict.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        let mtime = self.mtime.unwrap_or_else(SystemTime::now);
        let res = self.finish(mtime).await;
        if res.is_err() {
            self.sync.poison();
        }
        res
    }

    async fn finish(&mut self, mtime: SystemTime) -> Result<()> {
        let mut frame = Vec::with_capacity(8);
        frame.extend_from_slice(&sync_id::DONE);
        frame.extend_from_slice(&to_unix_u32(mtime).to_le_bytes());
        self.sync.write_frame(&frame).await?;

        let request = format!("SEND {}", self.path);
        let conn = &mut self.sync.conn;
        with_deadline(
            conn.deadline,
            codec::read_status(&mut conn.stream, &request, LengthFormat::Le32),
        )
        .await?;
        // OKAY carries a length word too, always zero in practice.
        let extra = self.sync.read_u32("status length").await? as usize;
        if extra > 0 {
            let mut skip = vec![0u8; extra];
            self.sync.read_exact(&mut skip, "status message").await?;
        }
        tracing::debug!(path = %self.path, bytes = self.written, "sync send complete");
        Ok(())
    }
}

impl<S> Drop for FileWriter<'_, S> {
    fn drop(&mut self) {
        if !self.closed {
            self.sync.poisoned = true;
        }
    }
}

/// Reader for the reply to a `RECV` request.
///
/// Yields the payload of each `DATA` chunk in order and `None` once `DONE`
/// arrives. A `FAIL` before `DONE` surfaces as [`Error::Server`]; whatever
/// was read so far must be treated as incomplete.
#[derive(Debug)]
pub struct FileReader<'a, S> {
    sync: &'a mut SyncConn<S>,
    path: String,
    read: u64,
    done: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> FileReader<'a, S> {
    pub(crate) fn new(sync: &'a mut SyncConn<S>, path: String) -> Self {
        Self {
            sync,
            path,
            read: 0,
            done: false,
        }
    }

    /// Returns the next chunk of file content, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let res = self.read_chunk().await;
        match &res {
            Ok(Some(chunk)) => self.read += chunk.len() as u64,
            Ok(None) => self.done = true,
            Err(_) => {
                self.done = true;
                self.sync.poison();
            }
        }
        res
    }

    /// Reads the rest of the file into memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Total bytes received so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.sync.read_id().await? {
            sync_id::DATA => {
                let len = self.sync.read_u32("data length").await? as usize;
                if len > SYNC_MAX_CHUNK {
                    return Err(Error::ProtocolViolation(format!(
                        "data chunk of {len} bytes exceeds {SYNC_MAX_CHUNK}"
                    )));
                }
                let mut chunk = vec![0u8; len];
                self.sync.read_exact(&mut chunk, "data chunk").await?;
                tracing::trace!(path = %self.path, len, "sync data chunk");
                Ok(Some(chunk))
            }
            sync_id::DONE => {
                self.sync.read_u32("done trailer").await?;
                tracing::debug!(path = %self.path, bytes = self.read, "sync recv complete");
                Ok(None)
            }
            FAIL => {
                let err = self.sync.read_failure(format!("RECV {}", self.path)).await?;
                Err(err)
            }
            other => Err(unexpected_id(other, &sync_id::DATA)),
        }
    }
}

impl<S> Drop for FileReader<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            self.sync.poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::super::tests::{request, scripted, sent_by_client};
    use super::*;

    fn okay() -> Vec<u8> {
        let mut v = b"OKAY".to_vec();
        v.extend_from_slice(&0u32.to_le_bytes());
        v
    }

    fn fail(msg: &str) -> Vec<u8> {
        let mut v = b"FAIL".to_vec();
        v.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        v.extend_from_slice(msg.as_bytes());
        v
    }

    fn data(payload: &[u8]) -> Vec<u8> {
        let mut v = b"DATA".to_vec();
        v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn done(word: u32) -> Vec<u8> {
        let mut v = b"DONE".to_vec();
        v.extend_from_slice(&word.to_le_bytes());
        v
    }

    /// Splits the client's bytes after a `SEND` request into DATA payloads
    /// and the DONE mtime.
    fn parse_send_body(mut body: &[u8]) -> (Vec<Vec<u8>>, u32) {
        let mut chunks = Vec::new();
        loop {
            let (id, rest) = body.split_at(4);
            let word = u32::from_le_bytes(rest[..4].try_into().unwrap());
            body = &rest[4..];
            match id {
                b"DATA" => {
                    let (chunk, rest) = body.split_at(word as usize);
                    chunks.push(chunk.to_vec());
                    body = rest;
                }
                b"DONE" => {
                    assert!(body.is_empty());
                    return (chunks, word);
                }
                other => panic!("unexpected id {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn push_splits_large_writes_into_bounded_chunks() {
        let (mut sync, server) = scripted(&okay()).await;
        let payload: Vec<u8> = (0..SYNC_MAX_CHUNK * 2 + 123).map(|i| (i % 256) as u8).collect();
        let mtime = UNIX_EPOCH + Duration::from_secs(1_650_000_000);

        let mut w = sync.send("/sdcard/f.bin", 0o644, Some(mtime)).await.unwrap();
        assert_eq!(w.write(&payload).await.unwrap(), payload.len());
        assert_eq!(w.written(), payload.len() as u64);
        w.close().await.unwrap();
        assert!(sync.is_usable());

        let sent = sent_by_client(sync, server).await;
        let header = request(b"SEND", "/sdcard/f.bin,33188");
        assert_eq!(&sent[..header.len()], header.as_slice());
        let (chunks, sent_mtime) = parse_send_body(&sent[header.len()..]);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= SYNC_MAX_CHUNK));
        assert_eq!(chunks.concat(), payload);
        assert_eq!(sent_mtime, 1_650_000_000);
    }

    #[tokio::test]
    async fn exact_chunk_writes_are_not_coalesced() {
        let (mut sync, server) = scripted(&okay()).await;
        let mut w = sync.send("/f", 0o600, Some(UNIX_EPOCH)).await.unwrap();
        w.write(&[1u8; SYNC_MAX_CHUNK]).await.unwrap();
        w.write(&[2u8; 10]).await.unwrap();
        w.write(&[]).await.unwrap();
        w.close().await.unwrap();

        let sent = sent_by_client(sync, server).await;
        let header = request(b"SEND", "/f,33152");
        let (chunks, _) = parse_send_body(&sent[header.len()..]);
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, [SYNC_MAX_CHUNK, 10]);
    }

    #[tokio::test]
    async fn empty_file_is_just_done() {
        let (mut sync, server) = scripted(&okay()).await;
        let w = sync.send("/empty", 0o644, Some(UNIX_EPOCH + Duration::from_secs(7))).await.unwrap();
        w.close().await.unwrap();

        let sent = sent_by_client(sync, server).await;
        let header = request(b"SEND", "/empty,33188");
        let (chunks, mtime) = parse_send_body(&sent[header.len()..]);
        assert!(chunks.is_empty());
        assert_eq!(mtime, 7);
    }

    #[tokio::test]
    async fn unset_mtime_uses_close_time() {
        let (mut sync, server) = scripted(&okay()).await;
        let before = to_unix_u32(SystemTime::now());
        sync.send("/f", 0o644, None).await.unwrap().close().await.unwrap();
        let after = to_unix_u32(SystemTime::now());

        let sent = sent_by_client(sync, server).await;
        let header = request(b"SEND", "/f,33188");
        let (_, mtime) = parse_send_body(&sent[header.len()..]);
        assert!((before..=after).contains(&mtime));
    }

    #[tokio::test]
    async fn close_reports_server_failure() {
        let (mut sync, _server) = scripted(&fail("Read-only file system")).await;
        let mut w = sync.send("/system/x", 0o644, None).await.unwrap();
        w.write(b"abc").await.unwrap();
        let err = w.close().await.unwrap_err();
        assert_eq!(err.server_message(), Some("Read-only file system"));
        assert!(!sync.is_usable());
    }

    #[tokio::test]
    async fn close_on_dead_connection_is_an_error() {
        let (mut sync, _server) = scripted(b"").await;
        let w = sync.send("/f", 0o644, None).await.unwrap();
        assert!(w.close().await.is_err());
    }

    #[tokio::test]
    async fn unclosed_writer_poisons_session() {
        let (mut sync, _server) = scripted(&okay()).await;
        {
            let mut w = sync.send("/f", 0o644, None).await.unwrap();
            w.write(b"partial").await.unwrap();
        }
        assert!(!sync.is_usable());
    }

    #[tokio::test]
    async fn pull_yields_chunks_until_done() {
        let mut script = data(b"hello ");
        script.extend(data(b"world"));
        script.extend(done(0));
        let (mut sync, server) = scripted(&script).await;

        let mut r = sync.recv("/sdcard/h.txt").await.unwrap();
        assert_eq!(r.next_chunk().await.unwrap().unwrap(), b"hello ");
        assert_eq!(r.next_chunk().await.unwrap().unwrap(), b"world");
        assert!(r.next_chunk().await.unwrap().is_none());
        assert_eq!(r.bytes_read(), 11);
        drop(r);
        assert!(sync.is_usable());
        assert_eq!(
            sent_by_client(sync, server).await,
            request(b"RECV", "/sdcard/h.txt")
        );
    }

    #[tokio::test]
    async fn pull_of_empty_file() {
        let (mut sync, _server) = scripted(&done(0)).await;
        let content = sync.recv("/e").await.unwrap().read_to_end().await.unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn pull_failure_mid_transfer() {
        let mut script = data(b"part");
        script.extend(fail("open failed: Permission denied"));
        let (mut sync, _server) = scripted(&script).await;

        let mut r = sync.recv("/data/secret").await.unwrap();
        assert_eq!(r.next_chunk().await.unwrap().unwrap(), b"part");
        let err = r.next_chunk().await.unwrap_err();
        match err {
            Error::Server { request, message } => {
                assert_eq!(request, "RECV /data/secret");
                assert_eq!(message, "open failed: Permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        drop(r);
        assert!(!sync.is_usable());
    }

    #[tokio::test]
    async fn pull_truncated_chunk() {
        let mut script = b"DATA".to_vec();
        script.extend_from_slice(&10u32.to_le_bytes());
        script.extend_from_slice(b"short");
        let (mut sync, _server) = scripted(&script).await;
        let err = sync.recv("/f").await.unwrap().read_to_end().await.unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteMessage {
                stage: "data chunk",
                got: 5,
                want: 10,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn session_is_reusable_across_files() {
        let mut script = okay();
        script.extend(data(b"xyz"));
        script.extend(done(0));
        let (mut sync, _server) = scripted(&script).await;

        let mut w = sync.send("/a", 0o644, None).await.unwrap();
        w.write(b"xyz").await.unwrap();
        w.close().await.unwrap();
        let back = sync.recv("/a").await.unwrap().read_to_end().await.unwrap();
        assert_eq!(back, b"xyz");
    }
}
