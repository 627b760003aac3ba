//! Single-file push and pull with progress reporting.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use adbx_wire::consts::SYNC_MAX_CHUNK;
use adbx_wire::{DirEntry, SyncConn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::device::Device;
use crate::{Error, Result};

/// Progress of one file transfer, reported after every chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct TransferProgress {
    /// Bytes moved so far.
    pub transferred: u64,
    /// Expected size, 0 if unknown.
    pub total: u64,
    /// Time since the transfer started.
    pub elapsed: Duration,
}

impl TransferProgress {
    pub(crate) fn new(transferred: u64, total: u64, elapsed: Duration) -> Self {
        Self {
            transferred,
            total,
            elapsed,
        }
    }

    /// Completion in percent; `None` when the total is unknown.
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.transferred as f64 * 100.0 / self.total as f64)
    }

    /// Average throughput so far.
    #[allow(clippy::cast_precision_loss)]
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.transferred as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time left; `None` when the total or the rate is unknown.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.bytes_per_sec();
        if self.total == 0 || rate <= 0.0 {
            return None;
        }
        let left = self.total.saturating_sub(self.transferred);
        #[allow(clippy::cast_precision_loss)]
        Some(Duration::from_secs_f64(left as f64 / rate))
    }
}

/// Local file metadata sent along with a push.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalMeta {
    pub(crate) size: u64,
    pub(crate) mode: u32,
    pub(crate) mtime: SystemTime,
}

impl LocalMeta {
    pub(crate) fn of(meta: &fs::Metadata) -> Self {
        Self {
            size: meta.len(),
            mode: permissions(meta),
            mtime: meta.modified().unwrap_or_else(|_| SystemTime::now()),
        }
    }
}

#[cfg(unix)]
fn permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Where a failed step happened, so the caller can attach the right context.
#[derive(Debug)]
pub(crate) enum StepError {
    Local(io::Error),
    Remote(adbx_wire::Error),
}

impl From<adbx_wire::Error> for StepError {
    fn from(e: adbx_wire::Error) -> Self {
        Self::Remote(e)
    }
}

/// Streams `src` into `remote` over an open session.
pub(crate) async fn send_stream<S, R, F>(
    sync: &mut SyncConn<S>,
    src: &mut R,
    remote: &str,
    mode: u32,
    mtime: Option<SystemTime>,
    total: u64,
    on_chunk: &mut F,
) -> std::result::Result<u64, StepError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(TransferProgress),
{
    let started = Instant::now();
    let mut writer = sync.send(remote, mode, mtime).await?;
    let mut buf = vec![0u8; SYNC_MAX_CHUNK];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Dropping the open writer marks the session unusable.
                drop(writer);
                return Err(StepError::Local(e));
            }
        };
        writer.write(&buf[..n]).await?;
        on_chunk(TransferProgress::new(writer.written(), total, started.elapsed()));
    }
    let sent = writer.written();
    writer.close().await?;
    Ok(sent)
}

/// Streams `remote` into `dst` over an open session.
pub(crate) async fn recv_stream<S, W, F>(
    sync: &mut SyncConn<S>,
    remote: &str,
    dst: &mut W,
    total: u64,
    on_chunk: &mut F,
) -> std::result::Result<u64, StepError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(TransferProgress),
{
    let started = Instant::now();
    let mut reader = sync.recv(remote).await?;
    while let Some(chunk) = reader.next_chunk().await? {
        if let Err(e) = dst.write_all(&chunk).await {
            drop(reader);
            return Err(StepError::Local(e));
        }
        on_chunk(TransferProgress::new(reader.bytes_read(), total, started.elapsed()));
    }
    let received = reader.bytes_read();
    dst.flush().await.map_err(StepError::Local)?;
    Ok(received)
}

/// Pulls `remote` into `local` through a temporary file next to it.
///
/// The destination only appears once the daemon reported `DONE`; its
/// modification time is then set to the remote one.
pub(crate) async fn recv_file<S, F>(
    sync: &mut SyncConn<S>,
    remote: &DirEntry,
    remote_path: &str,
    local: &Path,
    on_chunk: &mut F,
) -> std::result::Result<u64, StepError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(TransferProgress),
{
    let local_err = StepError::Local;
    let dir = match local.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::Builder::new()
        .prefix(".adbx-pull-")
        .tempfile_in(dir)
        .map_err(local_err)?;
    let std_file = tmp.as_file().try_clone().map_err(local_err)?;
    let mut file = tokio::fs::File::from_std(std_file);

    let received = recv_stream(sync, remote_path, &mut file, remote.size, on_chunk).await?;
    file.sync_all().await.map_err(local_err)?;
    drop(file);

    let persisted = tmp.persist(local).map_err(|e| local_err(e.error))?;
    set_mtime(&persisted, remote.mtime).map_err(local_err)?;
    Ok(received)
}

fn set_mtime(file: &File, mtime: SystemTime) -> io::Result<()> {
    file.set_modified(mtime)
}

impl Device {
    /// Pushes a local file to `remote`, keeping its permissions and mtime.
    pub async fn push_file<F>(&self, local: &Path, remote: &str, mut on_progress: F) -> Result<u64>
    where
        F: FnMut(TransferProgress),
    {
        let meta = fs::metadata(local).map_err(|e| Error::io(local, e))?;
        if !meta.is_file() {
            return Err(Error::io(
                local,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let meta = LocalMeta::of(&meta);
        let mut src = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::io(local, e))?;
        let sent = self
            .push_stream(&mut src, remote, meta.mode, Some(meta.mtime), meta.size, &mut on_progress)
            .await
            .map_err(|e| match e {
                StepError::Local(e) => Error::io(local, e),
                StepError::Remote(e) => self.wrap(&format!("push({remote})"), e),
            })?;
        tracing::info!(local = %local.display(), remote, bytes = sent, "pushed");
        Ok(sent)
    }

    /// Pushes everything `src` yields to `remote`.
    ///
    /// `total` is only used for progress and may be 0. A `None` mtime
    /// stamps the file with the time the transfer completes.
    pub async fn push_reader<R, F>(
        &self,
        src: &mut R,
        remote: &str,
        mode: u32,
        mtime: Option<SystemTime>,
        total: u64,
        mut on_progress: F,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        F: FnMut(TransferProgress),
    {
        self.push_stream(src, remote, mode, mtime, total, &mut on_progress)
            .await
            .map_err(|e| match e {
                StepError::Local(e) => Error::io("<input>", e),
                StepError::Remote(e) => self.wrap(&format!("push({remote})"), e),
            })
    }

    /// Pulls `remote` into the local file `local`.
    ///
    /// Fails with a [`FileNoExist`](adbx_wire::Error::FileNoExist) error if
    /// the remote path is missing. Nothing is left at `local` on failure.
    pub async fn pull_file<F>(&self, remote: &str, local: &Path, mut on_progress: F) -> Result<u64>
    where
        F: FnMut(TransferProgress),
    {
        let op = format!("pull({remote})");
        let records = self.meta_records().await.map_err(|e| self.wrap(&op, e))?;
        let mut sync = self.sync_session().await?;
        let entry = records.stat(&mut sync, remote).await.map_err(|e| self.wrap(&op, e))?;
        if entry.is_dir() {
            return Err(self.wrap(
                &op,
                adbx_wire::Error::Assertion(format!("{remote} is a directory")),
            ));
        }
        let received = recv_file(&mut sync, &entry, remote, local, &mut on_progress)
            .await
            .map_err(|e| match e {
                StepError::Local(e) => Error::io(local, e),
                StepError::Remote(e) => self.wrap(&op, e),
            })?;
        sync.quit().await.map_err(|e| self.wrap(&op, e))?;
        tracing::info!(remote, local = %local.display(), bytes = received, "pulled");
        Ok(received)
    }

    /// Pulls `remote` into any writer, e.g. stdout.
    pub async fn pull_to_writer<W, F>(&self, remote: &str, dst: &mut W, mut on_progress: F) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
        F: FnMut(TransferProgress),
    {
        let op = format!("pull({remote})");
        let records = self.meta_records().await.map_err(|e| self.wrap(&op, e))?;
        let mut sync = self.sync_session().await?;
        let entry = records.stat(&mut sync, remote).await.map_err(|e| self.wrap(&op, e))?;
        let received = recv_stream(&mut sync, remote, dst, entry.size, &mut on_progress)
            .await
            .map_err(|e| match e {
                StepError::Local(e) => Error::io("<output>", e),
                StepError::Remote(e) => self.wrap(&op, e),
            })?;
        sync.quit().await.map_err(|e| self.wrap(&op, e))?;
        Ok(received)
    }

    async fn push_stream<R, F>(
        &self,
        src: &mut R,
        remote: &str,
        mode: u32,
        mtime: Option<SystemTime>,
        total: u64,
        on_progress: &mut F,
    ) -> std::result::Result<u64, StepError>
    where
        R: AsyncRead + Unpin + ?Sized,
        F: FnMut(TransferProgress),
    {
        let mut sync = self.open_sync().await?;
        let sent = send_stream(&mut sync, src, remote, mode, mtime, total, on_progress).await?;
        sync.quit().await?;
        Ok(sent)
    }
}
