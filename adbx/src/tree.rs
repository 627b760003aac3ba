//! Recursive push and pull of directory trees.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use adbx_wire::{DirEntry, SyncConn};
use walkdir::WalkDir;

use crate::device::{Device, MetaRecords};
use crate::server::ServerStream;
use crate::shell::rejected_mkdir_path;
use crate::transfer::{self, LocalMeta, StepError, TransferProgress};
use crate::{Error, Result};

/// One file of a [`PushPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Source path on this machine.
    pub local: PathBuf,
    /// Destination path on the device.
    pub remote: String,
    /// Permission bits sent with the file.
    pub mode: u32,
    /// Modification time sent with the file.
    pub mtime: SystemTime,
    /// Size at planning time, used for progress only.
    pub size: u64,
}

/// Everything a directory push will do, computed before touching the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushPlan {
    /// Files in walk order.
    pub files: Vec<PlannedFile>,
    /// Remote directories to create, parents before children.
    pub dirs: Vec<String>,
}

impl PushPlan {
    /// Walks `local_root` and maps its contents under `remote_root`.
    ///
    /// `remote_root` itself is the first directory of the plan. Entries
    /// that are neither regular files nor directories are skipped.
    pub fn build(local_root: &Path, remote_root: &str) -> Result<Self> {
        let meta = std::fs::metadata(local_root).map_err(|e| Error::io(local_root, e))?;
        if !meta.is_dir() {
            return Err(Error::io(
                local_root,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let base = remote_root.trim_end_matches('/');
        let mut plan = Self {
            files: Vec::new(),
            dirs: vec![if base.is_empty() { "/".to_owned() } else { base.to_owned() }],
        };
        for entry in WalkDir::new(local_root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(local_root).to_path_buf();
                Error::io(path, e.into())
            })?;
            let rel = entry
                .path()
                .strip_prefix(local_root)
                .map_err(|_| Error::Config(format!("{} escapes the walk root", entry.path().display())))?;
            let remote = remote_join(base, rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                plan.dirs.push(remote);
            } else if file_type.is_file() {
                let meta = entry.metadata().map_err(|e| Error::io(entry.path(), e.into()))?;
                let meta = LocalMeta::of(&meta);
                plan.files.push(PlannedFile {
                    local: entry.path().to_path_buf(),
                    remote,
                    mode: meta.mode,
                    mtime: meta.mtime,
                    size: meta.size,
                });
            } else {
                tracing::warn!(path = %entry.path().display(), "skipping non-regular file");
            }
        }
        Ok(plan)
    }

    /// Total bytes of all planned files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

fn remote_join(base: &str, rel: &Path) -> String {
    let mut out = base.to_owned();
    for part in rel.components() {
        out.push('/');
        out.push_str(&part.as_os_str().to_string_lossy());
    }
    out
}

/// Progress event of a recursive transfer.
///
/// Reported after every chunk and once more when a file finishes or
/// fails; on failure `error` is set.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct PushProgress<'a> {
    /// Files in the whole transfer.
    pub total_files: usize,
    /// Files finished so far, successfully or not.
    pub sent_files: usize,
    /// Path of the file in flight, on the receiving side.
    pub current: &'a str,
    /// Completion of the current file, if its size is known.
    pub percent: Option<f64>,
    /// Throughput over the most recent chunk of the current file; the
    /// finish event repeats the last value.
    pub bytes_per_sec: f64,
    /// Why the current file failed.
    pub error: Option<&'a Error>,
}

/// Result of a finished recursive transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct TreeSummary {
    /// Files transferred.
    pub files: usize,
    /// Bytes transferred.
    pub bytes: u64,
}

/// Tracks whether the caller asked to stop.
struct Reporter<F> {
    callback: F,
    total_files: usize,
    sent_files: usize,
    /// Bytes and elapsed time at the previous chunk of the current file.
    last: (u64, Duration),
    rate: f64,
    stop: bool,
}

impl<F> Reporter<F>
where
    F: FnMut(PushProgress<'_>) -> ControlFlow<()>,
{
    fn new(callback: F, total_files: usize) -> Self {
        Self {
            callback,
            total_files,
            sent_files: 0,
            last: (0, Duration::ZERO),
            rate: 0.0,
            stop: false,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn chunk(&mut self, current: &str, p: TransferProgress) {
        let (bytes, at) = self.last;
        let secs = p.elapsed.saturating_sub(at).as_secs_f64();
        if secs > 0.0 {
            self.rate = p.transferred.saturating_sub(bytes) as f64 / secs;
        }
        self.last = (p.transferred, p.elapsed);
        self.emit(current, p.percent(), self.rate, None);
    }

    fn finished(&mut self, current: &str, error: Option<&Error>) {
        self.sent_files += 1;
        let percent = error.is_none().then_some(100.0);
        self.emit(current, percent, self.rate, error);
        self.last = (0, Duration::ZERO);
        self.rate = 0.0;
    }

    fn emit(&mut self, current: &str, percent: Option<f64>, bytes_per_sec: f64, error: Option<&Error>) {
        let event = PushProgress {
            total_files: self.total_files,
            sent_files: self.sent_files,
            current,
            percent,
            bytes_per_sec,
            error,
        };
        if (self.callback)(event).is_break() {
            self.stop = true;
        }
    }
}

impl Device {
    /// Pushes the contents of `local` into the remote directory `remote`.
    ///
    /// Remote directories are created first. Files are then sent one at a
    /// time over a single sync session; a file that fails is recorded and
    /// the push goes on with a fresh session. Failures are returned
    /// together as [`Error::Aggregate`].
    ///
    /// A directory whose name `mkdir` cannot be given (it contains a double
    /// quote) is reported as one failure, and every file below it fails
    /// without being sent; the rest of the tree is still pushed.
    ///
    /// `on_progress` returning [`ControlFlow::Break`] stops the push after
    /// the current file with [`Error::Cancelled`].
    pub async fn push_dir<F>(&self, local: &Path, remote: &str, on_progress: F) -> Result<TreeSummary>
    where
        F: FnMut(PushProgress<'_>) -> ControlFlow<()>,
    {
        let plan = PushPlan::build(local, remote)?;
        tracing::debug!(
            files = plan.files.len(),
            dirs = plan.dirs.len(),
            bytes = plan.total_bytes(),
            "push plan"
        );
        let mut failures = Vec::new();
        let mut blocked = Vec::new();
        let mut dirs = Vec::new();
        for dir in &plan.dirs {
            match rejected_mkdir_path(dir) {
                Some(line) => {
                    tracing::warn!(dir, "directory name cannot be passed to mkdir");
                    failures.push(line);
                    blocked.push(dir.as_str());
                }
                None => dirs.push(dir.as_str()),
            }
        }
        self.mkdirs(&dirs).await?;
        self.push_files(&plan.files, &blocked, failures, on_progress).await
    }

    /// Executes a prepared plan; its directories must already exist.
    pub async fn push_plan<F>(&self, plan: &PushPlan, on_progress: F) -> Result<TreeSummary>
    where
        F: FnMut(PushProgress<'_>) -> ControlFlow<()>,
    {
        self.push_files(&plan.files, &[], Vec::new(), on_progress).await
    }

    /// Sends `files` in order; files below a `blocked` directory fail
    /// without touching the device.
    async fn push_files<F>(
        &self,
        files: &[PlannedFile],
        blocked: &[&str],
        mut failures: Vec<String>,
        on_progress: F,
    ) -> Result<TreeSummary>
    where
        F: FnMut(PushProgress<'_>) -> ControlFlow<()>,
    {
        let mut report = Reporter::new(on_progress, files.len());
        let mut summary = TreeSummary::default();
        let mut session: Option<SyncConn<ServerStream>> = None;

        for file in files {
            if let Some(dir) = blocked.iter().find(|d| is_below(&file.remote, d)) {
                let err = self.wrap(
                    &format!("push({})", file.remote),
                    adbx_wire::Error::Assertion(format!("parent directory {dir} was not created")),
                );
                report.finished(&file.remote, Some(&err));
                failures.push(err.to_string());
                if report.stop {
                    close_session(session).await;
                    return Err(Error::Cancelled);
                }
                continue;
            }
            let sync = self.reusable(&mut session, &mut failures).await?;
            let res = match tokio::fs::File::open(&file.local).await {
                Ok(mut src) => {
                    transfer::send_stream(
                        sync,
                        &mut src,
                        &file.remote,
                        file.mode,
                        Some(file.mtime),
                        file.size,
                        &mut |p| report.chunk(&file.remote, p),
                    )
                    .await
                }
                Err(e) => Err(StepError::Local(e)),
            };
            match res {
                Ok(n) => {
                    summary.files += 1;
                    summary.bytes += n;
                    report.finished(&file.remote, None);
                }
                Err(e) => {
                    let err = match e {
                        StepError::Local(e) => Error::io(&file.local, e),
                        StepError::Remote(e) => self.wrap(&format!("push({})", file.remote), e),
                    };
                    tracing::warn!(remote = %file.remote, error = %err, "push failed");
                    report.finished(&file.remote, Some(&err));
                    failures.push(err.to_string());
                }
            }
            if report.stop {
                close_session(session).await;
                return Err(Error::Cancelled);
            }
        }
        close_session(session).await;
        finish(summary, failures)
    }

    /// Pulls the remote directory `remote` into the local directory `local`.
    ///
    /// The remote tree is listed first over one sync session; local
    /// directories are created as needed. Per-file failures, cancellation
    /// and progress work as in [`Device::push_dir`].
    pub async fn pull_dir<F>(&self, remote: &str, local: &Path, on_progress: F) -> Result<TreeSummary>
    where
        F: FnMut(PushProgress<'_>) -> ControlFlow<()>,
    {
        let op = format!("pull({remote})");
        let base = remote.trim_end_matches('/');
        let base = if base.is_empty() { "/" } else { base };

        let records = self.meta_records().await.map_err(|e| self.wrap(&op, e))?;
        let mut sync = self.open_sync().await.map_err(|e| self.wrap(&op, e))?;
        let root = records.stat(&mut sync, base).await.map_err(|e| self.wrap(&op, e))?;
        if !root.is_dir() {
            return Err(self.wrap(&op, adbx_wire::Error::Assertion(format!("{base} is not a directory"))));
        }
        let (dirs, files) = walk_remote(&mut sync, records, base).await.map_err(|e| self.wrap(&op, e))?;

        std::fs::create_dir_all(local).map_err(|e| Error::io(local, e))?;
        for dir in &dirs {
            let path = local_join(local, base, dir);
            std::fs::create_dir_all(&path).map_err(|e| Error::io(path, e))?;
        }

        let mut report = Reporter::new(on_progress, files.len());
        let mut summary = TreeSummary::default();
        let mut failures = Vec::new();
        let mut session = Some(sync);

        for (path, entry) in &files {
            let dst = local_join(local, base, path);
            let sync = self.reusable(&mut session, &mut failures).await?;
            let res = transfer::recv_file(sync, entry, path, &dst, &mut |p| report.chunk(path, p)).await;
            match res {
                Ok(n) => {
                    summary.files += 1;
                    summary.bytes += n;
                    report.finished(path, None);
                }
                Err(e) => {
                    let err = match e {
                        StepError::Local(e) => Error::io(&dst, e),
                        StepError::Remote(e) => self.wrap(&format!("pull({path})"), e),
                    };
                    tracing::warn!(remote = %path, error = %err, "pull failed");
                    report.finished(path, Some(&err));
                    failures.push(err.to_string());
                }
            }
            if report.stop {
                close_session(session).await;
                return Err(Error::Cancelled);
            }
        }
        close_session(session).await;
        finish(summary, failures)
    }

    /// Returns the open session, replacing it if a failed step left it unusable.
    ///
    /// A dial failure ends the transfer; earlier failures are kept.
    async fn reusable<'s>(
        &self,
        session: &'s mut Option<SyncConn<ServerStream>>,
        failures: &mut Vec<String>,
    ) -> Result<&'s mut SyncConn<ServerStream>> {
        if session.as_ref().is_some_and(|s| !s.is_usable()) {
            *session = None;
        }
        if session.is_none() {
            match self.open_sync().await {
                Ok(sync) => *session = Some(sync),
                Err(e) => {
                    let err = self.wrap("sync", e);
                    if failures.is_empty() {
                        return Err(err);
                    }
                    failures.push(err.to_string());
                    return Err(Error::Aggregate(std::mem::take(failures)));
                }
            }
        }
        session
            .as_mut()
            .ok_or_else(|| Error::Wire(adbx_wire::Error::Assertion("no sync session".into())))
    }
}

async fn close_session(session: Option<SyncConn<ServerStream>>) {
    if let Some(sync) = session {
        if let Err(e) = sync.quit().await {
            tracing::debug!(error = %e, "sync quit failed");
        }
    }
}

fn finish(summary: TreeSummary, failures: Vec<String>) -> Result<TreeSummary> {
    if failures.is_empty() {
        Ok(summary)
    } else {
        Err(Error::Aggregate(failures))
    }
}

/// Lists everything below `root`, directories before their contents.
///
/// Symlinks and special files are skipped.
async fn walk_remote<S>(
    sync: &mut SyncConn<S>,
    records: MetaRecords,
    root: &str,
) -> adbx_wire::Result<(Vec<String>, Vec<(String, DirEntry)>)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![root.to_owned()];
    while let Some(dir) = pending.pop() {
        let mut entries = records.list(sync, &dir).await?;
        entries.retain(|e| !e.is_dot());
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut subdirs = Vec::new();
        for entry in entries {
            let path = if dir == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{dir}/{}", entry.name)
            };
            if entry.is_dir() {
                dirs.push(path.clone());
                subdirs.push(path);
            } else if entry.is_file() {
                files.push((path, entry));
            } else {
                tracing::warn!(path, "skipping non-regular remote file");
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }
    Ok((dirs, files))
}

/// Returns `true` if `path` lies inside the remote directory `dir`.
fn is_below(path: &str, dir: &str) -> bool {
    dir == "/" || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Maps a remote path below `base` to its place below `local`.
fn local_join(local: &Path, base: &str, remote: &str) -> PathBuf {
    let rel = remote.strip_prefix(base).unwrap_or(remote);
    let mut out = local.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}
