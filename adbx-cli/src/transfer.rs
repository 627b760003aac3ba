//! File transfer commands: push, pull, push-dir, pull-dir.

use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;

use adbx::{Device, PushProgress, TransferProgress, TreeSummary};
use anyhow::Result;

use crate::human_size;

/// Arguments for `adbx pull`.
#[derive(clap::Args)]
pub struct PullArgs {
    /// Show progress on stderr.
    #[arg(short = 'p', long)]
    progress: bool,

    /// Remote file.
    remote: String,

    /// Local destination; a directory, a file name or `-` for stdout.
    /// Defaults to the remote file name in the current directory.
    local: Option<PathBuf>,
}

/// Arguments for `adbx push`.
#[derive(clap::Args)]
pub struct PushArgs {
    /// Show progress on stderr.
    #[arg(short = 'p', long)]
    progress: bool,

    /// Permission bits when reading from stdin.
    #[arg(long, default_value = "644", value_parser = parse_mode)]
    mode: u32,

    /// Local file, or `-` for stdin.
    local: PathBuf,

    /// Remote destination path.
    remote: String,
}

/// Arguments for `adbx push-dir` and `adbx pull-dir`.
#[derive(clap::Args)]
pub struct TreeArgs {
    /// Print one line per finished file.
    #[arg(short = 'p', long)]
    progress: bool,

    /// Directory to copy from.
    source: String,

    /// Directory to copy into.
    dest: String,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|_| format!("invalid octal mode {s:?}"))
}

pub async fn pull(device: &Device, args: PullArgs) -> Result<()> {
    let started = Instant::now();
    let mut bar = Bar::new(args.progress, &args.remote);
    let bytes = match args.local.as_deref() {
        Some(p) if p == Path::new("-") => {
            let mut stdout = tokio::io::stdout();
            device
                .pull_to_writer(&args.remote, &mut stdout, |p| bar.update(p))
                .await?
        }
        local => {
            let target = pull_target(&args.remote, local);
            device
                .pull_file(&args.remote, &target, |p| bar.update(p))
                .await?
        }
    };
    bar.finish();
    print_stats(bytes, started);
    Ok(())
}

pub async fn push(device: &Device, args: PushArgs) -> Result<()> {
    let started = Instant::now();
    let mut bar = Bar::new(args.progress, &args.remote);
    let bytes = if args.local == Path::new("-") {
        let mut stdin = tokio::io::stdin();
        device
            .push_reader(&mut stdin, &args.remote, args.mode, None, 0, |p| bar.update(p))
            .await?
    } else {
        device
            .push_file(&args.local, &args.remote, |p| bar.update(p))
            .await?
    };
    bar.finish();
    print_stats(bytes, started);
    Ok(())
}

pub async fn push_dir(device: &Device, args: TreeArgs) -> Result<()> {
    let started = Instant::now();
    let mut reporter = Reporter::new(args.progress);
    let summary = device
        .push_dir(Path::new(&args.source), &args.dest, |p| reporter.event(&p))
        .await?;
    print_summary(summary, started);
    Ok(())
}

pub async fn pull_dir(device: &Device, args: TreeArgs) -> Result<()> {
    let started = Instant::now();
    let mut reporter = Reporter::new(args.progress);
    let summary = device
        .pull_dir(&args.source, Path::new(&args.dest), |p| reporter.event(&p))
        .await?;
    print_summary(summary, started);
    Ok(())
}

/// Resolves where a pulled file lands locally.
fn pull_target(remote: &str, local: Option<&Path>) -> PathBuf {
    let name = remote.trim_end_matches('/').rsplit('/').next().unwrap_or(remote);
    match local {
        Some(dir) if dir.is_dir() => dir.join(name),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(name),
    }
}

/// Prints a line for each file that finished or failed.
struct Reporter {
    show: bool,
    finished: usize,
}

impl Reporter {
    fn new(show: bool) -> Self {
        Self { show, finished: 0 }
    }

    fn event(&mut self, p: &PushProgress<'_>) -> ControlFlow<()> {
        if p.sent_files > self.finished {
            self.finished = p.sent_files;
            if let Some(err) = p.error {
                eprintln!("[{}/{}] {}: {err}", p.sent_files, p.total_files, p.current);
            } else if self.show {
                eprintln!("[{}/{}] {}", p.sent_files, p.total_files, p.current);
            }
        }
        ControlFlow::Continue(())
    }
}

fn print_summary(summary: TreeSummary, started: Instant) {
    eprintln!(
        "{} files, {} in {:.1}s",
        summary.files,
        human_size(summary.bytes),
        started.elapsed().as_secs_f64()
    );
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn print_stats(bytes: u64, started: Instant) {
    let elapsed = started.elapsed();
    let rate = bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    eprintln!("{}/s ({bytes} bytes in {elapsed:.3?})", human_size(rate as u64));
}

/// Single-line progress display on stderr.
struct Bar<'a> {
    enabled: bool,
    name: &'a str,
}

impl<'a> Bar<'a> {
    fn new(enabled: bool, name: &'a str) -> Self {
        Self { enabled, name }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn update(&mut self, p: TransferProgress) {
        if !self.enabled {
            return;
        }
        let rate = human_size(p.bytes_per_sec() as u64);
        let mut err = std::io::stderr().lock();
        let _ = match (p.percent(), p.eta()) {
            (Some(pct), Some(eta)) => write!(
                err,
                "\r{}: {pct:5.1}% {}/s eta {}s   ",
                self.name,
                rate,
                eta.as_secs()
            ),
            _ => write!(err, "\r{}: {} {}/s   ", self.name, human_size(p.transferred), rate),
        };
        let _ = err.flush();
    }

    fn finish(&self) {
        if self.enabled {
            eprintln!();
        }
    }
}
