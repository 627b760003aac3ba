//! File metadata records returned by `STAT`/`STA2` and `LIST`/`LIS2`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

/// Metadata of one remote file system entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name for listings; the requested path for stat.
    pub name: String,
    /// POSIX mode bits, including the file type.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl DirEntry {
    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Returns `true` for regular files.
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Returns `true` for symbolic links.
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits (`mode & 0o7777`).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Returns `true` for the `.` and `..` pseudo entries of a listing.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Adds the regular-file type bits to bare permission bits.
pub(crate) fn regular_file_mode(mode: u32) -> u32 {
    if mode & S_IFMT == 0 {
        S_IFREG | (mode & 0o7777)
    } else {
        mode
    }
}

/// `v1` record body: mode, size, mtime (each u32 LE).
pub(crate) fn parse_v1(name: String, body: &[u8; 12]) -> DirEntry {
    DirEntry {
        name,
        mode: le_u32(&body[0..4]),
        size: u64::from(le_u32(&body[4..8])),
        mtime: from_unix(i64::from(le_u32(&body[8..12]))),
    }
}

/// Size of a `v2` stat body after the four-byte id.
pub(crate) const V2_BODY_LEN: usize = 68;

/// Decoded `v2` stat body; `error` is an errno value, 0 on success.
#[derive(Debug)]
pub(crate) struct StatV2 {
    pub(crate) error: u32,
    pub(crate) mode: u32,
    pub(crate) size: u64,
    pub(crate) mtime: i64,
}

/// `v2` record body: error, dev, ino, mode, nlink, uid, gid, size, atime,
/// mtime, ctime.
pub(crate) fn parse_v2(body: &[u8; V2_BODY_LEN]) -> StatV2 {
    StatV2 {
        error: le_u32(&body[0..4]),
        mode: le_u32(&body[20..24]),
        size: le_u64(&body[36..44]),
        mtime: le_u64(&body[52..60]) as i64,
    }
}

impl StatV2 {
    pub(crate) fn into_entry(self, name: String) -> DirEntry {
        DirEntry {
            name,
            mode: self.mode,
            size: self.size,
            mtime: from_unix(self.mtime),
        }
    }
}

/// Seconds since the epoch as sent in `DONE` after a push.
///
/// Times before the epoch clamp to 0, times past 2106 to `u32::MAX`.
pub(crate) fn to_unix_u32(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

fn from_unix(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}
