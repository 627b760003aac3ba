//! Protocol constants shared by the host, sync and shell services.

/// Success status word.
pub const OKAY: [u8; 4] = *b"OKAY";
/// Failure status word; always followed by an error message.
pub const FAIL: [u8; 4] = *b"FAIL";

/// Largest payload a host-protocol message can carry (four hex digits).
pub const MAX_MESSAGE_LEN: usize = 0xFFFF;

/// Default TCP port of the relay server.
pub const DEFAULT_PORT: u16 = 5037;

/// Maximum payload of a single sync `DATA` chunk (64 KiB).
pub const SYNC_MAX_CHUNK: usize = 64 * 1024;

/// Maximum length of a path in a sync request.
pub const SYNC_MAX_PATH: usize = 1024;

/// Sync sub-protocol identifiers.
pub mod sync_id {
    /// Stat a path (v1 record).
    pub const STAT: [u8; 4] = *b"STAT";
    /// Stat a path (v2 record with 64-bit fields).
    pub const STAT_V2: [u8; 4] = *b"STA2";
    /// List a directory (v1 records).
    pub const LIST: [u8; 4] = *b"LIST";
    /// List a directory (v2 records).
    pub const LIST_V2: [u8; 4] = *b"LIS2";
    /// Directory entry in a `LIST` reply.
    pub const DENT: [u8; 4] = *b"DENT";
    /// Directory entry in a `LIS2` reply.
    pub const DENT_V2: [u8; 4] = *b"DNT2";
    /// Start pushing a file.
    pub const SEND: [u8; 4] = *b"SEND";
    /// Start pulling a file.
    pub const RECV: [u8; 4] = *b"RECV";
    /// File content chunk.
    pub const DATA: [u8; 4] = *b"DATA";
    /// End of a transfer or listing.
    pub const DONE: [u8; 4] = *b"DONE";
    /// Leave sync mode.
    pub const QUIT: [u8; 4] = *b"QUIT";
}

/// Shell v2 packet identifiers.
pub mod shell_id {
    /// Data for the remote process's stdin.
    pub const STDIN: u8 = 0;
    /// Data from the remote process's stdout.
    pub const STDOUT: u8 = 1;
    /// Data from the remote process's stderr.
    pub const STDERR: u8 = 2;
    /// Exit status; the last packet of a session.
    pub const EXIT: u8 = 3;
    /// The client closed stdin.
    pub const CLOSE_STDIN: u8 = 4;
    /// Terminal resize notification.
    pub const WINDOW_SIZE_CHANGE: u8 = 5;
}
