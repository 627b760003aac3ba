//! Wire protocol for the adb relay server and device daemon.
//!
//! Host requests are framed as four lowercase hex digits followed by the
//! payload and answered with an `OKAY`/`FAIL` status word. A connection can
//! then be switched, once and for good, into the file [`sync`](SyncConn)
//! service or a [`shell`](ShellConn) session.
//!
//! Everything here is generic over any `AsyncRead + AsyncWrite` stream
//! (TCP, Unix socket, or an in-memory pipe in tests).

mod codec;
mod conn;
pub mod consts;
mod error;
mod shell;
mod sync;

pub use codec::{
    LengthFormat, read_length, read_message, read_message_with, read_status, read_until_eof,
    send_message,
};
pub use conn::Conn;
pub use error::{Error, Result};
pub use shell::{ShellConn, ShellPacket, ShellProtocol, ShellResult};
pub use sync::{DirEntry, DirReader, FileReader, FileWriter, SyncConn};
