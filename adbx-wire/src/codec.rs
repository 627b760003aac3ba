//! Host-protocol framing over any `AsyncRead`/`AsyncWrite` stream.
//!
//! Each message is `[4 lowercase hex digits length][payload]`. Status words
//! are the raw four bytes `OKAY` or `FAIL`; `FAIL` is followed by one
//! message carrying the error text.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::consts::{FAIL, MAX_MESSAGE_LEN, OKAY};
use crate::{Error, Result};

/// How the length of a failure message is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFormat {
    /// Four ASCII hex digits (host protocol).
    Hex,
    /// Four-byte little-endian integer (sync protocol).
    Le32,
}

/// Writes `payload` as one length-prefixed message.
///
/// Header and payload go out in a single write. A payload longer than
/// [`MAX_MESSAGE_LEN`] is rejected before anything is written.
pub async fn send_message<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(Error::Assertion(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_LEN} byte limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(format!("{:04x}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one length-prefixed message.
///
/// A stream that ends before any header byte yields
/// [`Error::ConnectionReset`]; one cut off inside the header or the payload
/// yields [`Error::IncompleteMessage`] with the bytes read so far.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    read_message_with(r, LengthFormat::Hex).await
}

/// Reads one message whose length uses the given encoding.
pub async fn read_message_with<R: AsyncRead + Unpin>(
    r: &mut R,
    format: LengthFormat,
) -> Result<Vec<u8>> {
    let len = read_length(r, format).await?;
    let mut payload = vec![0u8; len];
    read_exact_or(r, &mut payload, "message data").await?;
    Ok(payload)
}

/// Reads a message length in the given encoding.
pub async fn read_length<R: AsyncRead + Unpin>(r: &mut R, format: LengthFormat) -> Result<usize> {
    let buf = read_word(r, "length").await?;
    match format {
        LengthFormat::Hex => parse_hex_length(&buf),
        LengthFormat::Le32 => Ok(u32::from_le_bytes(buf) as usize),
    }
}

/// Reads a status word for `request`.
///
/// `OKAY` returns immediately without touching the stream again. `FAIL`
/// reads exactly one more message and turns it into [`Error::Server`].
pub async fn read_status<R: AsyncRead + Unpin>(
    r: &mut R,
    request: &str,
    format: LengthFormat,
) -> Result<()> {
    let mut word = [0u8; 4];
    let n = read_full(r, &mut word).await?;
    if n < word.len() {
        let source = if n == 0 {
            Error::ConnectionReset
        } else {
            Error::incomplete("status", word[..n].to_vec(), word.len())
        };
        return Err(Error::Status {
            request: request.to_owned(),
            source: Box::new(source),
        });
    }

    match word {
        OKAY => Ok(()),
        FAIL => match read_message_with(r, format).await {
            Ok(msg) => Err(Error::Server {
                request: request.to_owned(),
                message: String::from_utf8_lossy(&msg).into_owned(),
            }),
            Err(e @ (Error::ConnectionReset | Error::IncompleteMessage { .. })) => {
                Err(Error::ServerMessageUnreadable {
                    request: request.to_owned(),
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        },
        other => Err(Error::ProtocolViolation(format!(
            "unexpected status {:?} for {request}",
            String::from_utf8_lossy(&other)
        ))),
    }
}

/// Reads the remainder of the stream.
pub async fn read_until_eof<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Reads a four-byte word that starts a new unit on the stream.
///
/// Zero bytes before end-of-stream is [`Error::ConnectionReset`]; a partial
/// word is an incomplete `stage`.
pub(crate) async fn read_word<R: AsyncRead + Unpin>(r: &mut R, stage: &'static str) -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    let n = read_full(r, &mut buf).await?;
    if n == 0 {
        return Err(Error::ConnectionReset);
    }
    if n < buf.len() {
        return Err(Error::incomplete(stage, buf[..n].to_vec(), buf.len()));
    }
    Ok(buf)
}

/// Fills `buf` unless the stream ends first; returns the number of bytes read.
pub(crate) async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Fills `buf` completely, reporting a short read as incomplete `stage`.
pub(crate) async fn read_exact_or<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    stage: &'static str,
) -> Result<()> {
    let n = read_full(r, buf).await?;
    if n < buf.len() {
        return Err(Error::incomplete(stage, buf[..n].to_vec(), buf.len()));
    }
    Ok(())
}

fn parse_hex_length(buf: &[u8; 4]) -> Result<usize> {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "invalid hex length {:?}",
                String::from_utf8_lossy(buf)
            ))
        })
}
