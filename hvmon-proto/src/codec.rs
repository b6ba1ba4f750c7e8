//! Line-delimited JSON framing over any async byte stream.
//!
//! Each frame is one JSON object terminated by `\n`.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed line length (16 MiB), excluding the newline.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Serializes `msg` into a single newline-terminated frame.
pub fn encode(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let mut buf =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encodes `msg`, writes it to `w` and flushes.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await
}

/// Reads the next non-blank line into `buf`, without its line terminator.
///
/// Returns `Ok(false)` on a clean end of stream.
pub async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    // One extra byte leaves room for the newline of a maximum-size frame.
    const LIMIT: u64 = MAX_FRAME as u64 + 1;

    loop {
        buf.clear();
        let n = (&mut *r).take(LIMIT).read_until(b'\n', buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds 16 MiB limit",
            ));
        }
        if !buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(true);
        }
    }
}

/// Reads one line from `r` and decodes it as `T`.
pub async fn recv<T, R>(r: &mut R) -> io::Result<T>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if !read_line(r, &mut buf).await? {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before a frame arrived",
        ));
    }
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
