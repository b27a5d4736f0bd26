use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Prefix of every response line that reports a failure.
pub const ERROR_PREFIX: &str = "error: ";

/// Reads one newline-terminated line without its line ending. `None` means
/// the peer closed the stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    line.truncate(line.trim_end_matches(LINE_ENDINGS).len());
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line and an explicit flush so streamed values are not
    // held back in a buffer.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub fn render_error(err: &Error) -> String {
    format!("{ERROR_PREFIX}{err}")
}

/// Splits a response line into a payload or the error a server reported.
pub fn parse_response(line: String) -> Result<String> {
    match line.strip_prefix(ERROR_PREFIX) {
        Some(reason) => Err(Error::Remote(reason.to_string())),
        None => Ok(line),
    }
}
