//! Newline framing with a bounded line length.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One unit read from a newline-delimited stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line longer than the limit; its bytes were discarded.
    Oversized(usize),
    /// A line that is not valid UTF-8.
    InvalidUtf8,
    /// The stream ended.
    Eof,
}

/// Read the next line, buffering at most `max_len` bytes of it.
///
/// The rest of an oversized line is consumed and dropped, so memory stays
/// bounded even if the peer never sends a newline. A final line without a
/// terminator is still returned.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut len = 0usize;
    let mut seen = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !seen {
                return Ok(Frame::Eof);
            }
            break;
        }
        seen = true;

        let (content, consumed, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        len += content.len();
        if len <= max_len {
            buf.extend_from_slice(content);
        }
        reader.consume(consumed);

        if done {
            break;
        }
    }

    if len > max_len {
        return Ok(Frame::Oversized(len));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    match String::from_utf8(buf) {
        Ok(line) => Ok(Frame::Line(line)),
        Err(_) => Ok(Frame::InvalidUtf8),
    }
}
