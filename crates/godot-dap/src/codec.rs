//! `Content-Length`-delimited framing for DAP messages.
//!
//! The wire format is an HTTP-like header section followed by a JSON body:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```
//!
//! Header lines other than `Content-Length` are ignored. The codec keeps no
//! partial-frame state across calls: [`read_frame`] either returns one
//! complete body, `None` on a clean EOF between frames, or an error.

use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{DapError, Result};

/// Upper bound for an incoming `Content-Length`. Caps the body allocation
/// before any bytes are read, so a hostile or desynchronized peer cannot
/// force an enormous buffer.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound for a single header line.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

/// Reads one framed message body.
///
/// Returns `Ok(None)` when the stream ends cleanly before any header byte.
/// EOF in the middle of a frame, a missing/zero/non-numeric `Content-Length`,
/// and oversized headers or bodies are all [`DapError::Framing`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header_line = false;

    loop {
        let Some(line) = read_line_limited(reader, MAX_HEADER_LINE_BYTES).await? else {
            if !saw_header_line {
                return Ok(None);
            }
            return Err(DapError::Framing(
                "EOF while reading frame headers".to_string(),
            ));
        };
        saw_header_line = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                let parsed = value.parse::<usize>().map_err(|err| {
                    DapError::Framing(format!("invalid Content-Length {value:?}: {err}"))
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let Some(content_length) = content_length else {
        return Err(DapError::Framing(
            "missing Content-Length header".to_string(),
        ));
    };
    if content_length == 0 {
        return Err(DapError::Framing(
            "Content-Length must be positive".to_string(),
        ));
    }
    if content_length > MAX_MESSAGE_BYTES {
        return Err(DapError::Framing(format!(
            "Content-Length {content_length} exceeds maximum message size {MAX_MESSAGE_BYTES}"
        )));
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one framed message body and flushes it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

// Reads up to and including one `\n`, failing before the buffer can grow past
// `max_len`. `Ok(None)` means EOF before any byte of the line.
async fn read_line_limited<R>(reader: &mut R, max_len: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(DapError::Framing(format!(
                "header line exceeds maximum size ({max_len} bytes)"
            )));
        }
        buf.extend_from_slice(&available[..take]);
        Pin::new(&mut *reader).consume(take);
        if newline.is_some() {
            break;
        }
    }

    let line = String::from_utf8(buf)
        .map_err(|_| DapError::Framing("header line is not UTF-8".to_string()))?;
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_message_with_correct_content_length() {
        let body = br#"{"seq":1,"type":"request","command":"threads"}"#;

        let mut framed = Vec::new();
        write_frame(&mut framed, body).await.unwrap();

        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        assert!(framed.starts_with(header.as_bytes()));

        let mut input: &[u8] = &framed;
        let decoded = read_frame(&mut input).await.unwrap().unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn ignores_headers_other_than_content_length() {
        let body = br#"{"seq":2,"type":"request","command":"threads"}"#;
        let framed = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            std::str::from_utf8(body).unwrap()
        );
        let mut input: &[u8] = framed.as_bytes();
        let decoded = read_frame(&mut input).await.unwrap().unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn clean_eof_between_frames_returns_none() {
        let mut input: &[u8] = b"";
        assert!(read_frame(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_a_framing_error() {
        let mut input: &[u8] = b"Content-Length: 10\r\n";
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_content_length_is_a_framing_error() {
        let mut input: &[u8] = b"Content-Type: text/plain\r\n\r\n{}";
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn zero_content_length_is_a_framing_error() {
        let mut input: &[u8] = b"Content-Length: 0\r\n\r\n";
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn non_numeric_content_length_is_a_framing_error() {
        let mut input: &[u8] = b"Content-Length: lots\r\n\r\n{}";
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected_before_allocation() {
        let framed = format!("Content-Length: {}\r\n\r\n", usize::MAX);
        let mut input: &[u8] = framed.as_bytes();
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn overlong_header_lines_are_rejected() {
        let framed = format!("{}\n\n", "A".repeat(MAX_HEADER_LINE_BYTES + 1));
        let mut input: &[u8] = framed.as_bytes();
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "got {err:?}");
    }
}
