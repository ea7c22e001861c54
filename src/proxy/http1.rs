//! HTTP/1.x wire helpers shared by the plain forward path and the MITM bridge
//!
//! Hand-rolled head parsing and body relay over buffered streams. The relay
//! forwards on-wire bytes unchanged (including chunk framing) while teeing
//! entity bytes into a `BodyCapture`.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capture::{BodyCapture, CaptureBuffer};
use crate::record::HeaderPair;

/// Upper bound on accumulated head bytes before the request is rejected.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Headers consumed by each proxy hop rather than forwarded end-to-end.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// First value of a header, case-insensitive on the name.
pub fn header_value<'a>(headers: &'a [HeaderPair], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|pair| pair.name.eq_ignore_ascii_case(name))
        .map(|pair| pair.value.as_str())
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<HeaderPair>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderPair>,
}

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Delimited by connection close (responses only).
    Close,
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

fn eof(context: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, context.to_string())
}

/// Read a request head. Returns `None` on clean EOF before the first byte
/// (the peer closed an idle connection).
pub async fn read_request_head<R>(reader: &mut R) -> io::Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if parts.next().is_none() => {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => return Err(invalid(format!("malformed request line: {:?}", line.trim()))),
    };
    let headers = read_headers(reader, line.len()).await?;
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

pub async fn read_response_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(eof("origin closed before status line"));
    }
    let trimmed = line.trim_end();
    let mut parts = trimmed.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| invalid(format!("malformed status line: {trimmed:?}")))?
        .to_string();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("malformed status code: {trimmed:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader, line.len()).await?;
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

async fn read_headers<R>(reader: &mut R, mut consumed: usize) -> io::Result<Vec<HeaderPair>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(eof("connection closed inside headers"));
        }
        consumed += line.len();
        if consumed > MAX_HEAD_BYTES {
            return Err(invalid("header section too large"));
        }
        if line == "\r\n" || line == "\n" {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed header line: {:?}", line.trim())))?;
        headers.push(HeaderPair::new(name.trim(), value.trim()));
    }
}

/// Framing of a request body: present only when declared.
pub fn request_framing(headers: &[HeaderPair]) -> io::Result<BodyFraming> {
    if let Some(te) = header_value(headers, "Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(invalid(format!("unsupported transfer encoding: {te}")));
    }
    match header_value(headers, "Content-Length") {
        Some(len) => {
            let n = len
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("bad content-length: {len:?}")))?;
            Ok(if n == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Length(n)
            })
        }
        None => Ok(BodyFraming::None),
    }
}

/// Framing of a response body, which also depends on the request method and
/// the status code.
pub fn response_framing(
    method: &str,
    status: u16,
    headers: &[HeaderPair],
) -> io::Result<BodyFraming> {
    if method.eq_ignore_ascii_case("HEAD")
        || status / 100 == 1
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::None);
    }
    if let Some(te) = header_value(headers, "Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(invalid(format!("unsupported transfer encoding: {te}")));
    }
    match header_value(headers, "Content-Length") {
        Some(len) => {
            let n = len
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("bad content-length: {len:?}")))?;
            Ok(if n == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Length(n)
            })
        }
        None => Ok(BodyFraming::Close),
    }
}

/// Relay a body from `reader` to `writer` with the given framing, teeing
/// entity bytes through `capture`. Returns the captured prefix and the
/// truncation flag. The forwarded byte sequence is exactly the on-wire one.
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    capture: BodyCapture,
) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(capture.into_parts()),
        BodyFraming::Length(n) => {
            let mut tee = CaptureBuffer::with_capture((&mut *reader).take(n), capture);
            let copied = tokio::io::copy(&mut tee, writer).await?;
            if copied < n {
                return Err(eof("body ended before declared content-length"));
            }
            writer.flush().await?;
            Ok(tee.into_parts())
        }
        BodyFraming::Close => {
            let mut tee = CaptureBuffer::with_capture(&mut *reader, capture);
            tokio::io::copy(&mut tee, writer).await?;
            writer.flush().await?;
            Ok(tee.into_parts())
        }
        BodyFraming::Chunked => relay_chunked(reader, writer, capture).await,
    }
}

async fn relay_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut capture: BodyCapture,
) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(eof("connection closed inside chunked body"));
        }
        writer.write_all(size_line.as_bytes()).await?;

        let size_field = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| invalid(format!("bad chunk size: {size_field:?}")))?;

        if size == 0 {
            // Trailer section, forwarded verbatim through the blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 {
                    return Err(eof("connection closed inside trailers"));
                }
                writer.write_all(trailer.as_bytes()).await?;
                if trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            break;
        }

        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = reader.read(&mut buf[..want]).await?;
            if got == 0 {
                return Err(eof("connection closed inside chunk data"));
            }
            capture.push(&buf[..got]);
            writer.write_all(&buf[..got]).await?;
            remaining -= got as u64;
        }

        let mut crlf = String::new();
        if reader.read_line(&mut crlf).await? == 0 {
            return Err(eof("connection closed after chunk data"));
        }
        writer.write_all(crlf.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(capture.into_parts())
}
