//! Reading worker responses
//!
//! HTTP workers are read through hyper's client connection. Session workers
//! answer on the socket that carried the request: an HTTP status line or a
//! CGI-style `Status:` header, more headers, then a body that runs to
//! Content-Length or to the end of the stream.

use crate::conn_pool::WorkerStream;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::StatusCode;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest response head accepted from a worker
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const READ_SIZE: usize = 16 * 1024;

/// Response headers that describe the worker connection, not the response
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "trailer",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum AppResponseError {
    #[error("worker socket read error: {0}")]
    Io(#[from] io::Error),
    #[error("worker connection error: {0}")]
    Http(#[from] hyper::Error),
    #[error("worker closed the connection before sending a response")]
    EmptyResponse,
    #[error("worker closed the connection in the middle of the response")]
    Truncated,
    #[error("response head exceeds 64 KiB")]
    HeadTooLarge,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("chunked transfer encoding is not accepted on session sockets")]
    ChunkedSession,
}

impl From<httparse::Error> for AppResponseError {
    fn from(e: httparse::Error) -> Self {
        AppResponseError::Malformed(e.to_string())
    }
}

/// Drop headers that only applied to the worker connection
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    UntilEof,
}

/// Parsed head of a session-protocol response
#[derive(Debug)]
pub struct SessionHead {
    pub status: StatusCode,
    /// Headers to pass on to the client, hop-by-hop headers removed
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

struct ParsedHead {
    status: StatusCode,
    headers: HeaderMap,
    consumed: usize,
}

fn status_from(code: u16) -> Result<StatusCode, AppResponseError> {
    StatusCode::from_u16(code).map_err(|_| AppResponseError::Malformed(format!("bad status {}", code)))
}

fn incomplete(data: &[u8]) -> Result<Option<ParsedHead>, AppResponseError> {
    if data.len() > MAX_HEAD_SIZE {
        return Err(AppResponseError::HeadTooLarge);
    }
    Ok(None)
}

/// Parse a complete head from the start of `data`, or None if more bytes are needed
fn parse_head(data: &[u8]) -> Result<Option<ParsedHead>, AppResponseError> {
    if data.len() < 5 && b"HTTP/".starts_with(data) {
        return Ok(None);
    }

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (line_status, consumed, fields): (Option<u16>, usize, &[httparse::Header<'_>]) =
        if data.starts_with(b"HTTP/") {
            let mut response = httparse::Response::new(&mut storage);
            match response.parse(data)? {
                httparse::Status::Complete(n) => (response.code, n, &*response.headers),
                httparse::Status::Partial => return incomplete(data),
            }
        } else {
            match httparse::parse_headers(data, &mut storage)? {
                httparse::Status::Complete((n, fields)) => (None, n, fields),
                httparse::Status::Partial => return incomplete(data),
            }
        };

    let mut status = line_status.map(status_from).transpose()?;
    let mut headers = HeaderMap::new();
    for field in fields {
        if line_status.is_none() && field.name.eq_ignore_ascii_case("status") {
            let code = std::str::from_utf8(field.value)
                .ok()
                .and_then(|v| v.split_whitespace().next())
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| AppResponseError::Malformed("bad Status header".into()))?;
            status = Some(status_from(code)?);
            continue;
        }
        let name = HeaderName::from_bytes(field.name.as_bytes())
            .map_err(|_| AppResponseError::Malformed(format!("bad header name '{}'", field.name)))?;
        let value = HeaderValue::from_bytes(field.value)
            .map_err(|_| AppResponseError::Malformed(format!("bad value for header '{}'", name)))?;
        headers.append(name, value);
    }

    Ok(Some(ParsedHead {
        status: status.unwrap_or(StatusCode::OK),
        headers,
        consumed,
    }))
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers.get_all(name).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

fn finish_head(parsed: ParsedHead, head_request: bool) -> Result<SessionHead, AppResponseError> {
    let ParsedHead {
        status, mut headers, ..
    } = parsed;

    if header_has_token(&headers, "transfer-encoding", "chunked") {
        return Err(AppResponseError::ChunkedSession);
    }
    let length = match headers.get(CONTENT_LENGTH) {
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| AppResponseError::Malformed("bad Content-Length".into()))?,
        ),
        None => None,
    };

    let no_body = head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let framing = match length {
        _ if no_body => BodyFraming::None,
        Some(length) => BodyFraming::Length(length),
        None => BodyFraming::UntilEof,
    };

    strip_hop_by_hop(&mut headers);
    if no_body && !head_request {
        headers.remove(CONTENT_LENGTH);
    }

    Ok(SessionHead {
        status,
        headers,
        framing,
    })
}

/// Read a session response head, skipping interim 1xx responses.
/// Bytes read past the head stay in `buf`.
pub async fn read_session_head<R>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    head_request: bool,
) -> Result<SessionHead, AppResponseError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(parsed) = parse_head(buf)? {
            buf.drain(..parsed.consumed);
            if parsed.status.is_informational() && parsed.status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            return finish_head(parsed, head_request);
        }

        let mut chunk = [0u8; READ_SIZE];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                AppResponseError::EmptyResponse
            } else {
                AppResponseError::Truncated
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Body of a session response, read straight off the worker socket
#[derive(Debug)]
pub struct SessionBody<R> {
    stream: R,
    framing: BodyFraming,
    remaining: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> SessionBody<R> {
    /// `buf` holds whatever was read past the head
    pub fn new(stream: R, framing: BodyFraming, buf: Vec<u8>) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        Self {
            stream,
            framing,
            remaining,
            buf,
            finished: matches!(framing, BodyFraming::None | BodyFraming::Length(0)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next piece of the body, or None once it is complete
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, AppResponseError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if !self.buf.is_empty() {
                let data = match self.framing {
                    BodyFraming::Length(_) => {
                        let take = self.remaining.min(self.buf.len() as u64) as usize;
                        self.remaining -= take as u64;
                        self.finished = self.remaining == 0;
                        let data = Bytes::copy_from_slice(&self.buf[..take]);
                        self.buf.clear();
                        data
                    }
                    _ => Bytes::from(std::mem::take(&mut self.buf)),
                };
                return Ok(Some(data));
            }

            let mut chunk = [0u8; READ_SIZE];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.framing == BodyFraming::UntilEof {
                    self.finished = true;
                    return Ok(None);
                }
                return Err(AppResponseError::Truncated);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// A worker response body in either dialect
pub enum AppBody {
    Http(Incoming),
    Session(SessionBody<WorkerStream>),
}

impl AppBody {
    /// Nothing more will be read from the worker
    pub fn is_end_stream(&self) -> bool {
        match self {
            AppBody::Http(body) => body.is_end_stream(),
            AppBody::Session(body) => body.is_finished(),
        }
    }

    /// Next piece of payload; trailers are dropped
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, AppResponseError> {
        match self {
            AppBody::Http(body) => {
                while let Some(frame) = body.frame().await {
                    if let Ok(data) = frame?.into_data() {
                        if !data.is_empty() {
                            return Ok(Some(data));
                        }
                    }
                }
                Ok(None)
            }
            AppBody::Session(body) => body.next_chunk().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn head_of(raw: &[u8], head_request: bool) -> Result<(SessionHead, Vec<u8>), AppResponseError> {
        let mut stream = raw;
        let mut buf = Vec::new();
        let head = read_session_head(&mut stream, &mut buf, head_request).await?;
        Ok((head, buf))
    }

    async fn read_body(raw: &'static [u8]) -> Result<Vec<u8>, AppResponseError> {
        let mut stream = raw;
        let mut buf = Vec::new();
        let head = read_session_head(&mut stream, &mut buf, false).await?;
        let mut reader = SessionBody::new(stream, head.framing, buf);
        let mut body = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        assert!(reader.is_finished());
        Ok(body)
    }

    #[tokio::test]
    async fn test_status_line_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-App: yes\r\nConnection: close\r\n\r\npong\n";
        let (head, rest) = head_of(raw, false).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.framing, BodyFraming::Length(5));
        assert_eq!(head.headers.get("x-app").unwrap(), "yes");
        assert!(head.headers.get("connection").is_none());
        assert_eq!(rest, b"pong\n");

        assert_eq!(read_body(raw).await.unwrap(), b"pong\n");
    }

    #[tokio::test]
    async fn test_status_header_and_eof_body() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let (head, _) = head_of(raw, false).await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.framing, BodyFraming::UntilEof);
        assert!(head.headers.get("status").is_none());
        assert_eq!(head.headers.get("content-type").unwrap(), "text/plain");

        assert_eq!(read_body(raw).await.unwrap(), b"missing");
    }

    #[tokio::test]
    async fn test_missing_status_defaults_to_ok() {
        let raw = b"Content-Type: text/plain\nContent-Length: 2\n\nhi";
        let (head, _) = head_of(raw, false).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(read_body(raw).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_chunked_session_response_rejected() {
        let raw = b"Status: 200\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        assert!(matches!(head_of(raw, false).await, Err(AppResponseError::ChunkedSession)));
    }

    #[tokio::test]
    async fn test_interim_responses_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let (head, rest) = head_of(raw, false).await.unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.framing, BodyFraming::Length(0));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_truncated() {
        assert!(matches!(head_of(b"", false).await, Err(AppResponseError::EmptyResponse)));
        assert!(matches!(
            head_of(b"HTTP/1.1 200 OK\r\nX: y", false).await,
            Err(AppResponseError::Truncated)
        ));
        assert!(matches!(
            read_body(b"Status: 200\r\nContent-Length: 10\r\n\r\nshort").await,
            Err(AppResponseError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_malformed_and_oversized_heads() {
        assert!(matches!(
            head_of(b"Status: abc\r\n\r\n", false).await,
            Err(AppResponseError::Malformed(_))
        ));
        assert!(matches!(
            head_of(b"Bad Header\r\n\r\n", false).await,
            Err(AppResponseError::Malformed(_))
        ));

        let mut raw = b"Status: 200\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        assert!(matches!(head_of(&raw, false).await, Err(AppResponseError::HeadTooLarge)));
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n";
        let (head, _) = head_of(raw, true).await.unwrap();
        assert_eq!(head.framing, BodyFraming::None);
        assert_eq!(head.headers.get("content-length").unwrap(), "42");

        let raw = b"Status: 304\r\nContent-Length: 42\r\n\r\n";
        let (head, _) = head_of(raw, false).await.unwrap();
        assert_eq!(head.framing, BodyFraming::None);
        assert!(head.headers.get("content-length").is_none());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
