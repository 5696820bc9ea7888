//! Serializing requests for workers
//!
//! Workers speak one of two dialects. `session` sockets take a 4-byte
//! big-endian length followed by `KEY\0VALUE\0` pairs, then the raw body, and
//! the request ends when the supervisor half-closes. `http` sockets take an
//! ordinary HTTP/1.1 request, sent through hyper's client connection.

use super::body_buffer::BufferedBody;
use crate::conn_pool::WorkerBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::http::request::Parts;
use hyper::{Request, Uri};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Request headers never passed on to a worker
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
    "content-length",
];

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Facts about the client side of a request that workers get to see
#[derive(Debug, Clone)]
pub struct ForwardInfo {
    pub request_id: String,
    pub remote_addr: String,
    pub remote_port: u16,
    pub scheme: &'static str,
    pub server_name: String,
    pub server_port: u16,
    pub server_software: String,
}

/// Request body as it will be sent to the worker
pub enum OutgoingBody {
    Empty,
    /// Streamed from the client as it arrives; the length is known
    Streaming { body: Incoming, length: u64 },
    Buffered(BufferedBody),
}

impl OutgoingBody {
    pub fn content_length(&self) -> Option<u64> {
        match self {
            OutgoingBody::Empty => None,
            OutgoingBody::Streaming { length, .. } => Some(*length),
            OutgoingBody::Buffered(b) => Some(b.len()),
        }
    }

    /// The body in the form hyper sends to an HTTP worker
    pub fn into_worker_body(self) -> WorkerBody {
        match self {
            OutgoingBody::Empty => empty_body(),
            OutgoingBody::Streaming { body, .. } => body
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                .boxed_unsync(),
            OutgoingBody::Buffered(buffered) => buffered.into_body(),
        }
    }
}

pub fn empty_body() -> WorkerBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The client went away or sent a bad body
    #[error("client body error: {0}")]
    Client(String),
    /// Writing to the worker failed
    #[error("worker write error: {0}")]
    App(#[from] io::Error),
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// `HTTP_ACCEPT_LANGUAGE` from `accept-language`
fn cgi_name(header: &str) -> String {
    let mut name = String::with_capacity(header.len() + 5);
    name.push_str("HTTP_");
    for c in header.chars() {
        name.push(if c == '-' { '_' } else { c.to_ascii_uppercase() });
    }
    name
}

/// Header block in the session dialect, including its length prefix
pub fn session_header(parts: &Parts, content_length: Option<u64>, info: &ForwardInfo) -> Vec<u8> {
    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut pairs: Vec<(String, String)> = vec![
        ("REQUEST_METHOD".into(), parts.method.to_string()),
        ("REQUEST_URI".into(), path_and_query.to_string()),
        ("PATH_INFO".into(), parts.uri.path().to_string()),
        ("QUERY_STRING".into(), parts.uri.query().unwrap_or("").to_string()),
        ("SCRIPT_NAME".into(), String::new()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_NAME".into(), info.server_name.clone()),
        ("SERVER_PORT".into(), info.server_port.to_string()),
        ("SERVER_SOFTWARE".into(), info.server_software.clone()),
        ("REMOTE_ADDR".into(), info.remote_addr.clone()),
        ("REMOTE_PORT".into(), info.remote_port.to_string()),
        ("APPGATE_REQUEST_ID".into(), info.request_id.clone()),
    ];
    if info.scheme == "https" {
        pairs.push(("HTTPS".into(), "on".into()));
    }
    if let Some(length) = content_length {
        pairs.push(("CONTENT_LENGTH".into(), length.to_string()));
    }

    for (name, value) in &parts.headers {
        let name = name.as_str();
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name == "content-type" {
            pairs.push(("CONTENT_TYPE".into(), value.to_string()));
        } else {
            pairs.push((cgi_name(name), value.to_string()));
        }
    }
    pairs.push((cgi_name(X_FORWARDED_FOR), info.remote_addr.clone()));
    pairs.push((cgi_name(X_FORWARDED_PROTO), info.scheme.to_string()));

    let mut block = Vec::new();
    for (key, value) in pairs {
        // NULs would break the framing
        if key.contains('\0') || value.contains('\0') {
            continue;
        }
        block.extend_from_slice(key.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }

    let mut out = Vec::with_capacity(block.len() + 4);
    out.extend_from_slice(&(block.len() as u32).to_be_bytes());
    out.extend_from_slice(&block);
    out
}

/// Request for an HTTP worker. Forwarding headers are overwritten rather
/// than appended; this is the first trusted hop.
pub fn http_request(
    parts: &Parts,
    body: WorkerBody,
    content_length: Option<u64>,
    info: &ForwardInfo,
) -> Request<WorkerBody> {
    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = path.parse().unwrap_or_else(|_| Uri::from_static("/"));

    let headers = request.headers_mut();
    for (name, value) in &parts.headers {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || lower == X_REQUEST_ID
            || lower == X_FORWARDED_FOR
            || lower == X_FORWARDED_HOST
            || lower == X_FORWARDED_PROTO
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    set(X_REQUEST_ID, &info.request_id);
    set(X_FORWARDED_FOR, &info.remote_addr);
    if let Some(host) = parts.headers.get(hyper::header::HOST).and_then(|h| h.to_str().ok()) {
        set(X_FORWARDED_HOST, host);
    }
    set(X_FORWARDED_PROTO, info.scheme);
    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    request
}

/// Write the request body to the worker
pub async fn send_body<W>(worker: &mut W, body: &mut OutgoingBody) -> Result<(), SendError>
where
    W: AsyncWrite + Unpin,
{
    match body {
        OutgoingBody::Empty => {}
        OutgoingBody::Buffered(buffered) => buffered.write_to(worker).await?,
        OutgoingBody::Streaming { body, length } => {
            let mut sent = 0u64;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| SendError::Client(e.to_string()))?;
                if let Ok(data) = frame.into_data() {
                    sent += data.len() as u64;
                    worker.write_all(&data).await?;
                }
            }
            if sent != *length {
                return Err(SendError::Client(format!(
                    "body ended after {} of {} bytes",
                    sent, length
                )));
            }
        }
    }
    worker.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn info() -> ForwardInfo {
        ForwardInfo {
            request_id: "req-1".into(),
            remote_addr: "10.0.0.9".into(),
            remote_port: 40000,
            scheme: "http",
            server_name: "example.com".into(),
            server_port: 3000,
            server_software: "appgate/test".into(),
        }
    }

    fn parts(builder: hyper::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn decode_pairs(data: &[u8]) -> Vec<(String, String)> {
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        assert_eq!(len, data.len() - 4);
        let fields: Vec<&[u8]> = data[4..].split(|&b| b == 0).collect();
        // trailing NUL leaves one empty field at the end
        assert_eq!(fields.last().map(|f| f.len()), Some(0));
        fields[..fields.len() - 1]
            .chunks(2)
            .map(|kv| {
                (
                    String::from_utf8(kv[0].to_vec()).unwrap(),
                    String::from_utf8(kv[1].to_vec()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_session_header_pairs() {
        let parts = parts(
            Request::builder()
                .method("POST")
                .uri("/submit?x=1")
                .header("host", "example.com")
                .header("content-type", "text/plain")
                .header("accept-language", "en")
                .header("connection", "keep-alive"),
        );
        let pairs = decode_pairs(&session_header(&parts, Some(5), &info()));
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("REQUEST_URI"), Some("/submit?x=1"));
        assert_eq!(get("PATH_INFO"), Some("/submit"));
        assert_eq!(get("QUERY_STRING"), Some("x=1"));
        assert_eq!(get("CONTENT_LENGTH"), Some("5"));
        assert_eq!(get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(get("HTTP_ACCEPT_LANGUAGE"), Some("en"));
        assert_eq!(get("HTTP_HOST"), Some("example.com"));
        assert_eq!(get("REMOTE_ADDR"), Some("10.0.0.9"));
        assert_eq!(get("HTTP_CONNECTION"), None);
        assert_eq!(get("HTTPS"), None);
    }

    #[test]
    fn test_http_request_overwrites_forwarding_headers() {
        let parts = parts(
            Request::builder()
                .method("POST")
                .uri("http://example.com:3000/ping?q=1")
                .header("host", "example.com:3000")
                .header("x-forwarded-for", "6.6.6.6")
                .header("expect", "100-continue")
                .header("transfer-encoding", "chunked")
                .header("accept", "text/html"),
        );
        let request = http_request(&parts, empty_body(), Some(3), &info());
        let headers = request.headers();

        assert_eq!(request.method(), "POST");
        assert_eq!(request.uri(), "/ping?q=1");
        assert_eq!(headers["host"], "example.com:3000");
        assert_eq!(headers["accept"], "text/html");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.9");
        assert_eq!(headers.get_all("x-forwarded-for").iter().count(), 1);
        assert_eq!(headers["x-forwarded-host"], "example.com:3000");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers["x-request-id"], "req-1");
        assert_eq!(headers["content-length"], "3");
        assert!(headers.get("expect").is_none());
        assert!(headers.get("transfer-encoding").is_none());
    }

    #[tokio::test]
    async fn test_buffered_body_as_worker_body() {
        let body = http_body_util::Full::new(hyper::body::Bytes::from_static(b"hello"));
        let buffered = BufferedBody::collect(body, 1024).await.unwrap();
        let outgoing = OutgoingBody::Buffered(buffered);
        assert_eq!(outgoing.content_length(), Some(5));

        let collected = outgoing.into_worker_body().collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn test_send_buffered_body() {
        let mut body = OutgoingBody::Buffered(BufferedBody::empty());
        let mut out = Vec::new();
        send_body(&mut out, &mut body).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(body.content_length(), Some(0));
        assert_eq!(OutgoingBody::Empty.content_length(), None);
    }
}
