//! Worker application for integration testing
//!
//! Speaks plain HTTP/1.1 with keep-alive on `127.0.0.1:$PORT`.
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - STARTUP_DELAY_MS: Delay before listening (default: 0)
//!
//! Routes:
//! - GET /ping      -> "pong\n"
//! - GET /pid       -> the worker's pid, never cacheable
//! - GET /cached    -> "hits=N", publicly cacheable for 60 seconds
//! - POST /cached   -> "posted"
//! - POST /echo     -> the request body
//! - GET /slow?ms=N -> "slept" after N milliseconds
//! - GET /chunked   -> a chunked body
//! - GET /headers   -> the request head as received

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

static CACHED_HITS: AtomicU64 = AtomicU64::new(0);

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("mock-app: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");
    eprintln!("mock-app: pid {} listening on port {}", std::process::id(), port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream));
            }
            Err(e) => eprintln!("mock-app: accept error: {}", e),
        }
    }
}

struct Request {
    method: String,
    target: String,
    head: String,
    body: Vec<u8>,
    close: bool,
}

/// Read one request; `None` when the connection is done
async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Request> {
    let mut temp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
        match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&temp[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let mut content_length = 0usize;
    let mut close = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse().unwrap_or(0),
            "connection" => close = value.eq_ignore_ascii_case("close"),
            _ => {}
        }
    }

    buf.drain(..head_end);
    while buf.len() < content_length {
        match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&temp[..n]),
        }
    }
    let body: Vec<u8> = buf.drain(..content_length).collect();

    Some(Request {
        method,
        target,
        head,
        body,
        close,
    })
}

fn response(status: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n{}\r\n",
        status,
        body.len(),
        extra_headers
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    while let Some(request) = read_request(&mut stream, &mut buf).await {
        let (path, query) = match request.target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (request.target.as_str(), ""),
        };

        let reply = match (request.method.as_str(), path) {
            ("GET", "/ping") => response("200 OK", "", b"pong\n"),
            ("GET", "/pid") => response(
                "200 OK",
                "cache-control: no-store\r\n",
                std::process::id().to_string().as_bytes(),
            ),
            ("GET", "/cached") => {
                let hits = CACHED_HITS.fetch_add(1, Ordering::SeqCst) + 1;
                response(
                    "200 OK",
                    "cache-control: public, max-age=60\r\n",
                    format!("hits={}", hits).as_bytes(),
                )
            }
            ("POST", "/cached") => response("200 OK", "cache-control: no-store\r\n", b"posted"),
            ("POST", "/echo") => response("200 OK", "", &request.body),
            ("GET", "/slow") => {
                let ms: u64 = query
                    .strip_prefix("ms=")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                response("200 OK", "cache-control: no-store\r\n", b"slept")
            }
            ("GET", "/chunked") => {
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
                    .to_vec()
            }
            ("GET", "/headers") => response("200 OK", "cache-control: no-store\r\n", request.head.as_bytes()),
            _ => response("404 Not Found", "", b"not found"),
        };

        if stream.write_all(&reply).await.is_err() {
            return;
        }
        if request.close {
            return;
        }
    }
}
