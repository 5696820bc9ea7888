//! Request-level header inspection: host, framing, secure headers, cookies

use crate::error::ErrorCode;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING};
use std::net::SocketAddr;
use std::sync::OnceLock;

/// Prefix of headers only the trusted front-end may send
pub const SECURE_HEADER_PREFIX: &str = "!~";
pub const SECURE_HEADERS_PASSWORD: &str = "!~secure-headers-password";
/// Client address as seen by the trusted front-end
pub const SECURE_REMOTE_ADDR: &str = "!~remote-addr";
/// Set to `on` by a trusted front-end that terminated TLS
pub const SECURE_HTTPS: &str = "!~https";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Where a client connection came from
#[derive(Debug, Clone, Copy)]
pub enum Peer {
    Tcp(SocketAddr),
    /// Unix socket peers are the local front-end and always trusted
    Unix,
}

impl Peer {
    pub fn is_unix(&self) -> bool {
        matches!(self, Peer::Unix)
    }
}

/// Whether a client connection is trusted to send `!~` headers. Settled by
/// the first request on the connection; later requests cannot change it.
#[derive(Debug, Default)]
pub struct ConnectionTrust(OnceLock<bool>);

impl ConnectionTrust {
    pub fn new() -> Self {
        Self::default()
    }

    fn settle(&self, decide: impl FnOnce() -> bool) -> bool {
        *self.0.get_or_init(decide)
    }

    pub fn is_settled(&self) -> bool {
        self.0.get().is_some()
    }
}

/// How the request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

impl Framing {
    pub fn has_body(&self) -> bool {
        !matches!(self, Framing::Empty | Framing::Length(0))
    }
}

/// What the secure headers established about a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureInfo {
    pub trusted: bool,
    pub remote_addr: Option<String>,
    pub https: bool,
}

/// Hostname from the Host header, without port, lower-cased
pub fn extract_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            // alphanumeric, hyphen and dot only; keeps junk out of the logs
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }
            Some(hostname.to_lowercase())
        })
}

/// Body framing. Both Content-Length and chunked is a framing error.
pub fn request_framing(headers: &HeaderMap) -> Result<Framing, ErrorCode> {
    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|s| s.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    });
    let length = headers.get(CONTENT_LENGTH);

    match (chunked, length) {
        (true, Some(_)) => Err(ErrorCode::InvalidRequestFraming),
        (true, None) => Ok(Framing::Chunked),
        (false, Some(value)) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Framing::Length)
            .ok_or(ErrorCode::InvalidRequestFraming),
        (false, None) => Ok(Framing::Empty),
    }
}

/// Decide whether the peer is trusted and strip every `!~` header.
///
/// Unix socket peers are trusted. TCP peers become trusted by presenting the
/// shared password on the first request of their connection; any other `!~`
/// header from an untrusted peer is rejected.
pub fn take_secure_headers(
    headers: &mut HeaderMap,
    peer: &Peer,
    password: Option<&str>,
    connection: &ConnectionTrust,
) -> Result<SecureInfo, ErrorCode> {
    let trusted = connection.settle(|| {
        let presented = headers
            .get(SECURE_HEADERS_PASSWORD)
            .and_then(|v| v.to_str().ok());
        peer.is_unix()
            || matches!((password, presented), (Some(expected), Some(given)) if !expected.is_empty() && expected == given)
    });

    let secure_names: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(SECURE_HEADER_PREFIX))
        .cloned()
        .collect();

    if secure_names.is_empty() {
        return Ok(SecureInfo {
            trusted,
            ..SecureInfo::default()
        });
    }
    if !trusted {
        return Err(ErrorCode::SecureHeadersNotAllowed);
    }

    let value_of = |headers: &HeaderMap, name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
    };
    let info = SecureInfo {
        trusted,
        remote_addr: value_of(headers, SECURE_REMOTE_ADDR).filter(|s| !s.is_empty()),
        https: value_of(headers, SECURE_HTTPS).is_some_and(|v| v.eq_ignore_ascii_case("on")),
    };
    for name in secure_names {
        headers.remove(name);
    }
    Ok(info)
}

/// Value of the named cookie, if the request carries it
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Set-Cookie value routing later requests to `gupid`
pub fn sticky_cookie(name: &str, gupid: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("{}={}; Path=/; HttpOnly", name, gupid)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn tcp_peer() -> Peer {
        Peer::Tcp("10.0.0.1:5000".parse().unwrap())
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(extract_hostname(&headers(&[("host", "Example.COM:8080")])).as_deref(), Some("example.com"));
        assert_eq!(extract_hostname(&headers(&[("host", "bad_host")])), None);
        assert_eq!(extract_hostname(&headers(&[("host", ":80")])), None);
        assert_eq!(extract_hostname(&HeaderMap::new()), None);
        let long = "a".repeat(254);
        assert_eq!(extract_hostname(&headers(&[("host", &long)])), None);
    }

    #[test]
    fn test_request_framing() {
        assert_eq!(request_framing(&HeaderMap::new()), Ok(Framing::Empty));
        assert_eq!(request_framing(&headers(&[("content-length", "12")])), Ok(Framing::Length(12)));
        assert_eq!(request_framing(&headers(&[("transfer-encoding", "chunked")])), Ok(Framing::Chunked));
        assert_eq!(
            request_framing(&headers(&[("content-length", "5"), ("transfer-encoding", "chunked")])),
            Err(ErrorCode::InvalidRequestFraming)
        );
        assert_eq!(
            request_framing(&headers(&[("content-length", "abc")])),
            Err(ErrorCode::InvalidRequestFraming)
        );
        assert!(!Framing::Length(0).has_body());
        assert!(Framing::Chunked.has_body());
    }

    #[test]
    fn test_untrusted_secure_headers_rejected() {
        let mut map = headers(&[("!~remote-addr", "1.2.3.4")]);
        assert_eq!(
            take_secure_headers(&mut map, &tcp_peer(), Some("sekrit"), &ConnectionTrust::new()),
            Err(ErrorCode::SecureHeadersNotAllowed)
        );

        let mut map = headers(&[("!~secure-headers-password", "wrong"), ("!~https", "on")]);
        assert_eq!(
            take_secure_headers(&mut map, &tcp_peer(), Some("sekrit"), &ConnectionTrust::new()),
            Err(ErrorCode::SecureHeadersNotAllowed)
        );
    }

    #[test]
    fn test_trusted_by_password_and_stripped() {
        let mut map = headers(&[
            ("!~secure-headers-password", "sekrit"),
            ("!~remote-addr", "1.2.3.4"),
            ("!~https", "on"),
            ("accept", "*/*"),
        ]);
        let info = take_secure_headers(&mut map, &tcp_peer(), Some("sekrit"), &ConnectionTrust::new()).unwrap();
        assert!(info.trusted);
        assert_eq!(info.remote_addr.as_deref(), Some("1.2.3.4"));
        assert!(info.https);
        assert!(map.keys().all(|k| !k.as_str().starts_with("!~")));
        assert!(map.contains_key("accept"));
    }

    #[test]
    fn test_unix_peer_trusted_without_password() {
        let mut map = headers(&[("!~remote-addr", "5.6.7.8")]);
        let info = take_secure_headers(&mut map, &Peer::Unix, None, &ConnectionTrust::new()).unwrap();
        assert!(info.trusted);
        assert_eq!(info.remote_addr.as_deref(), Some("5.6.7.8"));
        assert!(map.is_empty());

        let mut plain = HeaderMap::new();
        assert!(!take_secure_headers(&mut plain, &tcp_peer(), None, &ConnectionTrust::new()).unwrap().trusted);
    }

    #[test]
    fn test_trust_is_settled_by_first_request() {
        let untrusted = ConnectionTrust::new();
        let mut first = headers(&[("accept", "*/*")]);
        assert!(!take_secure_headers(&mut first, &tcp_peer(), Some("sekrit"), &untrusted).unwrap().trusted);
        assert!(untrusted.is_settled());

        // a pipelined follow-up cannot log in halfway through the connection
        let mut later = headers(&[("!~secure-headers-password", "sekrit"), ("!~remote-addr", "1.2.3.4")]);
        assert_eq!(
            take_secure_headers(&mut later, &tcp_peer(), Some("sekrit"), &untrusted),
            Err(ErrorCode::SecureHeadersNotAllowed)
        );

        let trusted = ConnectionTrust::new();
        let mut login = headers(&[("!~secure-headers-password", "sekrit")]);
        assert!(take_secure_headers(&mut login, &tcp_peer(), Some("sekrit"), &trusted).unwrap().trusted);
        let mut next = headers(&[("!~remote-addr", "9.9.9.9")]);
        let info = take_secure_headers(&mut next, &tcp_peer(), Some("sekrit"), &trusted).unwrap();
        assert!(info.trusted);
        assert_eq!(info.remote_addr.as_deref(), Some("9.9.9.9"));
        assert!(next.is_empty());
    }

    #[test]
    fn test_cookie_value() {
        let map = headers(&[("cookie", "a=1; _appgate_route=g-42 ; b=2")]);
        assert_eq!(cookie_value(&map, "_appgate_route").as_deref(), Some("g-42"));
        assert_eq!(cookie_value(&map, "missing"), None);
        assert_eq!(
            sticky_cookie("_appgate_route", "g-1").unwrap(),
            "_appgate_route=g-1; Path=/; HttpOnly"
        );
    }
}
