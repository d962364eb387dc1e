//! WebSocket handshake implementation
//!
//! The HTTP/1.1 upgrade on both sides of the connection:
//! - Server: parse the request head, validate it in a fixed order and answer
//!   with either `101 Switching Protocols` or a plain rejection
//! - Client: build the request, parse the response and check the accept key
//!
//! No extensions or subprotocols are negotiated; `Sec-WebSocket-Protocol`
//! and `Sec-WebSocket-Extensions` are never emitted.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::WS_GUID;
use crate::error::{Error, Result};

const MAX_HEADERS: usize = 64;

/// A parsed HTTP upgrade request head
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request method
    pub method: String,
    /// Request target
    pub path: String,
    /// HTTP minor version (1 for HTTP/1.1)
    pub version: u8,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse a request head.
    ///
    /// Returns the request and the length of the head, or `Ok(None)` if the
    /// head is not complete yet. Bytes past the head belong to the
    /// WebSocket stream.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let headers = req
                    .headers
                    .iter()
                    .map(|h| -> Result<(String, String)> {
                        let value = std::str::from_utf8(h.value)
                            .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                        Ok((h.name.to_string(), value.trim().to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(Some((
                    UpgradeRequest {
                        method: req.method.unwrap_or_default().to_string(),
                        path: req.path.unwrap_or("/").to_string(),
                        version: req.version.unwrap_or(0),
                        headers,
                    },
                    len,
                )))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
        }
    }

    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Why an upgrade request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// HTTP status code of the response
    pub status: u16,
    /// Human-readable reason, also used as the response body
    pub reason: &'static str,
}

impl Rejection {
    /// Create a rejection
    pub const fn new(status: u16, reason: &'static str) -> Self {
        Self { status, reason }
    }

    /// Render the full HTTP response
    pub fn response(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status)).as_bytes());
        buf.put_slice(b"Connection: close\r\n");
        buf.put_slice(b"Content-Type: text/plain\r\n");
        buf.put_slice(format!("Content-Length: {}\r\n", self.reason.len()).as_bytes());
        if self.status == 426 {
            buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
        }
        if self.status == 405 {
            buf.put_slice(b"Allow: GET\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        Error::Rejected {
            status: r.status,
            reason: r.reason,
        }
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

/// Validate an upgrade request.
///
/// Checks run in this order and the first failure wins: HTTP/1.1, `Host`,
/// `GET`, `Upgrade: websocket`, the `upgrade` token in `Connection`,
/// `Sec-WebSocket-Version: 13`, and a `Sec-WebSocket-Key` that decodes to
/// 16 bytes. On success returns the `Sec-WebSocket-Accept` value.
pub fn validate(req: &UpgradeRequest) -> std::result::Result<String, Rejection> {
    if req.version != 1 {
        return Err(Rejection::new(505, "HTTP/1.1 required"));
    }
    if req.header("host").is_none() {
        return Err(Rejection::new(400, "missing Host header"));
    }
    if req.method != "GET" {
        return Err(Rejection::new(405, "method must be GET"));
    }

    let upgrade = req.header("upgrade").unwrap_or_default();
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(Rejection::new(400, "missing Upgrade: websocket"));
    }

    let connection = req.header("connection").unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(Rejection::new(400, "missing Connection: upgrade"));
    }

    if req.header("sec-websocket-version") != Some("13") {
        return Err(Rejection::new(426, "unsupported WebSocket version"));
    }

    let key = req
        .header("sec-websocket-key")
        .ok_or(Rejection::new(400, "missing Sec-WebSocket-Key"))?;
    match STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(Rejection::new(400, "invalid Sec-WebSocket-Key")),
    }

    Ok(generate_accept_key(key))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response
pub fn build_response(accept_key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// Build a WebSocket upgrade request (client-side)
pub fn build_request(host: &str, path: &str, key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Generate a random WebSocket key (client-side)
pub fn generate_key() -> String {
    let bytes: [u8; 16] = std::array::from_fn(|_| fastrand::u8(..));
    STANDARD.encode(bytes)
}

/// A parsed upgrade response (client-side)
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<String>,
}

/// Parse an upgrade response head (client-side)
pub fn parse_response(buf: &[u8]) -> Result<Option<(UpgradeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let accept = res
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
                .map(|h| {
                    std::str::from_utf8(h.value)
                        .map(|v| v.trim().to_string())
                        .map_err(|_| Error::InvalidHttp("invalid header value"))
                })
                .transpose()?;

            Ok(Some((
                UpgradeResponse {
                    status: res.code.unwrap_or(0),
                    accept,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Read an HTTP head from `stream`.
///
/// Returns the parsed head and whatever was read past it. Fails once more
/// than `max_size` bytes arrive without a complete head.
pub(crate) async fn read_head<S, T, F>(stream: &mut S, max_size: usize, parse: F) -> Result<(T, Bytes)>
where
    S: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>>,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((head, len)) = parse(&buf)? {
            let rest = buf.split_off(len).freeze();
            return Ok((head, rest));
        }
        if buf.len() >= max_size {
            return Err(Error::InvalidHttp("HTTP head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn request(lines: &[&str]) -> UpgradeRequest {
        let mut raw = lines.join("\r\n");
        raw.push_str("\r\n\r\n");
        let (req, len) = UpgradeRequest::parse(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(len, raw.len());
        req
    }

    fn valid_lines() -> Vec<&'static str> {
        vec![
            "GET /chat HTTP/1.1",
            "Host: server.example.com",
            "Upgrade: websocket",
            "Connection: keep-alive, Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
        ]
    }

    fn without(prefix: &str) -> Vec<&'static str> {
        valid_lines()
            .into_iter()
            .filter(|l| !l.starts_with(prefix))
            .collect()
    }

    fn replaced(prefix: &str, line: &'static str) -> Vec<&'static str> {
        valid_lines()
            .into_iter()
            .map(|l| if l.starts_with(prefix) { line } else { l })
            .collect()
    }

    #[test]
    fn test_accept_key() {
        assert_eq!(generate_accept_key(RFC_KEY), RFC_ACCEPT);
        assert!(validate_accept_key(RFC_KEY, RFC_ACCEPT));
        assert!(!validate_accept_key(RFC_KEY, "nope"));
    }

    #[test]
    fn test_valid_request() {
        let req = request(&valid_lines());
        assert_eq!(req.path, "/chat");
        assert_eq!(req.header("HOST"), Some("server.example.com"));
        assert_eq!(validate(&req), Ok(RFC_ACCEPT.to_string()));
    }

    #[test]
    fn test_partial_request() {
        assert!(UpgradeRequest::parse(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
    }

    #[test]
    fn test_leftover_bytes_not_consumed() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\x81\x80";
        let (_, len) = UpgradeRequest::parse(raw).unwrap().unwrap();
        assert_eq!(&raw[len..], b"\x81\x80");
    }

    #[test]
    fn test_rejections() {
        let cases: Vec<(Vec<&'static str>, u16)> = vec![
            (replaced("GET", "GET /chat HTTP/1.0"), 505),
            (without("Host"), 400),
            (replaced("GET", "POST /chat HTTP/1.1"), 405),
            (without("Upgrade"), 400),
            (replaced("Upgrade", "Upgrade: h2c"), 400),
            (without("Connection"), 400),
            (replaced("Connection", "Connection: keep-alive"), 400),
            (replaced("Connection", "Connection: upgraded"), 400),
            (without("Sec-WebSocket-Version"), 426),
            (replaced("Sec-WebSocket-Version", "Sec-WebSocket-Version: 8"), 426),
            (without("Sec-WebSocket-Key"), 400),
            (replaced("Sec-WebSocket-Key", "Sec-WebSocket-Key: not base64!"), 400),
            (replaced("Sec-WebSocket-Key", "Sec-WebSocket-Key: AAAA"), 400),
        ];
        for (lines, status) in cases {
            let rejection = validate(&request(&lines)).unwrap_err();
            assert_eq!(rejection.status, status, "{lines:?}");
        }
    }

    #[test]
    fn test_validation_order() {
        // Missing Host is reported before the wrong method
        let mut lines = without("Host");
        lines[0] = "POST /chat HTTP/1.1";
        assert_eq!(validate(&request(&lines)).unwrap_err().status, 400);

        // Wrong version is reported before the bad key
        let mut lines = replaced("Sec-WebSocket-Version", "Sec-WebSocket-Version: 12");
        lines.retain(|l| !l.starts_with("Sec-WebSocket-Key"));
        assert_eq!(validate(&request(&lines)).unwrap_err().status, 426);
    }

    #[test]
    fn test_upgrade_header_case_insensitive() {
        let req = request(&replaced("Upgrade", "Upgrade: WebSocket"));
        assert!(validate(&req).is_ok());
        let req = request(&replaced("Connection", "connection: UPGRADE"));
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn test_rejection_response() {
        let response = Rejection::new(426, "unsupported WebSocket version").response();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.ends_with("\r\n\r\nunsupported WebSocket version"));

        let response = Rejection::new(400, "bad").response();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(!text.contains("Sec-WebSocket-Version"));
    }

    #[test]
    fn test_build_response() {
        let response = build_response(RFC_ACCEPT);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Accept: {RFC_ACCEPT}\r\n")));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_client_request_round_trip() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);

        let raw = build_request("localhost:9001", "/echo", &key);
        let (req, _) = UpgradeRequest::parse(&raw).unwrap().unwrap();
        assert_eq!(req.path, "/echo");
        assert_eq!(validate(&req), Ok(generate_accept_key(&key)));
    }

    #[test]
    fn test_parse_response() {
        let raw = build_response(RFC_ACCEPT);
        let (res, len) = parse_response(&raw).unwrap().unwrap();
        assert_eq!(len, raw.len());
        assert_eq!(res.status, 101);
        assert_eq!(res.accept.as_deref(), Some(RFC_ACCEPT));

        let (res, _) = parse_response(&Rejection::new(400, "no").response())
            .unwrap()
            .unwrap();
        assert_eq!(res.status, 400);
        assert!(res.accept.is_none());
    }

    #[tokio::test]
    async fn test_read_head_returns_leftover() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut raw = build_request("h", "/", RFC_KEY).to_vec();
        raw.extend_from_slice(b"extra");
        tokio::io::AsyncWriteExt::write_all(&mut b, &raw).await.unwrap();

        let (req, rest) = read_head(&mut a, 8192, UpgradeRequest::parse).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(rest.as_ref(), b"extra");
    }

    #[tokio::test]
    async fn test_read_head_too_large() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let junk = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n", "a".repeat(200));
        tokio::io::AsyncWriteExt::write_all(&mut b, junk.as_bytes()).await.unwrap();

        let err = read_head(&mut a, 64, UpgradeRequest::parse).await.unwrap_err();
        assert!(matches!(err, Error::InvalidHttp(_)));
    }
}
