//! Just enough HTTP/1.x to carry the WebSocket upgrade: an incremental request
//! head parser and a response writer.

use crate::error::{Error, Result};
use crate::runtime::WorkerData;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;

/// Largest request head (request line and headers) accepted
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
/// Largest request body accepted
pub const MAX_BODY_SIZE: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if any comma-separated value of `name` equals `token`, ignoring case
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    }

    /// HTTP/1.1 defaults to persistent connections, HTTP/1.0 to closing
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.header_has_token("connection", "close"),
            Version::Http10 => self.header_has_token("connection", "keep-alive"),
        }
    }
}

/// Parse one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or `None` while
/// the head or body is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let Some(head_end) = memmem::find(buf, b"\r\n\r\n") else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(malformed("request head too large"));
        }
        return Ok(None);
    };
    if head_end > MAX_HEAD_SIZE {
        return Err(malformed("request head too large"));
    }

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| malformed("request head is not UTF-8"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(path), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("bad request line"));
    };
    if method.is_empty() || path.is_empty() {
        return Err(malformed("bad request line"));
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(malformed("unsupported HTTP version")),
    };

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(malformed("header without a colon"));
        };
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(malformed("bad header name"));
        }
        if headers.len() == MAX_HEADERS {
            return Err(malformed("too many headers"));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method: method.to_string(),
        path: path.to_string(),
        version,
        headers,
        body: Bytes::new(),
    };

    let body_len = match request.header("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| malformed("bad Content-Length"))?,
        None => 0,
    };
    if body_len > MAX_BODY_SIZE {
        return Err(malformed("request body too large"));
    }

    let body_start = head_end + 4;
    let total = body_start + body_len;
    if buf.len() < total {
        return Ok(None);
    }
    request.body = Bytes::copy_from_slice(&buf[body_start..total]);
    Ok(Some((request, total)))
}

fn malformed(msg: &str) -> Error {
    Error::MalformedRequest(msg.to_string())
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(body)
    }

    pub fn not_found() -> Self {
        Self::new(404).with_body("Not Found")
    }

    pub fn bad_request(reason: &str) -> Self {
        Self::new(400)
            .with_header("Content-Type", "text/plain")
            .with_header("Connection", "close")
            .with_body(reason.to_string())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the response asks for the connection to be closed
    pub fn closes_connection(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Serialize as an HTTP/1.1 response. `Content-Length` is added for every
    /// status except 101 and 204.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let mut status = itoa::Buffer::new();
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(status.format(self.status).as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(reason_phrase(self.status).as_bytes());
        dst.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        if self.status != 101 && self.status != 204 && self.header("content-length").is_none() {
            let mut len = itoa::Buffer::new();
            dst.put_slice(b"Content-Length: ");
            dst.put_slice(len.format(self.body.len()).as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Produces responses for plain (non-upgrade) requests
pub trait HttpHandler: Send + Sync {
    fn handle(&self, request: &Request, worker: &mut WorkerData) -> Response;
}

impl<F> HttpHandler for F
where
    F: Fn(&Request, &mut WorkerData) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request, worker: &mut WorkerData) -> Response {
        self(request, worker)
    }
}

/// Answers every request with 404
pub struct NotFound;

impl HttpHandler for NotFound {
    fn handle(&self, _request: &Request, _worker: &mut WorkerData) -> Response {
        Response::not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\nrest";
        let (req, used) = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/chat");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("HOST"), Some("example.com"));
        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(&raw[used..], b"rest");
    }

    #[test]
    fn test_incomplete_head_and_body() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());

        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert!(parse_request(raw).unwrap().is_none());

        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        let (req, used) = parse_request(raw).unwrap().unwrap();
        assert_eq!(&req.body[..], b"abcde");
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_malformed_requests() {
        for raw in [
            &b"GET /\r\n\r\n"[..],
            b"GET / HTTP/2.0\r\n\r\n",
            b"GET / HTTP/1.1\r\nno-colon\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: nope\r\n\r\n",
        ] {
            assert!(
                matches!(parse_request(raw), Err(Error::MalformedRequest(_))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_head_size_limit() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        assert!(matches!(parse_request(&raw), Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn test_keep_alive_defaults() {
        let (req, _) = parse_request(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert!(req.keep_alive());
        let (req, _) = parse_request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap().unwrap();
        assert!(!req.keep_alive());
        let (req, _) = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!req.keep_alive());
        let (req, _) = parse_request(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap().unwrap();
        assert!(req.keep_alive());
    }

    #[test]
    fn test_connection_tokens() {
        let (req, _) = parse_request(b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.header_has_token("connection", "upgrade"));
        assert!(!req.header_has_token("connection", "close"));
    }

    #[test]
    fn test_response_serialization() {
        let mut buf = BytesMut::new();
        Response::ok("hello")
            .with_header("Content-Type", "text/plain")
            .write_to(&mut buf);
        assert_eq!(
            &buf[..],
            &b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"[..]
        );

        let mut buf = BytesMut::new();
        Response::new(101).with_header("Upgrade", "websocket").write_to(&mut buf);
        assert_eq!(
            &buf[..],
            &b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n"[..]
        );
    }
}
