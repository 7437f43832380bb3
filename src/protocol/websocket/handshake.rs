//! Opening handshake on top of the HTTP request parser.

use crate::error::{Error, Result};
use crate::protocol::http::{Request, Response, Version};
use base64::Engine;
use sha1::{Digest, Sha1};

/// The WebSocket magic GUID used in the handshake.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const WEBSOCKET_VERSION: &str = "13";

/// An accepted upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    pub accept: String,
    pub protocols: Vec<String>,
}

/// Compute the Sec-WebSocket-Accept value from the key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// True when the client asks to switch to WebSocket, whether or not the rest
/// of the request is valid
pub fn is_upgrade_request(request: &Request) -> bool {
    request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Validate an upgrade request and compute the accept key
pub fn validate_upgrade(request: &Request) -> Result<Upgrade> {
    if request.method != "GET" {
        return Err(bad("upgrade must use GET"));
    }
    if request.version != Version::Http11 {
        return Err(bad("upgrade requires HTTP/1.1"));
    }
    if !is_upgrade_request(request) {
        return Err(bad("missing Upgrade: websocket header"));
    }
    if !request.header_has_token("connection", "upgrade") {
        return Err(bad("missing Connection: Upgrade header"));
    }
    if request.header("sec-websocket-version") != Some(WEBSOCKET_VERSION) {
        return Err(bad("missing or invalid Sec-WebSocket-Version header (must be 13)"));
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or_else(|| bad("missing Sec-WebSocket-Key header"))?;
    // The key is a base64-encoded 16 byte nonce
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| bad("Sec-WebSocket-Key is not base64"))?;
    if nonce.len() != 16 {
        return Err(bad("Sec-WebSocket-Key must encode 16 bytes"));
    }

    let protocols = request
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("sec-websocket-protocol"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();

    Ok(Upgrade {
        accept: accept_key(key),
        protocols,
    })
}

fn bad(msg: &str) -> Error {
    Error::MalformedRequest(msg.to_string())
}

/// Create the 101 response that completes the handshake.
pub fn switching_protocols(accept: &str, protocol: Option<&str>) -> Response {
    let mut response = Response::new(101)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", accept);
    if let Some(protocol) = protocol {
        response = response.with_header("Sec-WebSocket-Protocol", protocol);
    }
    response
}

/// Build a client upgrade request for `host` and `path`
pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\r\n"
    )
}

/// Generate a client nonce from the current time and a counter; the key only
/// has to differ between connections
pub fn generate_key() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&nanos.to_be_bytes());
    nonce[8..].copy_from_slice(&count.to_be_bytes());
    base64::engine::general_purpose::STANDARD.encode(nonce)
}
