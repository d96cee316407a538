//! WebSocket opening handshake (RFC 6455 §4.2).

use crate::error::HandshakeError;
use crate::result::HttpResult;
use crate::server::request::RequestHead;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::StatusCode;
use sha1::{Digest, Sha1};
use std::io::{self, Write};

/// The only protocol version spoken.
pub const SUPPORTED_VERSION: &str = "13";

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Outcome of inspecting a request head for an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Plain HTTP request
    NoHandshake,
    /// Upgrade accepted; the connection switches to frames after the 101
    Ok(Accepted),
    /// Malformed upgrade; answered with 400, the connection stays in HTTP mode
    Error(HandshakeError),
    /// Version other than 13; answered with 426 and `Sec-WebSocket-Version: 13`
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Request path without the query string; the channel registry key
    pub uri: String,
    pub accept_key: String,
    pub protocol: Option<String>,
}

/// Inspect `head` and decide how to answer it.
///
/// `subprotocols` are the server's protocols in preference order; the first
/// one the client also offers is selected.
pub fn negotiate(head: &RequestHead, subprotocols: &[String]) -> Handshake {
    if !head.is_upgrade_request() {
        return Handshake::NoHandshake;
    }
    match head.header("sec-websocket-version").map(str::trim) {
        Some(SUPPORTED_VERSION) => {}
        _ => return Handshake::Unsupported,
    }
    if head.method != http::Method::GET {
        return Handshake::Error(HandshakeError::MethodNotGet(head.method.to_string()));
    }
    if !head.has_token("upgrade", "websocket") {
        return Handshake::Error(HandshakeError::MissingUpgrade);
    }
    let Some(key) = head.header("sec-websocket-key").map(str::trim) else {
        return Handshake::Error(HandshakeError::MissingKey);
    };
    if STANDARD.decode(key).map(|k| k.len()).unwrap_or(0) != 16 {
        return Handshake::Error(HandshakeError::InvalidKey(key.to_string()));
    }

    let offered: Vec<&str> = head
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("sec-websocket-protocol"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .collect();
    let protocol = subprotocols
        .iter()
        .find(|p| offered.iter().any(|o| o.eq_ignore_ascii_case(p)))
        .cloned();

    let uri = head
        .target
        .split('?')
        .next()
        .unwrap_or(&head.target)
        .to_string();
    Handshake::Ok(Accepted {
        uri,
        accept_key: accept_key(key),
        protocol,
    })
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// Write the `101 Switching Protocols` response.
pub fn write_switching_protocols<W: Write>(out: &mut W, accepted: &Accepted) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        accepted.accept_key
    );
    if let Some(p) = &accepted.protocol {
        head.push_str("Sec-WebSocket-Protocol: ");
        head.push_str(p);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    out.write_all(head.as_bytes())?;
    out.flush()
}

/// Response for a rejected handshake.
pub fn rejection(handshake: &Handshake) -> Option<HttpResult> {
    match handshake {
        Handshake::Error(_) => Some(HttpResult::bad_request()),
        Handshake::Unsupported => Some(
            HttpResult::new(StatusCode::UPGRADE_REQUIRED)
                .with("Sec-WebSocket-Version", SUPPORTED_VERSION),
        ),
        _ => None,
    }
}
