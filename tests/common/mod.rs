#![allow(dead_code)]

use sagewire::config::EngineConfig;
use sagewire::dispatcher::Dispatcher;
use sagewire::router::RouteTable;
use sagewire::server::{EngineServer, ServerHandle};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

/// Ensures May coroutines are configured only once
static MAY_INIT: Once = Once::new();

pub fn setup_may_runtime() {
    MAY_INIT.call_once(|| {
        may::config().set_stack_size(0x8000);
    });
}

/// Running server on an ephemeral loopback port, stopped on drop.
pub struct TestServer {
    handle: Option<ServerHandle>,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
}

impl TestServer {
    pub fn start(routes: RouteTable) -> Self {
        Self::start_with(routes, |_| {})
    }

    pub fn start_with<F>(routes: RouteTable, configure: F) -> Self
    where
        F: FnOnce(&mut EngineConfig),
    {
        setup_may_runtime();
        let mut config = EngineConfig {
            bind_address: "127.0.0.1".to_string(),
            http_port: Some(0),
            ..EngineConfig::default()
        };
        configure(&mut config);
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(routes)));
        let handle = EngineServer::new(config, Arc::clone(&dispatcher))
            .start()
            .unwrap();
        handle.wait_ready().unwrap();
        let addr = handle.http_addr().unwrap();
        Self {
            handle: Some(handle),
            addr,
            dispatcher,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

/// Read until the peer closes or stays silent for `idle`.
pub fn read_all(stream: &mut TcpStream, idle: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(idle)).unwrap();
    let mut buf = Vec::new();
    loop {
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("read error: {:?}", e),
        }
    }
    buf
}

pub fn send_raw(addr: &SocketAddr, req: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(req).unwrap();
    read_all(&mut stream, Duration::from_millis(500))
}

pub fn send_request(addr: &SocketAddr, req: &str) -> Response {
    let raw = send_raw(addr, req.as_bytes());
    parse_responses(&raw)
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("no response in {:?}", String::from_utf8_lossy(&raw)))
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split raw bytes into the responses they contain, decoding chunked bodies.
///
/// Bodiless statuses and responses to HEAD are recognized by an empty
/// remainder or a following status line.
pub fn parse_responses(mut raw: &[u8]) -> Vec<Response> {
    let mut responses = Vec::new();
    while let Some(end) = find(raw, b"\r\n\r\n") {
        let head = String::from_utf8_lossy(&raw[..end]).to_string();
        raw = &raw[end + 4..];
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let mut response = Response {
            status,
            headers,
            body: Vec::new(),
        };

        if response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            loop {
                let Some(line_end) = find(raw, b"\r\n") else {
                    break;
                };
                let size_line = String::from_utf8_lossy(&raw[..line_end]).to_string();
                let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
                raw = &raw[line_end + 2..];
                if size == 0 {
                    raw = &raw[find(raw, b"\r\n").map(|i| i + 2).unwrap_or(raw.len())..];
                    break;
                }
                response.body.extend_from_slice(&raw[..size]);
                raw = &raw[size + 2..];
            }
        } else if let Some(len) = response.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if !raw.starts_with(b"HTTP/1.") {
                let len = len.min(raw.len());
                response.body = raw[..len].to_vec();
                raw = &raw[len..];
            }
        }
        responses.push(response);
    }
    responses
}

/// Poll `check` until it holds or two seconds elapse.
pub fn eventually<F: FnMut() -> bool>(check: F) -> bool {
    eventually_within(Duration::from_secs(2), check)
}

pub fn eventually_within<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

pub mod ws {
    use super::{find, read_all};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;

    /// Minimal RFC 6455 client: masked writes, unmasked reads.
    pub struct WsClient {
        /// Response head of the handshake
        pub head: String,
        stream: TcpStream,
        pending: Vec<u8>,
    }

    impl WsClient {
        pub fn connect(addr: &SocketAddr, path: &str) -> Self {
            Self::connect_with(addr, path, "").unwrap()
        }

        /// Handshake with extra header lines; `Err` carries a non-101 response head.
        pub fn connect_with(addr: &SocketAddr, path: &str, extra: &str) -> Result<Self, String> {
            Self::connect_with_body(addr, path, extra, b"")
        }

        /// Like `connect_with`, with `body` written right after the request head.
        pub fn connect_with_body(
            addr: &SocketAddr,
            path: &str,
            extra: &str,
            body: &[u8],
        ) -> Result<Self, String> {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut req = format!(
                "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n{extra}\r\n"
            )
            .into_bytes();
            req.extend_from_slice(body);
            stream.write_all(&req).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut buf = Vec::new();
            let end = loop {
                if let Some(end) = find(&buf, b"\r\n\r\n") {
                    break end;
                }
                let mut tmp = [0u8; 1024];
                let n = stream.read(&mut tmp).unwrap();
                assert!(n > 0, "connection closed during handshake");
                buf.extend_from_slice(&tmp[..n]);
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            if !head.starts_with("HTTP/1.1 101") {
                return Err(head);
            }
            assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
            Ok(Self {
                head,
                stream,
                pending: buf[end + 4..].to_vec(),
            })
        }

        pub fn send(&mut self, opcode: u8, payload: &[u8]) {
            self.send_frame(true, opcode, payload);
        }

        pub fn send_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) {
            let mask = [0x37, 0xfa, 0x21, 0x3d];
            let mut frame = vec![if fin { 0x80 } else { 0 } | opcode];
            match payload.len() {
                n if n < 126 => frame.push(0x80 | n as u8),
                n if n <= u16::MAX as usize => {
                    frame.push(0x80 | 126);
                    frame.extend_from_slice(&(n as u16).to_be_bytes());
                }
                n => {
                    frame.push(0x80 | 127);
                    frame.extend_from_slice(&(n as u64).to_be_bytes());
                }
            }
            frame.extend_from_slice(&mask);
            frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
            self.stream.write_all(&frame).unwrap();
        }

        pub fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).unwrap();
        }

        /// Next server frame as (opcode, payload); `None` when the socket closed.
        pub fn recv(&mut self) -> Option<(u8, Vec<u8>)> {
            loop {
                if let Some((frame, used)) = parse_frame(&self.pending) {
                    self.pending.drain(..used);
                    return Some(frame);
                }
                let mut tmp = [0u8; 4096];
                match self.stream.read(&mut tmp) {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.pending.extend_from_slice(&tmp[..n]),
                }
            }
        }

        /// Close handshake: send a close frame and return the echoed one.
        pub fn close(mut self) -> Option<(u8, Vec<u8>)> {
            self.send(CLOSE, &1000u16.to_be_bytes());
            let reply = self.recv();
            let _ = read_all(&mut self.stream, Duration::from_millis(100));
            reply
        }
    }

    fn parse_frame(buf: &[u8]) -> Option<((u8, Vec<u8>), usize)> {
        if buf.len() < 2 {
            return None;
        }
        assert_eq!(buf[1] & 0x80, 0, "server frames must not be masked");
        let opcode = buf[0] & 0x0f;
        let (len, offset) = match buf[1] & 0x7f {
            126 if buf.len() >= 4 => (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4),
            127 if buf.len() >= 10 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw) as usize, 10)
            }
            126 | 127 => return None,
            n => (n as usize, 2),
        };
        if buf.len() < offset + len {
            return None;
        }
        Some(((opcode, buf[offset..offset + len].to_vec()), offset + len))
    }
}
