//! Plain and TLS connection halves.
//!
//! A connection is split into a [`WireReader`], owned by the connection
//! coroutine, and a shared [`WireWriter`], which WebSocket publishers on
//! other coroutines also write through. For TLS both halves share the rustls
//! session behind one lock; socket reads happen outside of it so a blocked
//! reader never stalls a publisher.
//!
//! The locks are `may` mutexes: a writer parked on a peer that stopped reading
//! holds the lock, and every other writer of that connection parks its
//! coroutine behind it instead of blocking a worker thread.

use crate::config::TlsConfig;
use crate::dispatcher::FrameSink;
use crate::error::EngineError;
use crate::websocket::Frame;
use bytes::BytesMut;
use may::net::TcpStream;
use may::sync::{Mutex, MutexGuard};
use rustls::{ServerConfig, ServerConnection};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

const READ_CHUNK: usize = 8 * 1024;

/// Build a rustls server configuration from PEM certificate chain and key files.
pub fn load_tls_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, EngineError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&tls.cert_path)
        .map_err(|e| EngineError::Tls(format!("open {}: {e}", tls.cert_path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Tls(format!("parse certificates: {e}")))?;
    let key = PrivateKeyDer::from_pem_file(&tls.key_path)
        .map_err(|e| EngineError::Tls(format!("load key {}: {e}", tls.key_path.display())))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| EngineError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EngineError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

struct TlsState {
    conn: ServerConnection,
    socket: TcpStream,
}

impl TlsState {
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read half of a connection.
pub struct WireReader {
    socket: TcpStream,
    tls: Option<Arc<Mutex<TlsState>>>,
    scratch: Vec<u8>,
    plain: Vec<u8>,
}

/// Write half of a connection, shareable across coroutines.
///
/// Each call writes under the connection's lock, so a frame or a response
/// head is never interleaved with another writer's bytes.
pub struct WireWriter {
    kind: WriterKind,
}

enum WriterKind {
    Plain(Mutex<TcpStream>),
    Tls(Arc<Mutex<TlsState>>),
}

/// Split a plain TCP connection.
pub fn split_plain(stream: TcpStream) -> io::Result<(WireReader, Arc<WireWriter>)> {
    let write_half = stream.try_clone()?;
    let writer = WireWriter {
        kind: WriterKind::Plain(Mutex::new(write_half)),
    };
    Ok((WireReader::new(stream, None), Arc::new(writer)))
}

/// Split a TLS connection; the handshake runs on the first reads.
pub fn split_tls(stream: TcpStream, config: Arc<ServerConfig>) -> io::Result<(WireReader, Arc<WireWriter>)> {
    let conn = ServerConnection::new(config).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let state = Arc::new(Mutex::new(TlsState {
        conn,
        socket: stream.try_clone()?,
    }));
    let writer = WireWriter {
        kind: WriterKind::Tls(Arc::clone(&state)),
    };
    Ok((WireReader::new(stream, Some(state)), Arc::new(writer)))
}

impl WireReader {
    fn new(socket: TcpStream, tls: Option<Arc<Mutex<TlsState>>>) -> Self {
        let plain = if tls.is_some() { vec![0; READ_CHUNK] } else { Vec::new() };
        Self {
            socket,
            tls,
            scratch: vec![0; READ_CHUNK],
            plain,
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Append received application bytes to `buf`.
    ///
    /// `Ok(0)` means the peer closed the connection.
    pub fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let Some(tls) = &self.tls else {
            let n = self.socket.read(&mut self.scratch)?;
            buf.extend_from_slice(&self.scratch[..n]);
            return Ok(n);
        };

        loop {
            let n = self.socket.read(&mut self.scratch)?;
            if n == 0 {
                return Ok(0);
            }
            let mut state = lock(tls);
            let mut incoming = &self.scratch[..n];
            let mut received = 0;
            let mut closed = false;
            while !incoming.is_empty() {
                state.conn.read_tls(&mut incoming)?;
                if let Err(e) = state.conn.process_new_packets() {
                    // the peer should still see the alert
                    if let Err(alert) = state.flush_tls() {
                        tracing::debug!(error = %alert, "Cannot send TLS alert");
                    }
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                loop {
                    match state.conn.reader().read(&mut self.plain) {
                        Ok(0) => {
                            closed = true;
                            break;
                        }
                        Ok(m) => {
                            buf.extend_from_slice(&self.plain[..m]);
                            received += m;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            state.flush_tls()?;
            if received > 0 || closed {
                return Ok(received);
            }
        }
    }
}

impl WireWriter {
    /// Send a TLS close_notify where applicable and shut the socket down.
    pub fn shutdown(&self) {
        let result = match &self.kind {
            WriterKind::Plain(socket) => lock(socket).shutdown(Shutdown::Both),
            WriterKind::Tls(state) => {
                let mut state = lock(state);
                state.conn.send_close_notify();
                // close_notify is advisory; the socket goes down regardless
                if let Err(e) = state.flush_tls() {
                    tracing::debug!(error = %e, "Cannot send close_notify");
                }
                state.socket.shutdown(Shutdown::Both)
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Socket shutdown failed");
        }
    }

    fn write_locked(&self, data: &[u8]) -> io::Result<()> {
        match &self.kind {
            WriterKind::Plain(socket) => lock(socket).write_all(data),
            WriterKind::Tls(state) => {
                let mut state = lock(state);
                state.conn.writer().write_all(data)?;
                state.flush_tls()
            }
        }
    }
}

impl Write for &WireWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_locked(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.kind {
            WriterKind::Plain(socket) => lock(socket).flush(),
            WriterKind::Tls(state) => lock(state).flush_tls(),
        }
    }
}

impl FrameSink for WireWriter {
    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        self.write_locked(&frame.encode())
    }
}
