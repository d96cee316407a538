//! Per-connection handler.
//!
//! Each accepted socket is served by one coroutine running a [`Connection`].
//! Requests are decoded and answered strictly in order. A successful
//! WebSocket handshake switches the connection to frame mode for the rest of
//! its life. Whatever ends the connection (close frame, peer disconnect, idle
//! timeout, I/O error), dropping the `Connection` removes it from the channel
//! registry.

use crate::config::EngineConfig;
use crate::context::Context;
use crate::dispatcher::{Completion, Dispatcher, FrameSink};
use crate::error::DecodeError;
use crate::ids::ConnectionId;
use crate::result::{HttpResult, Outcome};
use crate::server::body::BodyDecoder;
use crate::server::request::{Fragment, HeaderVec, RequestDecoder, RequestHead};
use crate::server::response::{write_continue, Persistence, ResponseWriter};
use crate::server::transport::{WireReader, WireWriter};
use crate::session::SessionCodec;
use crate::websocket::handshake::{self, Handshake};
use crate::websocket::{Frame, FrameDecoder, MessageAssembler, OpCode};
use bytes::BytesMut;
use http::Method;
use may::sync::mpsc;
use smallvec::smallvec;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared by every connection of a server.
pub(crate) struct Shared {
    pub dispatcher: Arc<Dispatcher>,
    pub config: EngineConfig,
    pub sessions: SessionCodec,
}

enum Next {
    Continue,
    Close,
    Upgrade(String),
}

pub(crate) struct Connection {
    id: ConnectionId,
    shared: Arc<Shared>,
    reader: WireReader,
    writer: Arc<WireWriter>,
    remote: Option<SocketAddr>,
    secure: bool,
    upgraded: Option<String>,
}

impl Connection {
    pub fn new(
        shared: Arc<Shared>,
        reader: WireReader,
        writer: Arc<WireWriter>,
        remote: Option<SocketAddr>,
        secure: bool,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            shared,
            reader,
            writer,
            remote,
            secure,
            upgraded: None,
        }
    }

    /// Serve requests until the connection ends.
    pub fn serve(mut self) {
        debug!(connection_id = %self.id, remote = ?self.remote, secure = self.secure, "Connection open");
        if let Err(e) = self.reader.set_read_timeout(self.shared.config.idle_timeout()) {
            warn!(connection_id = %self.id, error = %e, "Cannot set idle timeout");
        }

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut decoder = RequestDecoder::new(self.shared.config.body.max_head_size);
        loop {
            match self.exchange(&mut buf, &mut decoder) {
                Ok(Next::Continue) => {}
                Ok(Next::Close) => break,
                Ok(Next::Upgrade(uri)) => {
                    self.frames(uri, buf);
                    break;
                }
                Err(e) => {
                    self.log_io_error(&e);
                    break;
                }
            }
        }
        self.writer.shutdown();
    }

    fn log_io_error(&self, e: &io::Error) {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                debug!(connection_id = %self.id, "Idle timeout")
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                debug!(connection_id = %self.id, error = %e, "Peer went away")
            }
            _ => warn!(connection_id = %self.id, error = %e, "Connection error"),
        }
    }

    /// Read more bytes; false once the peer closed.
    fn fill(&mut self, buf: &mut BytesMut) -> io::Result<bool> {
        Ok(self.reader.read_into(buf)? > 0)
    }

    fn exchange(&mut self, buf: &mut BytesMut, decoder: &mut RequestDecoder) -> io::Result<Next> {
        let head = loop {
            match decoder.decode(buf) {
                Ok(Some(Fragment::Start(head))) => break head,
                Ok(Some(_)) => return Ok(Next::Close),
                Ok(None) => {
                    if !self.fill(buf)? {
                        return Ok(Next::Close);
                    }
                }
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "Malformed request head");
                    self.reject_head(e)?;
                    return Ok(Next::Close);
                }
            }
        };

        let handshake = handshake::negotiate(&head, &self.shared.config.websocket.subprotocols);
        if let Handshake::Ok(accepted) = &handshake {
            // frames start after the body the upgrade request declared, if any
            if !self.skip_body(buf, decoder)? {
                return Ok(Next::Close);
            }
            let mut out: &WireWriter = &self.writer;
            handshake::write_switching_protocols(&mut out, accepted)?;
            return Ok(Next::Upgrade(accepted.uri.clone()));
        }
        let rejection = handshake::rejection(&handshake);
        if let Handshake::Error(e) = &handshake {
            warn!(connection_id = %self.id, error = %e, "WebSocket handshake rejected");
        }

        let expects_continue = head.expects_continue();
        let mut ctx = self.context(head);
        let mut body = (rejection.is_none() && BodyDecoder::accepts_body(ctx.method()))
            .then(|| BodyDecoder::for_content_type(ctx.header("content-type"), &self.shared.config.body));
        if expects_continue && rejection.is_none() {
            let mut out: &WireWriter = &self.writer;
            write_continue(&mut out)?;
        }

        let mut framing_broken = false;
        loop {
            match decoder.decode(buf) {
                Ok(Some(Fragment::Content(data))) => {
                    if let Some(b) = body.as_mut() {
                        b.offer(&data);
                    }
                }
                Ok(Some(Fragment::Last(data))) => {
                    if let Some(b) = body.as_mut() {
                        b.offer(&data);
                    }
                    break;
                }
                Ok(Some(Fragment::Start(_))) => return Ok(Next::Close),
                Ok(None) => {
                    if !self.fill(buf)? {
                        return Ok(Next::Close);
                    }
                }
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "Malformed request body framing");
                    ctx.set_decode_error(e);
                    framing_broken = true;
                    body = None;
                    break;
                }
            }
        }
        if let Some(b) = body {
            match b.finish() {
                Ok(decoded) => ctx.set_body(decoded),
                Err(e) => ctx.set_decode_error(e),
            }
        }

        let persistence = match rejection {
            Some(result) => self.respond(&ctx, result, false)?,
            None => self.dispatch(ctx)?,
        };
        Ok(match persistence {
            Persistence::KeepAlive if !framing_broken => Next::Continue,
            _ => Next::Close,
        })
    }

    /// Discard the body of the current request; false if the peer closed first.
    fn skip_body(&mut self, buf: &mut BytesMut, decoder: &mut RequestDecoder) -> io::Result<bool> {
        loop {
            match decoder.decode(buf) {
                Ok(Some(Fragment::Last(_))) => return Ok(true),
                Ok(Some(_)) => {}
                Ok(None) => {
                    if !self.fill(buf)? {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }

    fn context(&self, head: RequestHead) -> Context {
        Context::from_head(head, self.id, self.remote, self.secure, &self.shared.sessions)
    }

    fn dispatch(&self, mut ctx: Context) -> io::Result<Persistence> {
        let dispatcher = &self.shared.dispatcher;
        match dispatcher.dispatch(&mut ctx) {
            Outcome::Ready(result) => self.respond(&ctx, result, true),
            Outcome::Async(deferred) => {
                let (tx, rx) = mpsc::channel();
                let request_id = ctx.request_id;
                dispatcher.bridge().submit(ctx, deferred, move |done| {
                    if tx.send(done).is_err() {
                        debug!(request_id = %request_id, "Connection gone before async completion");
                    }
                });
                match rx.recv() {
                    Ok(Completion {
                        context,
                        outcome: Ok(result),
                    }) => self.respond(&context, result, true),
                    Ok(Completion {
                        context,
                        outcome: Err(failure),
                    }) => {
                        error!(request_id = %request_id, error = %failure, "Async computation failed");
                        self.respond(&context, HttpResult::internal_server_error(&failure), false)
                    }
                    Err(_) => {
                        error!(request_id = %request_id, "Async computation never completed");
                        Ok(Persistence::Close)
                    }
                }
            }
        }
    }

    fn respond(&self, ctx: &Context, result: HttpResult, handle_flash_and_session: bool) -> io::Result<Persistence> {
        info!(
            request_id = %ctx.request_id,
            connection_id = %self.id,
            method = %ctx.method(),
            path = %ctx.path(),
            status = result.status.as_u16(),
            "Request complete"
        );
        let config = &self.shared.config;
        let writer = ResponseWriter::new(
            self.shared.dispatcher.content_engine().as_ref(),
            &self.shared.sessions,
            &config.server_name,
        );
        let mut out: &WireWriter = &self.writer;
        writer.write(&mut out, ctx, result, handle_flash_and_session)
    }

    /// Answer an undecodable head through the error handlers before closing.
    fn reject_head(&self, error: DecodeError) -> io::Result<()> {
        let headers: HeaderVec = smallvec![("Connection".to_string(), "close".to_string())];
        let ctx = Context::new(Method::GET, "/", headers);
        let result = self
            .shared
            .dispatcher
            .on_error(&ctx, None, &anyhow::Error::new(error));
        self.respond(&ctx, result, false).map(|_| ())
    }

    /// Frame mode after a successful upgrade.
    fn frames(&mut self, uri: String, mut buf: BytesMut) {
        let dispatcher = Arc::clone(&self.shared.dispatcher);
        let channels = dispatcher.channels();
        let sink: Arc<dyn FrameSink> = Arc::clone(&self.writer) as Arc<dyn FrameSink>;
        channels.add_web_socket(&uri, self.id, sink);
        self.upgraded = Some(uri.clone());

        let max = self.shared.config.websocket.max_payload;
        let mut decoder = FrameDecoder::new(max);
        let mut messages = MessageAssembler::new(max);
        loop {
            let frame = match decoder.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => match self.reader.read_into(&mut buf) {
                    Ok(0) => return,
                    Ok(_) => continue,
                    Err(e) => {
                        self.log_io_error(&e);
                        return;
                    }
                },
                Err(e) => {
                    warn!(connection_id = %self.id, uri = %uri, error = %e, "Invalid WebSocket frame");
                    self.send(&Frame::close(e.close_code(), ""));
                    return;
                }
            };
            match frame.opcode {
                OpCode::Close => {
                    channels.remove_web_socket(&uri, self.id);
                    self.send(&Frame::new(OpCode::Close, frame.payload));
                    return;
                }
                OpCode::Ping => self.send(&Frame::pong(frame.payload)),
                OpCode::Pong => {}
                OpCode::Text | OpCode::Binary | OpCode::Continuation => match messages.push(frame) {
                    Ok(Some(message)) => channels.received(&uri, self.id, message.payload()),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(connection_id = %self.id, uri = %uri, error = %e, "Invalid WebSocket message");
                        self.send(&Frame::close(e.close_code(), ""));
                        return;
                    }
                },
            }
        }
    }

    fn send(&self, frame: &Frame) {
        if let Err(e) = self.writer.send_frame(frame) {
            debug!(connection_id = %self.id, error = %e, "Cannot write WebSocket frame");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(uri) = self.upgraded.take() {
            self.shared.dispatcher.channels().remove_web_socket(&uri, self.id);
        }
        debug!(connection_id = %self.id, "Connection closed");
    }
}
