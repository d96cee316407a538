//! WebSocket framing (RFC 6455 §5).
//!
//! Client frames must be masked; server frames are written unmasked.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => return Err(FrameError::InvalidOpcode(other)),
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Close frame carrying a status code and a reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.extend_from_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == OpCode::Close && self.payload.len() >= 2)
            .then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Serialize as an unmasked server frame.
    pub fn encode(&self) -> BytesMut {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(len + 10);
        let first = if self.fin { 0x80 } else { 0 } | self.opcode.as_u8();
        out.put_u8(first);
        if len < 126 {
            out.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(127);
            out.put_u64(len as u64);
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Incremental decoder for client frames.
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Decode one frame from `buf`, or `Ok(None)` if it is not complete yet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let b1 = buf[1];
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F)?;
        if b1 & 0x80 == 0 {
            return Err(FrameError::UnmaskedClientFrame);
        }
        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };
        if opcode.is_control() && (!fin || len > 125) {
            return Err(FrameError::InvalidControlFrame);
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                limit: self.max_payload,
            });
        }
        let len = len as usize;
        if buf.len() < offset + 4 + len {
            return Ok(None);
        }
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        buf.advance(offset);
        let mut payload = buf.split_to(len);
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Bytes),
    Binary(Bytes),
}

impl Message {
    pub fn payload(&self) -> &Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }
}

/// Reassembles fragmented data messages.
#[derive(Debug)]
pub struct MessageAssembler {
    max_payload: usize,
    kind: Option<OpCode>,
    buf: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            kind: None,
            buf: BytesMut::new(),
        }
    }

    /// Add a data frame; returns the message once its final frame arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match (frame.opcode, self.kind) {
            (OpCode::Text | OpCode::Binary, None) => {
                if frame.fin {
                    return finish(frame.opcode, frame.payload).map(Some);
                }
                self.kind = Some(frame.opcode);
                self.buf.extend_from_slice(&frame.payload);
                Ok(None)
            }
            (OpCode::Continuation, Some(kind)) => {
                if self.buf.len() + frame.payload.len() > self.max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        limit: self.max_payload,
                    });
                }
                self.buf.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                self.kind = None;
                let data = std::mem::take(&mut self.buf).freeze();
                finish(kind, data).map(Some)
            }
            _ => Err(FrameError::UnexpectedContinuation),
        }
    }
}

fn finish(kind: OpCode, data: Bytes) -> Result<Message, FrameError> {
    if kind == OpCode::Text {
        std::str::from_utf8(&data).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Message::Text(data))
    } else {
        Ok(Message::Binary(data))
    }
}
