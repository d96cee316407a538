//! Chunked transfer coding (RFC 9112 §7.1).

use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Write};

/// Longest chunk-size line accepted (size, extensions and CRLF).
const MAX_SIZE_LINE: usize = 1024;

/// Writes a body as a sequence of chunks.
///
/// Every `write` call emits exactly one chunk; [`ChunkedWriter::finish`] writes
/// the terminal zero-length chunk.
pub struct ChunkedWriter<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(writer: W) -> Self {
        ChunkedWriter { writer }
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write!(self.writer, "{:x}\r\n", data.len())?;
        self.writer.write_all(data)?;
        self.writer.write_all(b"\r\n")
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.writer.write_all(b"0\r\n\r\n")?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailer,
    Complete,
}

/// Incremental decoder for a chunked request body.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder { state: State::Size }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Consume as much of `buf` as possible and return the decoded payload.
    ///
    /// Returns `Ok(None)` when more input is needed. Once the terminal chunk
    /// and trailers are consumed, [`is_complete`](Self::is_complete) is true
    /// and bytes after the body are left in `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > MAX_SIZE_LINE {
                            return Err(DecodeError::InvalidChunkSize(
                                String::from_utf8_lossy(&buf[..16]).into_owned(),
                            ));
                        }
                        return Ok(None);
                    };
                    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| DecodeError::InvalidChunkSize(size_str.to_string()))?;
                    buf.advance(pos + 2);
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data { remaining: size }
                    };
                }
                State::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len());
                    let data = buf.split_to(take).freeze();
                    self.state = if take == remaining {
                        State::DataEnd
                    } else {
                        State::Data {
                            remaining: remaining - take,
                        }
                    };
                    return Ok(Some(data));
                }
                State::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(DecodeError::MissingChunkTerminator);
                    }
                    buf.advance(2);
                    self.state = State::Size;
                }
                State::Trailer => {
                    let Some(pos) = find_crlf(buf) else {
                        return Ok(None);
                    };
                    // Trailer fields are skipped; an empty line ends the body.
                    buf.advance(pos + 2);
                    if pos == 0 {
                        self.state = State::Complete;
                    }
                }
                State::Complete => return Ok(None),
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
