//! Progressive request body decoding.
//!
//! A [`BodyDecoder`] is created when the head of a POST, PUT or PATCH request
//! is decoded and is fed every body fragment as it arrives. Three shapes are
//! supported:
//!
//! - `application/x-www-form-urlencoded`: buffered (bounded) then parsed
//! - `multipart/form-data`: parsed as a stream; uploaded files larger than the
//!   spill threshold are written to a temporary file instead of memory
//! - anything else: kept as a raw body, spilled to disk above the threshold
//!
//! Decoding errors never interrupt the connection. The first error is kept and
//! reported by [`BodyDecoder::finish`]; the dispatcher hands it to the error
//! handlers. Temporary files are deleted when the owning value is dropped.

use crate::config::BodyConfig;
use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Largest header block accepted for a single multipart part.
const MAX_PART_HEADERS: usize = 8 * 1024;

/// Body bytes held in memory or in a temporary file.
#[derive(Debug)]
pub enum BodyData {
    Memory(Bytes),
    File { file: NamedTempFile, len: u64 },
}

impl BodyData {
    pub fn len(&self) -> u64 {
        match self {
            BodyData::Memory(b) => b.len() as u64,
            BodyData::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, BodyData::Memory(_))
    }

    /// Path of the spill file, if the data lives on disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            BodyData::Memory(_) => None,
            BodyData::File { file, .. } => Some(file.path()),
        }
    }

    pub fn reader(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        match self {
            BodyData::Memory(b) => Ok(Box::new(Cursor::new(b.as_ref()))),
            BodyData::File { file, .. } => {
                let mut f: File = file.reopen()?;
                f.seek(SeekFrom::Start(0))?;
                Ok(Box::new(f))
            }
        }
    }

    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        match self {
            BodyData::Memory(b) => Ok(b.to_vec()),
            BodyData::File { len, .. } => {
                let mut out = Vec::with_capacity(*len as usize);
                self.reader()?.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// A file received in a `multipart/form-data` body.
#[derive(Debug)]
pub struct FileUpload {
    /// Form field name
    pub field: String,
    /// File name announced by the client
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: BodyData,
}

impl FileUpload {
    pub fn size(&self) -> u64 {
        self.data.len()
    }

    pub fn bytes(&self) -> io::Result<Vec<u8>> {
        self.data.to_vec()
    }
}

/// Accumulates bytes in memory and moves them to a temporary file once
/// `threshold` is crossed.
struct SpillBuffer {
    mem: BytesMut,
    file: Option<NamedTempFile>,
    len: u64,
    threshold: usize,
}

impl SpillBuffer {
    fn new(threshold: usize) -> Self {
        Self {
            mem: BytesMut::new(),
            file: None,
            len: 0,
            threshold,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.len += data.len() as u64;
        if let Some(file) = self.file.as_mut() {
            return file.write_all(data);
        }
        if self.mem.len() + data.len() <= self.threshold {
            self.mem.extend_from_slice(data);
            return Ok(());
        }
        let mut file = NamedTempFile::new()?;
        file.write_all(&self.mem)?;
        file.write_all(data)?;
        self.mem = BytesMut::new();
        tracing::debug!(path = %file.path().display(), bytes = self.len, "Spilled request body to disk");
        self.file = Some(file);
        Ok(())
    }

    fn finish(self) -> io::Result<BodyData> {
        match self.file {
            Some(mut file) => {
                file.flush()?;
                Ok(BodyData::File {
                    file,
                    len: self.len,
                })
            }
            None => Ok(BodyData::Memory(self.mem.freeze())),
        }
    }
}

/// Everything extracted from a request body.
#[derive(Debug, Default)]
pub struct DecodedBody {
    /// Url-encoded fields and non-file multipart fields
    pub form: HashMap<String, Vec<String>>,
    pub uploads: Vec<FileUpload>,
    /// The raw body, for non-multipart requests
    pub raw: Option<BodyData>,
}

enum Kind {
    Form { buf: BytesMut, limit: usize },
    Multipart(MultipartParser),
    Raw(SpillBuffer),
}

/// Incremental decoder for one request body.
pub struct BodyDecoder {
    kind: Kind,
    error: Option<DecodeError>,
    received: u64,
}

impl BodyDecoder {
    /// Whether requests with `method` get a body decoder.
    pub fn accepts_body(method: &http::Method) -> bool {
        matches!(
            *method,
            http::Method::POST | http::Method::PUT | http::Method::PATCH
        )
    }

    /// Pick the decoder matching the request `Content-Type`.
    pub fn for_content_type(content_type: Option<&str>, config: &BodyConfig) -> Self {
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let mut error = None;
        let kind = match mime.as_str() {
            "application/x-www-form-urlencoded" => Kind::Form {
                buf: BytesMut::new(),
                limit: config.max_form_size,
            },
            "multipart/form-data" => match content_type.and_then(boundary) {
                Some(b) => Kind::Multipart(MultipartParser::new(
                    &b,
                    config.spill_threshold,
                    config.max_form_size,
                )),
                None => {
                    error = Some(DecodeError::Multipart("missing boundary".to_string()));
                    Kind::Raw(SpillBuffer::new(config.spill_threshold))
                }
            },
            _ => Kind::Raw(SpillBuffer::new(config.spill_threshold)),
        };
        BodyDecoder {
            kind,
            error,
            received: 0,
        }
    }

    /// Feed the next body fragment. Never fails: errors are kept for `finish`.
    pub fn offer(&mut self, data: &[u8]) {
        self.received += data.len() as u64;
        if self.error.is_some() || data.is_empty() {
            return;
        }
        let res = match &mut self.kind {
            Kind::Form { buf, limit } => {
                if buf.len() + data.len() > *limit {
                    Err(DecodeError::FormTooLarge { limit: *limit })
                } else {
                    buf.extend_from_slice(data);
                    Ok(())
                }
            }
            Kind::Multipart(parser) => parser.feed(data),
            Kind::Raw(spill) => spill.write(data).map_err(DecodeError::from),
        };
        if let Err(e) = res {
            tracing::debug!(error = %e, "Deferring request body error");
            self.error = Some(e);
        }
    }

    /// Bytes offered so far, including bytes ignored after an error.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Complete decoding after the last fragment.
    pub fn finish(self) -> Result<DecodedBody, DecodeError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        match self.kind {
            Kind::Form { buf, .. } => {
                let bytes = buf.freeze();
                let form = parse_form(&bytes);
                Ok(DecodedBody {
                    form,
                    uploads: Vec::new(),
                    raw: Some(BodyData::Memory(bytes)),
                })
            }
            Kind::Multipart(parser) => parser.finish(),
            Kind::Raw(spill) => Ok(DecodedBody {
                raw: Some(spill.finish()?),
                ..DecodedBody::default()
            }),
        }
    }
}

/// Parse `application/x-www-form-urlencoded` pairs, keeping repeated keys.
pub fn parse_form(data: &[u8]) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(data) {
        out.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    out
}

fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Epilogue,
}

enum PartSink {
    Field { name: String, value: Vec<u8> },
    File {
        field: String,
        file_name: String,
        content_type: Option<String>,
        spill: SpillBuffer,
    },
    Ignored,
}

/// Streaming `multipart/form-data` parser.
struct MultipartParser {
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: PartState,
    current: Option<PartSink>,
    threshold: usize,
    field_budget: usize,
    decoded: DecodedBody,
}

impl MultipartParser {
    fn new(boundary: &str, threshold: usize, field_budget: usize) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        // The first delimiter is not preceded by CRLF; pretend it is.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n");
        Self {
            delimiter,
            buf,
            state: PartState::Preamble,
            current: None,
            threshold,
            field_budget,
            decoded: DecodedBody::default(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                PartState::Preamble => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        self.buf.advance(pos + self.delimiter.len());
                        self.state = PartState::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.advance(self.buf.len() - keep);
                        }
                        return Ok(());
                    }
                },
                PartState::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] == b"--" {
                        self.buf.clear();
                        self.state = PartState::Epilogue;
                    } else if &self.buf[..2] == b"\r\n" {
                        self.buf.advance(2);
                        self.state = PartState::Headers;
                    } else {
                        return Err(DecodeError::Multipart(
                            "garbage after boundary".to_string(),
                        ));
                    }
                }
                PartState::Headers => {
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                        self.current = Some(PartSink::Ignored);
                        self.state = PartState::Body;
                        continue;
                    }
                    let Some(pos) = find(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > MAX_PART_HEADERS {
                            return Err(DecodeError::Multipart(
                                "part headers too large".to_string(),
                            ));
                        }
                        return Ok(());
                    };
                    let block = self.buf.split_to(pos + 4);
                    self.current = Some(self.open_part(&block[..pos])?);
                    self.state = PartState::Body;
                }
                PartState::Body => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        let data = self.buf.split_to(pos);
                        self.write_part(&data)?;
                        self.buf.advance(self.delimiter.len());
                        self.close_part()?;
                        self.state = PartState::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            let data = self.buf.split_to(self.buf.len() - keep);
                            self.write_part(&data)?;
                        }
                        return Ok(());
                    }
                },
                PartState::Epilogue => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    fn open_part(&self, headers: &[u8]) -> Result<PartSink, DecodeError> {
        let text = std::str::from_utf8(headers)
            .map_err(|_| DecodeError::Multipart("part headers are not UTF-8".to_string()))?;
        let mut name = None;
        let mut file_name = None;
        let mut content_type = None;
        for line in text.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    let Some((k, v)) = param.trim().split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v),
                        "filename" => file_name = Some(v),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }
        Ok(match (name, file_name) {
            (Some(field), Some(file_name)) => PartSink::File {
                field,
                file_name,
                content_type,
                spill: SpillBuffer::new(self.threshold),
            },
            (Some(name), None) => PartSink::Field {
                name,
                value: Vec::new(),
            },
            (None, _) => PartSink::Ignored,
        })
    }

    fn write_part(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        match self.current.as_mut() {
            Some(PartSink::Field { value, .. }) => {
                if data.len() > self.field_budget {
                    return Err(DecodeError::FormTooLarge {
                        limit: self.field_budget,
                    });
                }
                self.field_budget -= data.len();
                value.extend_from_slice(data);
                Ok(())
            }
            Some(PartSink::File { spill, .. }) => spill.write(data).map_err(DecodeError::from),
            Some(PartSink::Ignored) | None => Ok(()),
        }
    }

    fn close_part(&mut self) -> Result<(), DecodeError> {
        match self.current.take() {
            Some(PartSink::Field { name, value }) => {
                let value = String::from_utf8_lossy(&value).into_owned();
                self.decoded.form.entry(name).or_default().push(value);
            }
            Some(PartSink::File {
                field,
                file_name,
                content_type,
                spill,
            }) => {
                self.decoded.uploads.push(FileUpload {
                    field,
                    file_name,
                    content_type,
                    data: spill.finish()?,
                });
            }
            Some(PartSink::Ignored) | None => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<DecodedBody, DecodeError> {
        if self.state != PartState::Epilogue {
            return Err(DecodeError::Multipart(
                "body ended before the closing boundary".to_string(),
            ));
        }
        Ok(self.decoded)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----sagewireBoundary";

    fn multipart_body() -> Vec<u8> {
        format!(
            "preamble\r\n--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nHello\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nline one\r\nline two\r\n--{b}--\r\nepilogue",
            b = BOUNDARY
        )
        .into_bytes()
    }

    fn config(threshold: usize) -> BodyConfig {
        BodyConfig {
            spill_threshold: threshold,
            ..BodyConfig::default()
        }
    }

    fn content_type() -> String {
        format!("multipart/form-data; boundary=\"{BOUNDARY}\"")
    }

    #[test]
    fn test_multipart_in_one_fragment() {
        let mut dec = BodyDecoder::for_content_type(Some(&content_type()), &config(1024));
        dec.offer(&multipart_body());
        let body = dec.finish().unwrap();
        assert_eq!(body.form["title"], vec!["Hello".to_string()]);
        assert_eq!(body.uploads.len(), 1);
        let up = &body.uploads[0];
        assert_eq!(up.field, "doc");
        assert_eq!(up.file_name, "a.txt");
        assert_eq!(up.content_type.as_deref(), Some("text/plain"));
        assert_eq!(up.bytes().unwrap(), b"line one\r\nline two");
    }

    #[test]
    fn test_multipart_byte_by_byte_spills_large_file() {
        let mut dec = BodyDecoder::for_content_type(Some(&content_type()), &config(4));
        for b in multipart_body() {
            dec.offer(&[b]);
        }
        let body = dec.finish().unwrap();
        let up = &body.uploads[0];
        assert!(!up.data.is_in_memory());
        let path = up.data.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(up.size(), 18);
        assert_eq!(up.bytes().unwrap(), b"line one\r\nline two");
        drop(body);
        assert!(!path.exists());
    }

    #[test]
    fn test_truncated_multipart_is_deferred_error() {
        let mut dec = BodyDecoder::for_content_type(Some(&content_type()), &config(1024));
        let body = multipart_body();
        dec.offer(&body[..body.len() / 2]);
        assert!(matches!(dec.finish(), Err(DecodeError::Multipart(_))));
    }

    #[test]
    fn test_missing_boundary() {
        let dec = BodyDecoder::for_content_type(Some("multipart/form-data"), &config(1024));
        assert!(matches!(dec.finish(), Err(DecodeError::Multipart(_))));
    }

    #[test]
    fn test_urlencoded_form() {
        let mut dec = BodyDecoder::for_content_type(
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            &config(1024),
        );
        dec.offer(b"tag=a&tag=b&name=J%C3%BCrgen+X");
        let body = dec.finish().unwrap();
        assert_eq!(body.form["tag"], vec!["a", "b"]);
        assert_eq!(body.form["name"], vec!["Jürgen X"]);
    }

    #[test]
    fn test_urlencoded_form_limit() {
        let cfg = BodyConfig {
            max_form_size: 8,
            ..BodyConfig::default()
        };
        let mut dec =
            BodyDecoder::for_content_type(Some("application/x-www-form-urlencoded"), &cfg);
        dec.offer(b"a=1234");
        dec.offer(b"&b=5678");
        assert_eq!(dec.received(), 13);
        assert!(matches!(
            dec.finish(),
            Err(DecodeError::FormTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn test_raw_body_spills() {
        let mut dec = BodyDecoder::for_content_type(Some("application/json"), &config(4));
        dec.offer(b"{\"a\":");
        dec.offer(b"1}");
        let body = dec.finish().unwrap();
        let raw = body.raw.unwrap();
        assert!(!raw.is_in_memory());
        assert_eq!(raw.to_vec().unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_only_mutating_methods_get_decoders() {
        assert!(BodyDecoder::accepts_body(&http::Method::POST));
        assert!(BodyDecoder::accepts_body(&http::Method::PUT));
        assert!(!BodyDecoder::accepts_body(&http::Method::GET));
        assert!(!BodyDecoder::accepts_body(&http::Method::DELETE));
    }
}
