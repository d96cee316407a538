//! Response bodies.
//!
//! [`Renderable`] is a closed set of body shapes sharing one capability set:
//! byte length (`-1` when unknown), MIME type, whether the body must be sent
//! chunked, whether a content serializer must run first, and rendering to a
//! byte stream.
//!
//! Renderables built from in-memory data render identically every time; JSON
//! nodes memoize their serialized bytes so that `length()` and `render()`
//! agree. A [`Renderable::Stream`] can be rendered only once.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

pub const MIME_HTML: &str = "text/html";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_JSON: &str = "application/json";
pub const MIME_XML: &str = "application/xml";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

pub enum Renderable {
    /// No body
    Empty,
    Bytes {
        data: Bytes,
        mime: Option<String>,
    },
    Text {
        text: String,
        mime: String,
        /// The text must be passed through the serializer of `mime` first
        needs_serializer: bool,
    },
    Json {
        node: Value,
        rendered: OnceCell<Vec<u8>>,
    },
    /// An already serialized XML document
    Xml { document: String },
    File {
        path: PathBuf,
        mime: Option<String>,
    },
    Stream {
        reader: Option<Box<dyn Read + Send>>,
        length: Option<u64>,
        mime: Option<String>,
        chunked: bool,
    },
    /// A value that a content serializer turns into bytes
    Object {
        content: Value,
        serialized: Option<Vec<u8>>,
    },
}

impl fmt::Debug for Renderable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Renderable::Empty => f.write_str("Empty"),
            Renderable::Bytes { data, mime } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("mime", mime)
                .finish(),
            Renderable::Text { text, mime, .. } => f
                .debug_struct("Text")
                .field("len", &text.len())
                .field("mime", mime)
                .finish(),
            Renderable::Json { node, .. } => f.debug_tuple("Json").field(node).finish(),
            Renderable::Xml { document } => {
                f.debug_struct("Xml").field("len", &document.len()).finish()
            }
            Renderable::File { path, .. } => f.debug_tuple("File").field(path).finish(),
            Renderable::Stream {
                length, chunked, ..
            } => f
                .debug_struct("Stream")
                .field("length", length)
                .field("chunked", chunked)
                .finish(),
            Renderable::Object { content, .. } => f.debug_tuple("Object").field(content).finish(),
        }
    }
}

impl Renderable {
    /// A string body, `text/html` unless changed with [`adapt_to`](Self::adapt_to).
    pub fn text(text: impl Into<String>) -> Self {
        Renderable::Text {
            text: text.into(),
            mime: MIME_HTML.to_string(),
            needs_serializer: false,
        }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Renderable::Bytes {
            data: data.into(),
            mime: None,
        }
    }

    pub fn json(node: Value) -> Self {
        Renderable::Json {
            node,
            rendered: OnceCell::new(),
        }
    }

    pub fn xml(document: impl Into<String>) -> Self {
        Renderable::Xml {
            document: document.into(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Renderable::File {
            path: path.into(),
            mime: None,
        }
    }

    /// A body read from `reader`. Without a known length it is sent chunked.
    pub fn stream(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        Renderable::Stream {
            reader: Some(Box::new(reader)),
            length,
            mime: None,
            chunked: false,
        }
    }

    /// Force chunked transfer even if the length is known.
    pub fn chunked(mut self) -> Self {
        if let Renderable::Stream { chunked, .. } = &mut self {
            *chunked = true;
        }
        self
    }

    /// Any serializable value; rendered by the serializer matching the
    /// negotiated content type.
    pub fn object(content: Value) -> Self {
        Renderable::Object {
            content,
            serialized: None,
        }
    }

    /// Byte length of the rendered body, or `-1` when unknown.
    pub fn length(&self) -> i64 {
        match self {
            Renderable::Empty => 0,
            Renderable::Bytes { data, .. } => data.len() as i64,
            Renderable::Text { text, .. } => text.len() as i64,
            Renderable::Json { node, rendered } => {
                json_bytes(node, rendered).map_or(-1, |b| b.len() as i64)
            }
            Renderable::Xml { document } => document.len() as i64,
            Renderable::File { path, .. } => std::fs::metadata(path)
                .map(|m| m.len() as i64)
                .unwrap_or(-1),
            Renderable::Stream { length, .. } => length.map_or(-1, |l| l as i64),
            Renderable::Object { serialized, .. } => {
                serialized.as_ref().map_or(-1, |s| s.len() as i64)
            }
        }
    }

    /// MIME type of the body; `None` lets the caller decide.
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Renderable::Empty | Renderable::Object { .. } => None,
            Renderable::Bytes { mime, .. } | Renderable::Stream { mime, .. } => mime.as_deref(),
            Renderable::Text { mime, .. } => Some(mime),
            Renderable::Json { .. } => Some(MIME_JSON),
            Renderable::Xml { .. } => Some(MIME_XML),
            Renderable::File { path, mime } => mime
                .as_deref()
                .or_else(|| Some(crate::static_files::content_type(path))),
        }
    }

    /// Set the MIME type reported by this body.
    ///
    /// A text body tagged as JSON or XML needs the serializer unless its
    /// content already looks like a document of that kind.
    pub fn adapt_to(&mut self, new_mime: &str) {
        match self {
            Renderable::Text {
                text,
                mime,
                needs_serializer,
            } => {
                let trimmed = text.trim();
                *needs_serializer = if is_json(new_mime) {
                    !((trimmed.starts_with('{') && trimmed.ends_with('}'))
                        || (trimmed.starts_with('[') && trimmed.ends_with(']')))
                } else if is_xml(new_mime) {
                    !(trimmed.starts_with('<') && trimmed.ends_with('>'))
                } else {
                    false
                };
                *mime = new_mime.to_string();
            }
            Renderable::Bytes { mime, .. }
            | Renderable::Stream { mime, .. }
            | Renderable::File { mime, .. } => *mime = Some(new_mime.to_string()),
            _ => {}
        }
    }

    pub fn must_be_chunked(&self) -> bool {
        match self {
            Renderable::Stream { chunked: true, .. } => true,
            _ => self.length() < 0,
        }
    }

    pub fn require_serializer(&self) -> bool {
        match self {
            Renderable::Text {
                needs_serializer, ..
            } => *needs_serializer,
            Renderable::Object { serialized, .. } => serialized.is_none(),
            _ => false,
        }
    }

    /// The value a serializer should encode.
    pub fn content(&self) -> Option<Value> {
        match self {
            Renderable::Text { text, .. } => Some(Value::String(text.clone())),
            Renderable::Json { node, .. } => Some(node.clone()),
            Renderable::Object { content, .. } => Some(content.clone()),
            _ => None,
        }
    }

    /// Store the serializer output; later renders return exactly these bytes.
    pub fn set_serialized_form(&mut self, bytes: Vec<u8>) {
        match self {
            Renderable::Object { serialized, .. } => *serialized = Some(bytes),
            Renderable::Text {
                text,
                needs_serializer,
                ..
            } => {
                *text = String::from_utf8_lossy(&bytes).into_owned();
                *needs_serializer = false;
            }
            _ => {}
        }
    }

    /// Produce the body bytes.
    ///
    /// Fails when a file cannot be opened, a stream was already consumed, or
    /// an object was never serialized.
    pub fn render(&mut self) -> io::Result<Box<dyn Read + Send + '_>> {
        match self {
            Renderable::Empty => Ok(Box::new(io::empty())),
            Renderable::Bytes { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
            Renderable::Text { text, .. } => Ok(Box::new(text.as_bytes())),
            Renderable::Json { node, rendered } => {
                let bytes = json_bytes(node, rendered)?;
                Ok(Box::new(bytes.as_slice()))
            }
            Renderable::Xml { document } => Ok(Box::new(document.as_bytes())),
            Renderable::File { path, .. } => Ok(Box::new(File::open(&*path)?)),
            Renderable::Stream { reader, .. } => match reader.take() {
                Some(r) => Ok(r),
                None => Err(io::Error::other("stream body already rendered")),
            },
            Renderable::Object { serialized, .. } => match serialized {
                Some(bytes) => Ok(Box::new(bytes.as_slice())),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no serializer produced a representation of the content",
                )),
            },
        }
    }

    /// Render and collect the whole body.
    pub fn to_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.render()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

fn json_bytes<'a>(node: &Value, rendered: &'a OnceCell<Vec<u8>>) -> io::Result<&'a Vec<u8>> {
    rendered.get_or_try_init(|| {
        serde_json::to_vec(node).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    })
}

pub(crate) fn is_json(mime: &str) -> bool {
    let m = mime.split(';').next().unwrap_or("").trim();
    m.eq_ignore_ascii_case(MIME_JSON) || m.to_ascii_lowercase().ends_with("+json")
}

pub(crate) fn is_xml(mime: &str) -> bool {
    let m = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    m == MIME_XML || m == "text/xml" || m.ends_with("+xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_length_and_render_agree() {
        let mut r = Renderable::json(json!({"b": [1, 2, 3], "a": "x"}));
        let len1 = r.length();
        let len2 = r.length();
        let first = r.to_bytes().unwrap();
        let second = r.to_bytes().unwrap();
        assert_eq!(len1, len2);
        assert_eq!(len1, first.len() as i64);
        assert_eq!(first, second);
        assert!(!r.must_be_chunked());
    }

    #[test]
    fn test_stream_without_length_is_chunked() {
        let r = Renderable::stream(Cursor::new(b"abc".to_vec()), None);
        assert_eq!(r.length(), -1);
        assert!(r.must_be_chunked());

        let r = Renderable::stream(Cursor::new(b"abc".to_vec()), Some(3));
        assert!(!r.must_be_chunked());
        assert!(r.chunked().must_be_chunked());
    }

    #[test]
    fn test_stream_renders_once() {
        let mut r = Renderable::stream(Cursor::new(b"abc".to_vec()), Some(3));
        assert_eq!(r.to_bytes().unwrap(), b"abc");
        assert!(r.render().is_err());
    }

    #[test]
    fn test_text_tagged_json_needs_serializer() {
        let mut r = Renderable::text("hello");
        assert_eq!(r.mime_type(), Some(MIME_HTML));
        r.adapt_to(MIME_JSON);
        assert!(r.require_serializer());

        let mut r = Renderable::text(" {\"a\":1} ");
        r.adapt_to(MIME_JSON);
        assert!(!r.require_serializer());

        let mut r = Renderable::text("<a/>");
        r.adapt_to("text/xml");
        assert!(!r.require_serializer());
    }

    #[test]
    fn test_object_requires_serializer_until_set() {
        let mut r = Renderable::object(json!({"k": 1}));
        assert!(r.require_serializer());
        assert_eq!(r.length(), -1);
        assert!(r.render().is_err());
        r.set_serialized_form(b"{\"k\":1}".to_vec());
        assert!(!r.require_serializer());
        assert_eq!(r.length(), 7);
        assert_eq!(r.to_bytes().unwrap(), b"{\"k\":1}");
    }

    #[test]
    fn test_missing_file() {
        let mut r = Renderable::file("/definitely/not/here.txt");
        assert_eq!(r.length(), -1);
        assert!(r.render().is_err());
        assert_eq!(r.mime_type(), Some("text/plain"));
    }

    #[test]
    fn test_mime_helpers() {
        assert!(is_json("application/json; charset=utf-8"));
        assert!(is_json("application/problem+json"));
        assert!(is_xml("application/atom+xml"));
        assert!(!is_xml("text/html"));
    }
}
