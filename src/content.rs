//! Content serializers.
//!
//! The response writer consults a [`ContentEngine`] when a body requires a
//! serializer. Serializers fill the body's serialized form in place.

use crate::renderable::{is_json, Renderable, MIME_JSON, MIME_TEXT};
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Turns the content of a [`Renderable`] into bytes of one content type.
pub trait ContentSerializer: Send + Sync {
    /// Media type produced, e.g. `application/json`.
    fn content_type(&self) -> &str;

    fn serialize(&self, renderable: &mut Renderable) -> Result<()>;
}

/// Looks up serializers by media type.
pub trait ContentEngine: Send + Sync {
    fn serializer_for_content_type(&self, mime: &str) -> Option<Arc<dyn ContentSerializer>>;

    /// First serializer matching `media_types`, in preference order.
    fn best_serializer(&self, media_types: &[String]) -> Option<Arc<dyn ContentSerializer>> {
        media_types
            .iter()
            .find_map(|m| self.serializer_for_content_type(m))
    }
}

/// `application/json` through `serde_json`.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl ContentSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        MIME_JSON
    }

    fn serialize(&self, renderable: &mut Renderable) -> Result<()> {
        let content = renderable
            .content()
            .ok_or_else(|| anyhow!("body has no content to serialize"))?;
        renderable.set_serialized_form(serde_json::to_vec(&content)?);
        Ok(())
    }
}

/// `text/plain`: strings as-is, other values in their JSON text form.
#[derive(Debug, Default)]
pub struct TextSerializer;

impl ContentSerializer for TextSerializer {
    fn content_type(&self) -> &str {
        MIME_TEXT
    }

    fn serialize(&self, renderable: &mut Renderable) -> Result<()> {
        let content = renderable
            .content()
            .ok_or_else(|| anyhow!("body has no content to serialize"))?;
        let text = match content {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        renderable.set_serialized_form(text.into_bytes());
        Ok(())
    }
}

/// Serializer registry used when none is supplied.
///
/// Knows JSON (including `+json` types) and plain text; `*/*` and
/// `application/*` pick JSON.
pub struct DefaultContentEngine {
    serializers: Vec<Arc<dyn ContentSerializer>>,
}

impl Default for DefaultContentEngine {
    fn default() -> Self {
        Self {
            serializers: vec![Arc::new(JsonSerializer), Arc::new(TextSerializer)],
        }
    }
}

impl DefaultContentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serializer; it takes precedence over earlier ones for its type.
    pub fn register(&mut self, serializer: Arc<dyn ContentSerializer>) {
        self.serializers.insert(0, serializer);
    }
}

impl ContentEngine for DefaultContentEngine {
    fn serializer_for_content_type(&self, mime: &str) -> Option<Arc<dyn ContentSerializer>> {
        let mime = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        let wanted = match mime.as_str() {
            "*/*" | "application/*" => MIME_JSON.to_string(),
            "text/*" => MIME_TEXT.to_string(),
            m if is_json(m) => MIME_JSON.to_string(),
            m => m.to_string(),
        };
        self.serializers
            .iter()
            .find(|s| s.content_type().eq_ignore_ascii_case(&wanted))
            .cloned()
    }
}
