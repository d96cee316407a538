//! Static file route.
//!
//! [`StaticFiles`] serves a directory below a URL prefix. Paths are mapped
//! component by component; anything that would leave the base directory is
//! refused. Responses go through [`crate::cache::from_file`], so conditional
//! requests get `304 Not Modified`.

use crate::cache;
use crate::config::CacheConfig;
use crate::context::Context;
use crate::result::{HttpResult, Outcome};
use crate::router::Route;
use http::Method;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub struct StaticFiles {
    method: Method,
    base_dir: PathBuf,
    prefix: String,
    cache: CacheConfig,
    index: Option<String>,
}

impl StaticFiles {
    /// Serve `base` under URL `prefix` (e.g. `/assets`).
    pub fn new<P: Into<PathBuf>>(base: P, prefix: &str, cache: CacheConfig) -> Self {
        Self {
            method: Method::GET,
            base_dir: base.into(),
            prefix: prefix.trim_end_matches('/').to_string(),
            cache,
            index: Some("index.html".to_string()),
        }
    }

    /// File served for directory requests; `None` answers them with 404.
    pub fn with_index(mut self, index: Option<&str>) -> Self {
        self.index = index.map(str::to_string);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let relative = url_path.strip_prefix(&self.prefix)?;
        let mut pb = self.base_dir.clone();
        for comp in Path::new(relative.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if pb.is_dir() {
            pb.push(self.index.as_deref()?);
        }
        Some(pb)
    }
}

impl Route for StaticFiles {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        &self.prefix
    }

    fn invoke(&self, ctx: &mut Context) -> anyhow::Result<Outcome> {
        let Some(path) = self.map_path(ctx.path()) else {
            debug!(path = %ctx.path(), "Refusing static path outside the base directory");
            return Ok(HttpResult::not_found().into());
        };
        if !path.is_file() {
            return Ok(HttpResult::not_found().into());
        }
        Ok(cache::from_file(&path, ctx, &self.cache).into())
    }
}

/// MIME type guessed from the file extension.
pub fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
