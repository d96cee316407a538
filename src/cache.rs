//! Conditional GET support.
//!
//! If the request carries `If-None-Match`, it alone decides: the response is
//! NOT_MODIFIED exactly when one of its tags equals the computed ETag, and
//! `If-Modified-Since` is ignored even when present. Otherwise
//! `If-Modified-Since` is compared with the resource's last modification time
//! (at HTTP-date precision). An unparseable date forces a full response.

use crate::config::CacheConfig;
use crate::context::Context;
use crate::renderable::Renderable;
use crate::result::HttpResult;
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Lowercase hex SHA-1 of `input`.
pub fn sha1_hex(input: &[u8]) -> String {
    Sha1::digest(input)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// ETag of a resource last modified at `last_modified_ms` (milliseconds since
/// the epoch); `None` when ETags are disabled.
pub fn compute_etag(last_modified_ms: u64, config: &CacheConfig) -> Option<String> {
    config
        .use_etag
        .then(|| sha1_hex(last_modified_ms.to_string().as_bytes()))
}

/// Whether the client copy is still fresh and NOT_MODIFIED can be sent.
pub fn is_not_modified(ctx: &Context, last_modified_ms: u64, etag: Option<&str>) -> bool {
    if let Some(browser_etag) = ctx.header("if-none-match") {
        let Some(etag) = etag else {
            return false;
        };
        return browser_etag
            .split(',')
            .map(|t| t.trim().trim_start_matches("W/").trim_matches('"'))
            .any(|t| t == etag || t == "*");
    }

    let Some(since) = ctx.header("if-modified-since").map(str::trim) else {
        return false;
    };
    if since.is_empty() || last_modified_ms == 0 {
        return false;
    }
    match httpdate::parse_http_date(since) {
        Ok(browser_date) => {
            let browser_secs = browser_date
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            browser_secs >= last_modified_ms / 1000
        }
        Err(e) => {
            warn!(value = %since, error = %e, "Cannot parse If-Modified-Since");
            false
        }
    }
}

/// Set `Last-Modified` as an HTTP date.
pub fn add_last_modified(result: &mut HttpResult, last_modified_ms: u64) {
    let when = UNIX_EPOCH + Duration::from_millis(last_modified_ms);
    result.set_header("Last-Modified", httpdate::fmt_http_date(when));
}

/// Set `Cache-Control` (`no-cache` when max-age is 0) and, if enabled, `ETag`.
pub fn add_cache_control_and_etag(result: &mut HttpResult, etag: Option<&str>, config: &CacheConfig) {
    if config.max_age == 0 {
        result.set_header("Cache-Control", "no-cache");
    } else {
        result.set_header("Cache-Control", format!("max-age={}", config.max_age));
    }
    if config.use_etag {
        if let Some(etag) = etag {
            result.set_header("ETag", etag);
        }
    }
}

/// Milliseconds since the epoch of a modification time.
pub fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serve `path` as NOT_MODIFIED or as a full response with cache headers.
///
/// Returns a `404` when the file cannot be read.
pub fn from_file(path: &Path, ctx: &Context, config: &CacheConfig) -> HttpResult {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => millis_since_epoch(t),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot stat file");
            return HttpResult::not_found();
        }
    };
    let etag = compute_etag(modified, config);
    if is_not_modified(ctx, modified, etag.as_deref()) {
        return HttpResult::not_modified();
    }
    let mut result = HttpResult::ok().render(Renderable::file(path));
    add_last_modified(&mut result, modified);
    add_cache_control_and_etag(&mut result, etag.as_deref(), config);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::request::HeaderVec;
    use http::{Method, StatusCode};
    use std::io::Write;

    const MODIFIED: u64 = 1_700_000_000_123;

    fn ctx(headers: &[(&str, &str)]) -> Context {
        let headers: HeaderVec = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Context::new(Method::GET, "/r", headers)
    }

    fn http_date(ms: u64) -> String {
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(ms))
    }

    #[test]
    fn test_etag_is_sha1_of_decimal_timestamp() {
        let cfg = CacheConfig::default();
        assert_eq!(
            compute_etag(0, &cfg).as_deref(),
            Some("b6589fc6ab0dc82cf12099d1c2d40ab994e8410c")
        );
        let off = CacheConfig {
            use_etag: false,
            ..CacheConfig::default()
        };
        assert!(compute_etag(MODIFIED, &off).is_none());
    }

    #[test]
    fn test_if_none_match_is_authoritative() {
        let etag = compute_etag(MODIFIED, &CacheConfig::default()).unwrap();
        let fresh_date = http_date(MODIFIED + 60_000);

        let matching = ctx(&[("If-None-Match", &etag)]);
        assert!(is_not_modified(&matching, MODIFIED, Some(&etag)));

        let quoted = format!("\"{etag}\"");
        assert!(is_not_modified(&ctx(&[("If-None-Match", &quoted)]), MODIFIED, Some(&etag)));

        let stale = ctx(&[("If-None-Match", "other"), ("If-Modified-Since", &fresh_date)]);
        assert!(!is_not_modified(&stale, MODIFIED, Some(&etag)));

        let disabled = ctx(&[("If-None-Match", &etag)]);
        assert!(!is_not_modified(&disabled, MODIFIED, None));
    }

    #[test]
    fn test_if_modified_since() {
        let same_second = ctx(&[("If-Modified-Since", &http_date(MODIFIED))]);
        assert!(is_not_modified(&same_second, MODIFIED, None));

        let older = ctx(&[("If-Modified-Since", &http_date(MODIFIED - 5_000))]);
        assert!(!is_not_modified(&older, MODIFIED, None));

        let garbage = ctx(&[("If-Modified-Since", "yesterday-ish")]);
        assert!(!is_not_modified(&garbage, MODIFIED, None));

        assert!(!is_not_modified(&ctx(&[]), MODIFIED, None));
    }

    #[test]
    fn test_cache_control_headers() {
        let mut r = HttpResult::ok();
        add_cache_control_and_etag(&mut r, Some("abc"), &CacheConfig::default());
        assert_eq!(r.header("Cache-Control"), Some("max-age=3600"));
        assert_eq!(r.header("ETag"), Some("abc"));

        let mut r = HttpResult::ok();
        let cfg = CacheConfig {
            max_age: 0,
            use_etag: false,
        };
        add_cache_control_and_etag(&mut r, Some("abc"), &cfg);
        assert_eq!(r.header("Cache-Control"), Some("no-cache"));
        assert!(r.header("ETag").is_none());
    }

    #[test]
    fn test_from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"body").unwrap();
        let cfg = CacheConfig::default();

        let full = from_file(file.path(), &ctx(&[]), &cfg);
        assert_eq!(full.status, StatusCode::OK);
        assert!(full.header("Last-Modified").is_some());
        let etag = full.header("ETag").unwrap().to_string();

        let cached = from_file(file.path(), &ctx(&[("If-None-Match", &etag)]), &cfg);
        assert_eq!(cached.status, StatusCode::NOT_MODIFIED);
        assert!(cached.body.is_none());

        let missing = from_file(Path::new("/no/such/file"), &ctx(&[]), &cfg);
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }
}
