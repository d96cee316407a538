use crate::context::Context;
use crate::result::Outcome;
use http::Method;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A unit the dispatcher can invoke for a matched request.
///
/// Returning `Err` is the only failure signal; panics are caught by the
/// dispatcher and treated the same way.
pub trait Route: Send + Sync {
    fn method(&self) -> &Method;

    /// Path pattern this route was registered under.
    fn path(&self) -> &str;

    fn invoke(&self, ctx: &mut Context) -> anyhow::Result<Outcome>;
}

impl fmt::Debug for dyn Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}

/// Maps a method and a path to a [`Route`].
pub trait Router: Send + Sync {
    fn route_for(&self, method: &Method, path: &str) -> Option<Arc<dyn Route>>;
}

type Handler = dyn Fn(&mut Context) -> anyhow::Result<Outcome> + Send + Sync;

/// A route backed by a closure.
pub struct FnRoute {
    method: Method,
    path: String,
    handler: Box<Handler>,
}

impl FnRoute {
    pub fn new<F, O>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Context) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Outcome>,
    {
        Self {
            method,
            path: path.into(),
            handler: Box::new(move |ctx| handler(ctx).map(Into::into)),
        }
    }
}

impl Route for FnRoute {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn invoke(&self, ctx: &mut Context) -> anyhow::Result<Outcome> {
        (self.handler)(ctx)
    }
}

/// Exact-path routes plus prefix mounts.
///
/// Exact matches win; otherwise the longest mount prefix that ends on a path
/// segment boundary is used. `HEAD` falls back to the `GET` route.
#[derive(Default, Clone)]
pub struct RouteTable {
    exact: Vec<Arc<dyn Route>>,
    mounts: Vec<(String, Arc<dyn Route>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Arc<dyn Route>) -> &mut Self {
        debug!(method = %route.method(), path = %route.path(), "Route registered");
        self.exact.push(route);
        self
    }

    /// Register a closure for `method` and `path`.
    pub fn add_fn<F, O>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Outcome>,
    {
        self.add(Arc::new(FnRoute::new(method, path, handler)))
    }

    pub fn get<F, O>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Outcome>,
    {
        self.add_fn(Method::GET, path, handler)
    }

    pub fn post<F, O>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Outcome>,
    {
        self.add_fn(Method::POST, path, handler)
    }

    /// Serve every path under `prefix` with `route` (for the route's method).
    pub fn mount(&mut self, prefix: &str, route: Arc<dyn Route>) -> &mut Self {
        let prefix = prefix.trim_end_matches('/').to_string();
        info!(prefix = %prefix, method = %route.method(), "Route mounted");
        self.mounts.push((prefix, route));
        self
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<Arc<dyn Route>> {
        if let Some(route) = self
            .exact
            .iter()
            .find(|r| r.method() == method && r.path() == path)
        {
            return Some(Arc::clone(route));
        }
        self.mounts
            .iter()
            .filter(|(prefix, route)| {
                route.method() == method
                    && path.starts_with(prefix.as_str())
                    && (path.len() == prefix.len()
                        || prefix.is_empty()
                        || path.as_bytes()[prefix.len()] == b'/')
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, route)| Arc::clone(route))
    }
}

impl Router for RouteTable {
    fn route_for(&self, method: &Method, path: &str) -> Option<Arc<dyn Route>> {
        let found = self.lookup(method, path).or_else(|| {
            (*method == Method::HEAD)
                .then(|| self.lookup(&Method::GET, path))
                .flatten()
        });
        debug!(method = %method, path = %path, matched = found.is_some(), "Route lookup");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::HttpResult;

    fn ok(_: &mut Context) -> anyhow::Result<HttpResult> {
        Ok(HttpResult::ok())
    }

    #[test]
    fn test_exact_match_and_method() {
        let mut table = RouteTable::new();
        table.get("/x", ok).post("/x", ok);
        assert_eq!(
            table.route_for(&Method::POST, "/x").unwrap().method(),
            Method::POST
        );
        assert!(table.route_for(&Method::DELETE, "/x").is_none());
        assert!(table.route_for(&Method::GET, "/y").is_none());
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let mut table = RouteTable::new();
        table.get("/x", ok);
        assert_eq!(
            table.route_for(&Method::HEAD, "/x").unwrap().method(),
            Method::GET
        );
    }

    #[test]
    fn test_mount_respects_segment_boundaries() {
        let mut table = RouteTable::new();
        table.mount("/assets/", Arc::new(FnRoute::new(Method::GET, "/assets", ok)));
        table.mount(
            "/assets/img",
            Arc::new(FnRoute::new(Method::GET, "/assets/img", ok)),
        );
        assert_eq!(
            table.route_for(&Method::GET, "/assets/app.css").unwrap().path(),
            "/assets"
        );
        assert_eq!(
            table.route_for(&Method::GET, "/assets/img/a.png").unwrap().path(),
            "/assets/img"
        );
        assert!(table.route_for(&Method::GET, "/assetsX/a").is_none());
    }
}
