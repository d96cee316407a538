use crate::content::{ContentEngine, DefaultContentEngine};
use crate::context::Context;
use crate::dispatcher::async_bridge::AsyncBridge;
use crate::dispatcher::channels::{Channels, WebSocketListener};
use crate::error_handler::{BadRequestOnDecodeError, ErrorHandler};
use crate::ids::ConnectionId;
use crate::result::{HttpResult, Outcome};
use crate::router::{Route, Router};
use anyhow::anyhow;
use http::Method;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Bridges decoded requests to routes and owns the WebSocket registry.
pub struct Dispatcher {
    router: Arc<dyn Router>,
    content: Arc<dyn ContentEngine>,
    error_handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    channels: Channels,
    bridge: AsyncBridge,
}

impl Dispatcher {
    /// Dispatcher over `router` with the default content engine.
    ///
    /// [`BadRequestOnDecodeError`] is registered as the first error handler.
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self {
            router,
            content: Arc::new(DefaultContentEngine::new()),
            error_handlers: RwLock::new(vec![Arc::new(BadRequestOnDecodeError)]),
            channels: Channels::new(),
            bridge: AsyncBridge::default(),
        }
    }

    pub fn with_content_engine(mut self, content: Arc<dyn ContentEngine>) -> Self {
        self.content = content;
        self
    }

    /// Coroutine stack size used for async computations.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.bridge = AsyncBridge::new(stack_size);
        self
    }

    pub fn add_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn content_engine(&self) -> &Arc<dyn ContentEngine> {
        &self.content
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn bridge(&self) -> &AsyncBridge {
        &self.bridge
    }

    /// Route `ctx` and invoke the matched route.
    ///
    /// Never fails: routing misses, handler errors and handler panics all end
    /// in a ready result. An [`Outcome::Async`] must go through the bridge.
    pub fn dispatch(&self, ctx: &mut Context) -> Outcome {
        if let Some(decode_error) = ctx.take_decode_error() {
            warn!(
                request_id = %ctx.request_id,
                method = %ctx.method(),
                path = %ctx.path(),
                error = %decode_error,
                "Request body could not be decoded"
            );
            let failure = anyhow::Error::new(decode_error);
            return self.on_error(ctx, None, &failure).into();
        }

        let Some(route) = self.router.route_for(ctx.method(), ctx.path()) else {
            debug!(
                request_id = %ctx.request_id,
                method = %ctx.method(),
                path = %ctx.path(),
                "No route"
            );
            return self.on_no_route(ctx.method(), ctx.path()).into();
        };
        ctx.set_route(Arc::clone(&route));

        let start = Instant::now();
        let invoked = catch_unwind(AssertUnwindSafe(|| route.invoke(ctx)));
        let outcome = match invoked {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => {
                warn!(
                    request_id = %ctx.request_id,
                    route = %route.path(),
                    error = %failure,
                    "Route failed"
                );
                self.on_error(ctx, Some(&route), &failure).into()
            }
            Err(panic) => {
                let failure = anyhow!("handler panicked: {}", panic_message(panic.as_ref()));
                error!(
                    request_id = %ctx.request_id,
                    route = %route.path(),
                    error = %failure,
                    "Route panicked"
                );
                self.on_error(ctx, Some(&route), &failure).into()
            }
        };
        debug!(
            request_id = %ctx.request_id,
            route = %route.path(),
            deferred = matches!(outcome, Outcome::Async(_)),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Route invoked"
        );
        outcome
    }

    fn handlers(&self) -> Vec<Arc<dyn ErrorHandler>> {
        self.error_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Result for a routing miss; the last handler answer wins, 404 otherwise.
    pub fn on_no_route(&self, method: &Method, path: &str) -> HttpResult {
        self.handlers()
            .iter()
            .filter_map(|h| h.on_no_route(method, path))
            .last()
            .unwrap_or_else(HttpResult::not_found)
    }

    /// Result for a failure; the last handler answer wins, 500 otherwise.
    pub fn on_error(
        &self,
        ctx: &Context,
        route: Option<&Arc<dyn Route>>,
        failure: &anyhow::Error,
    ) -> HttpResult {
        self.handlers()
            .iter()
            .filter_map(|h| h.on_error(ctx, route, failure))
            .last()
            .unwrap_or_else(|| HttpResult::internal_server_error(failure))
    }

    pub fn register(&self, listener: Arc<dyn WebSocketListener>) {
        self.channels.register(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn WebSocketListener>) -> bool {
        self.channels.unregister(listener)
    }

    pub fn publish_text(&self, uri: &str, text: &str) -> usize {
        self.channels.publish_text(uri, text)
    }

    pub fn publish_binary(&self, uri: &str, data: &[u8]) -> usize {
        self.channels.publish_binary(uri, data)
    }

    pub fn send_text(&self, uri: &str, client: ConnectionId, text: &str) -> bool {
        self.channels.send_text(uri, client, text)
    }

    pub fn send_binary(&self, uri: &str, client: ConnectionId, data: &[u8]) -> bool {
        self.channels.send_binary(uri, client, data)
    }

    /// Drop every registered socket and listener.
    pub fn stop(&self) {
        info!("Dispatcher stopping");
        self.channels.stop();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
