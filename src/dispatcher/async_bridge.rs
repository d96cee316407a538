//! Runs deferred computations on their own coroutine.
//!
//! The [`Context`] moves into the coroutine together with the computation
//! and comes back through the completion callback, which fires exactly once
//! with either the final result or the failure.

use crate::config::DEFAULT_STACK_SIZE;
use crate::context::Context;
use crate::dispatcher::core::panic_message;
use crate::result::{AsyncResult, HttpResult};
use anyhow::anyhow;
use may::coroutine;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error};

/// A finished deferred computation and the context it ran with.
#[derive(Debug)]
pub struct Completion {
    pub context: Context,
    pub outcome: anyhow::Result<HttpResult>,
}

type Job<F> = (Context, AsyncResult, F);

#[derive(Debug, Clone, Copy)]
pub struct AsyncBridge {
    stack_size: usize,
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

impl AsyncBridge {
    pub fn new(stack_size: usize) -> Self {
        Self { stack_size }
    }

    /// Run `deferred` with `ctx` and hand the [`Completion`] to `on_complete`.
    ///
    /// When no coroutine can be spawned the computation runs on the caller.
    pub fn submit<F>(&self, ctx: Context, deferred: AsyncResult, on_complete: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let request_id = ctx.request_id;
        let slot: Arc<Mutex<Option<Job<F>>>> = Arc::new(Mutex::new(Some((ctx, deferred, on_complete))));
        let job = Arc::clone(&slot);

        // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
        // The closure owns everything it touches and is 'static + Send.
        let spawned = unsafe {
            coroutine::Builder::new()
                .stack_size(self.stack_size)
                .spawn(move || {
                    if let Some(job) = take(&job) {
                        run(job);
                    }
                })
        };

        if let Err(e) = spawned {
            error!(
                request_id = %request_id,
                error = %e,
                stack_size = self.stack_size,
                "Failed to spawn async coroutine, running inline"
            );
            if let Some(job) = take(&slot) {
                run(job);
            }
        }
    }
}

fn take<F>(slot: &Mutex<Option<Job<F>>>) -> Option<Job<F>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn run<F>((mut ctx, deferred, on_complete): Job<F>)
where
    F: FnOnce(Completion),
{
    let start = Instant::now();
    let outcome = match catch_unwind(AssertUnwindSafe(|| deferred.run(&mut ctx))) {
        Ok(outcome) => outcome,
        Err(panic) => Err(anyhow!(
            "async computation panicked: {}",
            panic_message(panic.as_ref())
        )),
    };
    debug!(
        request_id = %ctx.request_id,
        ok = outcome.is_ok(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Async computation complete"
    );
    on_complete(Completion {
        context: ctx,
        outcome,
    });
}
