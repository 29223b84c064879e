//! Handler chain compiler.
//!
//! A [`Chain`] turns an ordered list of handlers into a single dispatch
//! function that follows the onion model:
//!
//! ```text
//!   dispatch ──▶ h0 ──next──▶ h1 ──next──▶ h2
//!                 ◀─────────── ◀───────────┘
//! ```
//!
//! Handler `i` receives a [`Next`] bound to index `i + 1`. Running it executes
//! handler `i + 1` (or completes when `i + 1` is past the end); code after the
//! `.await` runs once everything downstream has finished, so control unwinds
//! in reverse registration order. A handler that never runs its `Next` stops
//! the chain there.
//!
//! Each [`Next`] can be run once. Every dispatch allocates its own guards, so
//! one compiled chain serves any number of concurrent messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{self, BoxFuture};
use ingot_core::Context;
use tracing::trace;

use crate::error::{DispatchError, DispatchResult};
use crate::handler::{BoxedMiddleware, IntoMiddleware};

// ============================================================================
// Next
// ============================================================================

/// The continuation handed to a handler.
///
/// Clones share the same guard: running any of them marks the continuation
/// as used.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[BoxedMiddleware]>,
    index: usize,
    ctx: Arc<Context>,
    called: Arc<AtomicBool>,
}

impl Next {
    /// Runs the rest of the chain.
    ///
    /// Fails with [`DispatchError::DoubleDispatch`] if this continuation has
    /// already been run. Errors from downstream handlers are returned as-is,
    /// so a handler can forward them with `?`.
    pub async fn run(&self) -> DispatchResult {
        if self.called.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::DoubleDispatch {
                index: self.index - 1,
            });
        }
        dispatch_at(&self.chain, self.index, Arc::clone(&self.ctx)).await
    }

    /// Returns `true` if this continuation has been run.
    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::SeqCst)
    }

    /// Returns the number of handlers that running this continuation may reach.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }

    /// Returns the context of the message being dispatched.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.remaining())
            .field("called", &self.is_called())
            .finish()
    }
}

/// Runs the handler at `index`, or completes when the chain is exhausted.
fn dispatch_at(
    chain: &Arc<[BoxedMiddleware]>,
    index: usize,
    ctx: Arc<Context>,
) -> BoxFuture<'static, DispatchResult> {
    let Some(middleware) = chain.get(index).cloned() else {
        return Box::pin(future::ready(Ok(())));
    };

    let next = Next {
        chain: Arc::clone(chain),
        index: index + 1,
        ctx: Arc::clone(&ctx),
        called: Arc::new(AtomicBool::new(false)),
    };

    Box::pin(async move {
        trace!(index, handler = middleware.name(), "Entering handler");
        let result = middleware
            .call(ctx, next)
            .await
            .map_err(|e| DispatchError::from_handler(index, e));
        trace!(index, ok = result.is_ok(), "Leaving handler");
        result
    })
}

// ============================================================================
// Chain
// ============================================================================

/// A compiled, immutable handler chain.
///
/// Cloning is cheap; clones share the same handlers.
#[derive(Clone)]
pub struct Chain {
    middleware: Arc<[BoxedMiddleware]>,
}

impl Chain {
    /// Compiles `middleware` into a chain, in the given order.
    pub fn new(middleware: Vec<BoxedMiddleware>) -> Self {
        Self {
            middleware: middleware.into(),
        }
    }

    /// Creates a builder for registering handlers one by one.
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// Dispatches one message through the chain.
    ///
    /// An empty chain completes immediately.
    pub fn dispatch(&self, ctx: Arc<Context>) -> BoxFuture<'static, DispatchResult> {
        dispatch_at(&self.middleware, 0, ctx)
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Returns the handler names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("handlers", &self.names())
            .finish()
    }
}

// ============================================================================
// ChainBuilder
// ============================================================================

/// Collects handlers in registration order.
#[derive(Clone, Default)]
pub struct ChainBuilder {
    middleware: Vec<BoxedMiddleware>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Appends a handler.
    pub fn push<H, M>(&mut self, handler: H) -> &mut Self
    where
        H: IntoMiddleware<M>,
    {
        self.middleware.push(handler.into_middleware());
        self
    }

    /// Appends a handler (builder pattern).
    pub fn handler<H, M>(mut self, handler: H) -> Self
    where
        H: IntoMiddleware<M>,
    {
        self.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Compiles the handlers registered so far.
    ///
    /// The builder stays usable; handlers added later do not affect chains
    /// already built.
    pub fn build(&self) -> Chain {
        Chain::new(self.middleware.clone())
    }
}

impl std::fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("handler_count", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::handler::Middleware;
    use ingot_core::Delivery;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn ctx() -> Arc<Context> {
        Arc::new(Context::from_delivery(Delivery::new(b"{\"msg\":\"ok\"}".to_vec())))
    }

    /// A middleware that records entry and exit around its continuation.
    struct Recorder {
        label: String,
        trace: Trace,
    }

    impl Middleware for Recorder {
        fn call(&self, _ctx: Arc<Context>, next: Next) -> BoxFuture<'static, Result<(), BoxError>> {
            let label = self.label.clone();
            let trace = Arc::clone(&self.trace);
            Box::pin(async move {
                trace.lock().push(format!("enter {label}"));
                next.run().await?;
                trace.lock().push(format!("leave {label}"));
                Ok(())
            })
        }
    }

    fn recorders(n: usize, trace: &Trace) -> ChainBuilder {
        let mut builder = Chain::builder();
        for i in 0..n {
            builder.push(Recorder {
                label: i.to_string(),
                trace: Arc::clone(trace),
            });
        }
        builder
    }

    #[tokio::test]
    async fn test_empty_chain_completes() {
        let chain = Chain::default();
        assert!(chain.is_empty());
        assert!(chain.dispatch(ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_onion_order() {
        for n in 1..=5 {
            let trace: Trace = Arc::default();
            let chain = recorders(n, &trace).build();

            chain.dispatch(ctx()).await.unwrap();

            let mut expected: Vec<String> = (0..n).map(|i| format!("enter {i}")).collect();
            expected.extend((0..n).rev().map(|i| format!("leave {i}")));
            assert_eq!(*trace.lock(), expected, "chain of {n} handlers");
        }
    }

    #[tokio::test]
    async fn test_last_handler_reached_once_per_message() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let trace: Trace = Arc::default();
        let chain = recorders(3, &trace)
            .handler(move |_ctx: Arc<Context>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();

        for _ in 0..4 {
            chain.dispatch(ctx()).await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_handler_that_skips_next_stops_chain() {
        for n in 2..=5 {
            for k in 0..n - 1 {
                let trace: Trace = Arc::default();
                let mut builder = Chain::builder();
                for i in 0..n {
                    if i == k {
                        let trace = Arc::clone(&trace);
                        builder.push(move |_ctx: Arc<Context>, _next: Next| {
                            let trace = Arc::clone(&trace);
                            async move {
                                trace.lock().push(format!("stop {k}"));
                            }
                        });
                    } else {
                        builder.push(Recorder {
                            label: i.to_string(),
                            trace: Arc::clone(&trace),
                        });
                    }
                }

                builder.build().dispatch(ctx()).await.unwrap();

                let trace = trace.lock();
                assert!(trace.contains(&format!("stop {k}")));
                for later in k + 1..n {
                    assert!(
                        !trace.contains(&format!("enter {later}")),
                        "handler {later} ran after handler {k} stopped the chain"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_terminal_handler_ignores_later_handlers() {
        let trace: Trace = Arc::default();
        let t = Arc::clone(&trace);
        let chain = recorders(1, &trace)
            .handler(move |_ctx: Arc<Context>| {
                let t = Arc::clone(&t);
                async move { t.lock().push("terminal".to_string()) }
            })
            .handler(Recorder {
                label: "unreachable".into(),
                trace: Arc::clone(&trace),
            })
            .build();

        chain.dispatch(ctx()).await.unwrap();

        assert_eq!(*trace.lock(), vec!["enter 0", "terminal", "leave 0"]);
    }

    #[tokio::test]
    async fn test_double_dispatch_fails() {
        let chain = Chain::builder()
            .handler(|_ctx: Arc<Context>, next: Next| async move {
                next.run().await?;
                next.run().await?;
                Ok::<(), BoxError>(())
            })
            .handler(|_ctx: Arc<Context>| async {})
            .build();

        let err = chain.dispatch(ctx()).await.unwrap_err();
        assert!(err.is_double_dispatch());
        assert_eq!(err.index(), Some(0));
    }

    #[tokio::test]
    async fn test_double_dispatch_through_clone_fails() {
        let chain = Chain::builder()
            .handler(|_ctx: Arc<Context>, next: Next| async move {
                let other = next.clone();
                next.run().await?;
                assert!(other.is_called());
                other.run().await?;
                Ok::<(), BoxError>(())
            })
            .build();

        let err = chain.dispatch(ctx()).await.unwrap_err();
        assert!(err.is_double_dispatch());
    }

    #[tokio::test]
    async fn test_next_shares_the_dispatched_context() {
        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>, next: Next| async move {
                assert!(Arc::ptr_eq(next.context(), &ctx));
                assert_eq!(next.remaining(), 1);
                next.context().set("seen_by", "outer");
                next.run().await?;
                Ok::<(), BoxError>(())
            })
            .handler(|ctx: Arc<Context>, next: Next| async move {
                assert_eq!(next.remaining(), 0);
                assert_eq!(ctx.get("seen_by"), Some(json!("outer")));
                next.run().await
            })
            .build();

        let message = ctx();
        chain.dispatch(Arc::clone(&message)).await.unwrap();
        assert_eq!(message.get("seen_by"), Some(json!("outer")));
    }

    #[tokio::test]
    async fn test_double_dispatch_does_not_affect_other_messages() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>, next: Next| async move {
                next.run().await?;
                if ctx.get("twice").is_some() {
                    next.run().await?;
                }
                Ok::<(), BoxError>(())
            })
            .handler(move |_ctx: Arc<Context>| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();

        let bad = ctx();
        bad.set("twice", true);
        let (bad_result, good_result) = tokio::join!(chain.dispatch(bad), chain.dispatch(ctx()));

        assert!(bad_result.unwrap_err().is_double_dispatch());
        assert!(good_result.is_ok());
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_with_index() {
        let trace: Trace = Arc::default();
        let chain = recorders(2, &trace)
            .handler(|_ctx: Arc<Context>| async { Err::<(), _>("bad payload") })
            .build();

        let err = chain.dispatch(ctx()).await.unwrap_err();

        assert!(matches!(err, DispatchError::Handler { index: 2, .. }));
        assert_eq!(err.to_string(), "handler #2 failed: bad payload");
        // Upstream handlers forwarded the error with `?` and did not unwind.
        assert_eq!(*trace.lock(), vec!["enter 0", "enter 1"]);
    }

    #[tokio::test]
    async fn test_handler_may_recover_from_downstream_error() {
        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>, next: Next| async move {
                if let Err(err) = next.run().await {
                    ctx.set("error", err.to_string());
                }
            })
            .handler(|_ctx: Arc<Context>| async { Err::<(), _>("boom") })
            .build();

        let c = ctx();
        chain.dispatch(Arc::clone(&c)).await.unwrap();
        assert_eq!(c.get("error"), Some(json!("handler #1 failed: boom")));
    }

    #[tokio::test]
    async fn test_pipeline_transforms_context() {
        async fn parse_json(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
            let content: Value = ctx.json()?;
            ctx.set("content", content);
            next.run().await?;
            Ok(())
        }

        async fn attach_message(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
            if let Some(content) = ctx.get("content") {
                ctx.set("message", content);
            }
            next.run().await?;
            Ok(())
        }

        let chain = Chain::builder()
            .handler(parse_json)
            .handler(attach_message)
            .build();

        let c = ctx();
        chain.dispatch(Arc::clone(&c)).await.unwrap();
        assert_eq!(c.get("message"), Some(json!({ "msg": "ok" })));
        assert_eq!(chain.len(), 2);
        assert!(chain.names()[0].ends_with("parse_json"));
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_are_isolated() {
        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>, next: Next| async move {
                let key = ctx.routing_key().to_string();
                ctx.set("seen", key);
                tokio::time::sleep(Duration::from_millis(10)).await;
                next.run().await?;
                Ok::<(), BoxError>(())
            })
            .build();

        let contexts: Vec<_> = (0..8)
            .map(|i| Arc::new(Context::from_delivery(Delivery::default().with_route("x", format!("k{i}")))))
            .collect();
        let handles: Vec<_> = contexts
            .iter()
            .map(|c| tokio::spawn(chain.dispatch(Arc::clone(c))))
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for (i, c) in contexts.iter().enumerate() {
            assert_eq!(c.get("seen"), Some(json!(format!("k{i}"))));
        }
    }

    #[test]
    fn test_builder_snapshot_is_independent() {
        let mut builder = Chain::builder().handler(|_ctx: Arc<Context>| async {});
        let chain = builder.build();
        builder.push(|_ctx: Arc<Context>| async {});

        assert_eq!(chain.len(), 1);
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_dispatch_outside_async_runtime() {
        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>| async move {
                ctx.set("done", true);
            })
            .build();
        let c = ctx();
        tokio_test::block_on(chain.dispatch(Arc::clone(&c))).unwrap();
        assert_eq!(c.get("done"), Some(json!(true)));
    }
}
