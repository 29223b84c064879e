//! Handler system for the Ingot framework.
//!
//! A handler comes in one of two shapes, both plain async functions:
//!
//! ```rust,ignore
//! use ingot_framework::{BoxError, Context, Next};
//!
//! // Middleware: may run the rest of the chain zero or one times, and may act
//! // both before and after it.
//! async fn timing(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
//!     let start = Instant::now();
//!     next.run().await?;
//!     debug!(elapsed = ?start.elapsed(), "message processed");
//!     Ok(())
//! }
//!
//! // Terminal: never continues, even if later handlers are registered.
//! async fn store(ctx: Arc<Context>) -> Result<(), BoxError> {
//!     repo.insert(ctx.get("message")).await?;
//!     Ok(())
//! }
//! ```
//!
//! Either shape may return `()` or `Result<(), E>` where `E: Into<BoxError>`
//! (see [`HandlerOutcome`]). Both are turned into a [`BoxedMiddleware`] by
//! [`IntoMiddleware`], which is also implemented for any type implementing
//! [`Middleware`] directly.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use ingot_core::Context;

use crate::chain::Next;
use crate::error::BoxError;

// ============================================================================
// Middleware Trait
// ============================================================================

/// A type-erased link of the handler chain.
pub trait Middleware: Send + Sync + 'static {
    /// Returns a name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Processes `ctx`, optionally running the rest of the chain via `next`.
    fn call(&self, ctx: Arc<Context>, next: Next) -> BoxFuture<'static, Result<(), BoxError>>;
}

/// A type-erased middleware that can be stored in a chain.
pub type BoxedMiddleware = Arc<dyn Middleware>;

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&self, ctx: Arc<Context>, next: Next) -> BoxFuture<'static, Result<(), BoxError>> {
        (**self).call(ctx, next)
    }
}

// ============================================================================
// HandlerOutcome - Normalize handler return values
// ============================================================================

/// A trait for types that can be returned from handlers.
pub trait HandlerOutcome: Send + 'static {
    /// Converts the return value into the chain's result type.
    fn into_result(self) -> Result<(), BoxError>;
}

/// Implementation for `()` - the handler cannot fail.
impl HandlerOutcome for () {
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Implementation for `Result<(), E>` - the error is boxed.
impl<E> HandlerOutcome for Result<(), E>
where
    E: Into<BoxError> + Send + 'static,
{
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

// ============================================================================
// Function Wrappers
// ============================================================================

/// Wraps an `async fn(Arc<Context>, Next)` handler.
pub struct MiddlewareFn<F> {
    f: F,
}

impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(Arc<Context>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerOutcome,
{
    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }

    fn call(&self, ctx: Arc<Context>, next: Next) -> BoxFuture<'static, Result<(), BoxError>> {
        let fut = (self.f)(ctx, next);
        Box::pin(async move { fut.await.into_result() })
    }
}

/// Wraps an `async fn(Arc<Context>)` handler, which never continues.
pub struct TerminalFn<F> {
    f: F,
}

impl<F, Fut> Middleware for TerminalFn<F>
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerOutcome,
{
    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }

    fn call(&self, ctx: Arc<Context>, _next: Next) -> BoxFuture<'static, Result<(), BoxError>> {
        let fut = (self.f)(ctx);
        Box::pin(async move { fut.await.into_result() })
    }
}

// ============================================================================
// IntoMiddleware - Convert handlers into chain links
// ============================================================================

/// Conversion into a [`BoxedMiddleware`].
///
/// The `Marker` parameter only disambiguates the blanket implementations and
/// is always inferred.
pub trait IntoMiddleware<Marker> {
    fn into_middleware(self) -> BoxedMiddleware;
}

impl<F, Fut> IntoMiddleware<(Arc<Context>, Next)> for F
where
    F: Fn(Arc<Context>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerOutcome,
{
    fn into_middleware(self) -> BoxedMiddleware {
        Arc::new(MiddlewareFn { f: self })
    }
}

impl<F, Fut> IntoMiddleware<(Arc<Context>,)> for F
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerOutcome,
{
    fn into_middleware(self) -> BoxedMiddleware {
        Arc::new(TerminalFn { f: self })
    }
}

impl<M: Middleware> IntoMiddleware<()> for M {
    fn into_middleware(self) -> BoxedMiddleware {
        Arc::new(self)
    }
}

/// Convert a handler into a boxed middleware.
pub fn into_middleware<H, M>(handler: H) -> BoxedMiddleware
where
    H: IntoMiddleware<M>,
{
    handler.into_middleware()
}
