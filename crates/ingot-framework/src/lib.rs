//! # Ingot Framework
//!
//! Composition of message handlers into a dispatch pipeline.
//!
//! This layer provides:
//! - The handler model: async functions taking `(Arc<Context>, Next)` or just
//!   `Arc<Context>`, or any [`Middleware`] implementation
//! - [`Chain`], which compiles an ordered list of handlers into one reentrant
//!   dispatch function following the onion model
//! - [`DispatchError`] and the [`ErrorObserver`] that receives per-message
//!   failures
//!
//! ```rust,ignore
//! use ingot_framework::{BoxError, Chain, Context, Next};
//!
//! async fn parse_json(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
//!     ctx.set("content", ctx.json::<serde_json::Value>()?);
//!     next.run().await?;
//!     Ok(())
//! }
//!
//! let chain = Chain::builder().handler(parse_json).handler(store).build();
//! chain.dispatch(Arc::new(ctx)).await?;
//! ```

pub mod chain;
pub mod error;
pub mod handler;
pub mod observer;

pub use chain::{Chain, ChainBuilder, Next};
pub use error::{BoxError, DispatchError, DispatchResult};
pub use handler::{
    BoxedMiddleware, HandlerOutcome, IntoMiddleware, Middleware, MiddlewareFn, TerminalFn,
    into_middleware,
};
pub use ingot_core::Context;
pub use observer::{ErrorObserver, default_observer, observer};
