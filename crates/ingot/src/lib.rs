//! # Ingot
//!
//! A small consumer framework for AMQP-style publish/subscribe brokers.
//!
//! ## Overview
//!
//! Ingot binds one queue to one exchange and runs every delivered message
//! through an ordered chain of async handlers. Handlers follow the onion
//! model: each may act before and after the rest of the chain, or stop it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  settings   ┌────────────────┐  Delivery  ┌─────────┐  Arc<Context>  ┌──────────┐
//! │  Ingot  │────────────▶│ BindingSession │───────────▶│ Context │───────────────▶│  Chain   │
//! │ (facade)│  handlers   │ connect/assert │ (own task) └─────────┘                │ h0 ▶ h1 ▶│
//! └─────────┘────────────▶│ bind/consume   │                                       └──────────┘
//!                         └────────────────┘                                  errors ──▶ observer
//! ```
//!
//! - **Runtime**: the [`Ingot`](prelude::Ingot) facade, binding sessions,
//!   configuration and logging
//! - **Framework**: handlers, [`Chain`](prelude::Chain) and dispatch errors
//! - **Core**: settings, deliveries, contexts and the broker capability
//! - **Transport**: broker clients (AMQP via `lapin`, and an in-memory broker)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ingot::prelude::*;
//!
//! async fn parse_json(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
//!     ctx.set("content", ctx.json::<serde_json::Value>()?);
//!     next.run().await?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Ingot::amqp();
//!     app.set(Setting::Host("localhost".into()))
//!         .set(Setting::Aggregate("DEV".into()))
//!         .set(Setting::Events(vec!["DEV:TODO1".into()]));
//!     app.handler(parse_json);
//!
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `amqp`: AMQP 0-9-1 broker client
//! - `toml-config` (default) / `yaml-config`: configuration file formats
//! - `json-log`: JSON log output

pub use ingot_core as core;
pub use ingot_framework as framework;
pub use ingot_runtime as runtime;
pub use ingot_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use ingot::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use ingot_runtime::{Ingot, SessionHandle, SessionState};

    // Handlers
    pub use ingot_framework::{BoxError, Chain, DispatchError, Middleware, Next};

    // Messages and settings
    pub use ingot_core::{Context, ExchangeType, Setting, Settings};

    pub use std::sync::Arc;
}
