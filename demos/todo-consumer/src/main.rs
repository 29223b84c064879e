//! Todo Consumer Example
//!
//! Binds to the `DEV` exchange and logs every todo event published with one
//! of the configured routing keys.
//!
//! Settings come from `ingot.toml` in the working directory, overridable
//! through `INGOT_BROKER__HOST` and friends:
//!
//! ```bash
//! cd demos/todo-consumer
//! cargo run --package todo-consumer
//! ```

use std::time::Instant;

use anyhow::Result;
use ingot::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Todo {
    msg: String,
    #[serde(default)]
    done: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Times the rest of the chain.
async fn timing(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
    let start = Instant::now();
    next.run().await?;
    debug!(
        routing_key = ctx.routing_key(),
        elapsed = ?start.elapsed(),
        "Todo processed"
    );
    Ok(())
}

/// Parses the payload and stores it under `todo`.
async fn parse_todo(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
    let todo: Todo = ctx.json()?;
    ctx.insert_state(todo.done);
    ctx.set("todo", serde_json::json!({ "msg": todo.msg, "done": todo.done }));
    next.run().await?;
    Ok(())
}

async fn log_todo(ctx: Arc<Context>) {
    let done = ctx.state::<bool>().unwrap_or(false);
    match ctx.get("todo") {
        Some(todo) => info!(routing_key = ctx.routing_key(), done, %todo, "Received todo"),
        None => warn!(routing_key = ctx.routing_key(), "Todo missing from context"),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let app = Ingot::builder().build()?;

    app.handler(timing).handler(parse_todo).handler(log_todo);
    app.on_error(|err, ctx| {
        warn!(
            error = %err,
            routing_key = ctx.routing_key(),
            payload = %String::from_utf8_lossy(ctx.content()),
            "Dropping todo"
        );
    });

    app.run().await?;
    Ok(())
}
