//! Dispatch error observation.
//!
//! Failures of a single message never stop consumption. They are handed to an
//! [`ErrorObserver`] together with the context of the failed message.

use std::sync::Arc;

use ingot_core::Context;
use tracing::error;

use crate::error::DispatchError;

/// Callback invoked once for every message whose dispatch failed.
pub type ErrorObserver = Arc<dyn Fn(&DispatchError, &Context) + Send + Sync>;

/// Returns the observer used when none is installed.
///
/// It logs the failure at `ERROR` level along with the message's routing
/// metadata.
pub fn default_observer() -> ErrorObserver {
    Arc::new(|err: &DispatchError, ctx: &Context| {
        error!(
            error = %err,
            exchange = ctx.exchange(),
            routing_key = ctx.routing_key(),
            delivery_tag = ctx.delivery_tag(),
            "Message dispatch failed"
        );
    })
}

/// Wraps a closure into an [`ErrorObserver`].
pub fn observer<F>(f: F) -> ErrorObserver
where
    F: Fn(&DispatchError, &Context) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingot_core::Delivery;
    use parking_lot::Mutex;

    #[test]
    fn test_observer_receives_error_and_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let obs = observer(move |err, ctx| {
            sink.lock().push((err.index(), ctx.routing_key().to_string()));
        });

        let ctx = Context::from_delivery(Delivery::default().with_route("DEV", "DEV:TODO1"));
        obs(&DispatchError::DoubleDispatch { index: 1 }, &ctx);

        assert_eq!(*seen.lock(), vec![(Some(1), "DEV:TODO1".to_string())]);
    }

    #[test]
    fn test_default_observer_does_not_panic() {
        let ctx = Context::from_delivery(Delivery::default());
        default_observer()(&DispatchError::Panicked("boom".into()), &ctx);
    }
}
