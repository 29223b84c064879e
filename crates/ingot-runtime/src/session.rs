//! Binding session lifecycle.
//!
//! A [`BindingSession`] turns one settings snapshot into one live
//! subscription:
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Connected ─▶ Asserting ─▶ Bound ─▶ Consuming ─▶ Closed
//!            │              │            │          │           │
//!            └──────────────┴────────────┴──────────┴───────────┴──▶ Failed
//! ```
//!
//! Every step is attempted once; the first broker error moves the session to
//! `Failed` and is returned from [`BindingSession::start`]. Once consuming,
//! a broker-initiated disconnect ends the session `Closed`; any other
//! consumer error ends it `Failed`. Each delivery becomes a [`Context`] and
//! is dispatched through the chain on its own task, so a slow or failing
//! message never holds up the next one.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use ingot_core::{
    BoxedBroker, BoxedChannel, BoxedConnection, BrokerError, Context, Delivery, DeliveryStream,
    Settings, mask_password,
};
use ingot_framework::{Chain, DispatchError, ErrorObserver};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::error::{AssertionStep, SessionError, SessionResult};

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a [`BindingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Asserting,
    Bound,
    Consuming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Asserting => "asserting",
            Self::Bound => "bound",
            Self::Consuming => "consuming",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// BindingSession
// ============================================================================

/// One subscription, started at most once.
pub struct BindingSession {
    settings: Arc<Settings>,
    broker: BoxedBroker,
    chain: Chain,
    observer: ErrorObserver,
    state: Arc<watch::Sender<SessionState>>,
}

impl BindingSession {
    pub fn new(
        settings: Arc<Settings>,
        broker: BoxedBroker,
        chain: Chain,
        observer: ErrorObserver,
    ) -> Self {
        Self {
            settings,
            broker,
            chain,
            observer,
            state: Arc::new(watch::Sender::new(SessionState::Idle)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Connects, declares the topology and starts consuming.
    ///
    /// Resolves once the session is `Consuming`. Fails with
    /// [`SessionError::AlreadyStarted`] unless the session is `Idle`.
    pub async fn start(&self) -> SessionResult<SessionHandle> {
        let mut previous = SessionState::Idle;
        let claimed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SessionError::AlreadyStarted(previous));
        }

        match self.establish().await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.transition(SessionState::Failed);
                error!(error = %err, exchange = %self.settings.aggregate, "Binding session failed");
                Err(err)
            }
        }
    }

    fn transition(&self, state: SessionState) {
        self.state.send_replace(state);
        debug!(state = %state, "Session state changed");
    }

    async fn establish(&self) -> SessionResult<SessionHandle> {
        let url = self.settings.url();
        info!(
            url = %mask_password(&url),
            exchange = %self.settings.aggregate,
            kind = %self.settings.exchange_type,
            "Connecting to broker"
        );

        let connection = self
            .broker
            .connect(&url)
            .await
            .map_err(SessionError::Connection)?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close connection after error");
                }
                return Err(SessionError::Connection(err));
            }
        };
        self.transition(SessionState::Connected);

        match self.bind_and_consume(&channel).await {
            Ok((queue, stream)) => Ok(self.spawn_consumer(connection, channel, queue, stream)),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close connection after error");
                }
                Err(err)
            }
        }
    }

    async fn bind_and_consume(
        &self,
        channel: &BoxedChannel,
    ) -> SessionResult<(String, DeliveryStream)> {
        let settings = &self.settings;
        self.transition(SessionState::Asserting);

        channel
            .assert_exchange(
                &settings.aggregate,
                settings.exchange_type,
                &settings.exchange_options,
            )
            .await
            .map_err(|source| SessionError::Assertion {
                step: AssertionStep::Exchange {
                    name: settings.aggregate.clone(),
                },
                source,
            })?;
        debug!(exchange = %settings.aggregate, kind = %settings.exchange_type, "Exchange asserted");

        let queue = channel
            .assert_queue(&settings.queue, &settings.queue_options)
            .await
            .map_err(|source| SessionError::Assertion {
                step: AssertionStep::Queue {
                    name: settings.queue.clone(),
                },
                source,
            })?;
        debug!(queue = %queue, "Queue asserted");

        for routing_key in &settings.events {
            channel
                .bind_queue(&queue, &settings.aggregate, routing_key)
                .await
                .map_err(|source| SessionError::Assertion {
                    step: AssertionStep::Bind {
                        queue: queue.clone(),
                        exchange: settings.aggregate.clone(),
                        routing_key: routing_key.clone(),
                    },
                    source,
                })?;
            debug!(queue = %queue, exchange = %settings.aggregate, routing_key = %routing_key, "Queue bound");
        }
        self.transition(SessionState::Bound);

        let stream = channel
            .consume(&queue, &settings.consume_options)
            .await
            .map_err(SessionError::Consume)?;
        Ok((queue, stream))
    }

    fn spawn_consumer(
        &self,
        connection: BoxedConnection,
        channel: BoxedChannel,
        queue: String,
        stream: DeliveryStream,
    ) -> SessionHandle {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        self.transition(SessionState::Consuming);
        let consumer = tokio::spawn(consume(
            stream,
            self.chain.clone(),
            Arc::clone(&self.observer),
            token.clone(),
            tracker.clone(),
            Arc::clone(&self.state),
        ));

        info!(
            queue = %queue,
            exchange = %self.settings.aggregate,
            routing_keys = ?self.settings.events,
            handlers = self.chain.len(),
            "Consuming"
        );

        SessionHandle {
            inner: Arc::new(SessionShared {
                queue,
                routing_keys: self.settings.events.clone(),
                connection,
                _channel: channel,
                token,
                tracker,
                consumer: Mutex::new(Some(consumer)),
                state: Arc::clone(&self.state),
            }),
        }
    }
}

impl fmt::Debug for BindingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSession")
            .field("exchange", &self.settings.aggregate)
            .field("state", &self.state())
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Consume loop
// ============================================================================

async fn consume(
    mut stream: DeliveryStream,
    chain: Chain,
    observer: ErrorObserver,
    token: CancellationToken,
    tracker: TaskTracker,
    state: Arc<watch::Sender<SessionState>>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Consumer cancelled");
                return;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(delivery)) => {
                tracker.spawn(dispatch(chain.clone(), Arc::clone(&observer), delivery));
            }
            Some(Err(BrokerError::ConnectionClosed { reason })) => {
                info!(reason = %reason, "Broker closed the connection");
                state.send_replace(SessionState::Closed);
                return;
            }
            Some(Err(err)) => {
                error!(error = %err, "Consumer failed");
                state.send_replace(SessionState::Failed);
                return;
            }
            None => {
                info!("Broker closed the consumer");
                state.send_replace(SessionState::Closed);
                return;
            }
        }
    }
}

async fn dispatch(chain: Chain, observer: ErrorObserver, delivery: Delivery) {
    let span = info_span!(
        "dispatch",
        routing_key = %delivery.routing_key,
        delivery_tag = delivery.delivery_tag
    );

    async move {
        let ctx = Arc::new(Context::from_delivery(delivery));
        let result = AssertUnwindSafe(chain.dispatch(Arc::clone(&ctx)))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => trace!("Message processed"),
            Err(err) => observer(&err, ctx.as_ref()),
        }
    }
    .instrument(span)
    .await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// SessionHandle
// ============================================================================

struct SessionShared {
    queue: String,
    routing_keys: Vec<String>,
    connection: BoxedConnection,
    _channel: BoxedChannel,
    token: CancellationToken,
    tracker: TaskTracker,
    consumer: Mutex<Option<JoinHandle<()>>>,
    state: Arc<watch::Sender<SessionState>>,
}

/// Handle to a consuming session.
///
/// Dropping every handle leaves the consumer running; call
/// [`close`](Self::close) to stop it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Returns the resolved queue name.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Returns the routing keys the queue was bound with, in bind order.
    pub fn routing_keys(&self) -> &[String] {
        &self.inner.routing_keys
    }

    /// Returns the number of messages currently being dispatched.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Waits until the session is `Closed` or `Failed` and returns that state.
    pub async fn closed(&self) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Stops consuming and closes the connection.
    ///
    /// Messages already being dispatched run to completion before the
    /// connection closes. Closing twice is a no-op.
    pub async fn close(&self) -> SessionResult<()> {
        let consumer = self.inner.consumer.lock().take();
        let Some(consumer) = consumer else {
            return Ok(());
        };
        let ended_by_broker = self.state().is_terminal();

        self.inner.token.cancel();
        if let Err(err) = consumer.await {
            warn!(error = %err, "Consumer task ended abnormally");
        }

        self.inner.tracker.close();
        if !self.inner.tracker.is_empty() {
            debug!(in_flight = self.inner.tracker.len(), "Waiting for in-flight dispatches");
        }
        self.inner.tracker.wait().await;

        let result = self.inner.connection.close().await;
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Failed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        info!(queue = %self.inner.queue, "Binding session closed");

        match result {
            Ok(()) => Ok(()),
            Err(err) if ended_by_broker => {
                debug!(error = %err, "Connection already gone");
                Ok(())
            }
            Err(err) => Err(SessionError::Connection(err)),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("queue", &self.inner.queue)
            .field("routing_keys", &self.inner.routing_keys)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingot_core::{
        BrokerError, Broker, ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions, Setting,
    };
    use ingot_framework::{BoxError, Next, default_observer, observer};
    use ingot_transport::MemoryBroker;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings(events: &[&str]) -> Settings {
        Settings::default()
            .set(Setting::Host("localhost".into()))
            .set(Setting::Aggregate("DEV".into()))
            .set(Setting::Events(events.iter().map(|e| e.to_string()).collect()))
    }

    fn session(broker: &MemoryBroker, settings: Settings, chain: Chain) -> BindingSession {
        BindingSession::new(
            Arc::new(settings),
            Arc::new(broker.clone()),
            chain,
            default_observer(),
        )
    }

    #[tokio::test]
    async fn test_start_binds_every_key_in_order() {
        let broker = MemoryBroker::new();
        let settings = settings(&["DEV:TODO1", "DEV:TODO2", "DEV:TODO3"])
            .set(Setting::ExchangeType(ExchangeType::Direct));
        let session = session(&broker, settings, Chain::default());
        assert_eq!(session.state(), SessionState::Idle);

        let handle = session.start().await.unwrap();

        assert_eq!(handle.state(), SessionState::Consuming);
        assert!(handle.queue().starts_with("amq.gen-"));
        assert_eq!(handle.routing_keys(), ["DEV:TODO1", "DEV:TODO2", "DEV:TODO3"]);
        assert_eq!(broker.exchange_type("DEV"), Some(ExchangeType::Direct));
        let keys: Vec<String> = broker.bindings("DEV").into_iter().map(|(_, k)| k).collect();
        assert_eq!(keys, vec!["DEV:TODO1", "DEV:TODO2", "DEV:TODO3"]);
        assert_eq!(broker.consumer_count(handle.queue()), 1);
    }

    #[tokio::test]
    async fn test_zero_routing_keys_creates_no_bindings() {
        let broker = MemoryBroker::new();
        let handle = session(&broker, settings(&[]), Chain::default())
            .start()
            .await
            .unwrap();

        assert_eq!(handle.state(), SessionState::Consuming);
        assert!(broker.bindings("DEV").is_empty());
        assert_eq!(broker.publish("DEV", "DEV:TODO1", b"{}".to_vec()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_named_queue_is_used() {
        let broker = MemoryBroker::new();
        let settings = settings(&["k"]).set(Setting::Queue("todos".into()));
        let handle = session(&broker, settings, Chain::default())
            .start()
            .await
            .unwrap();
        assert_eq!(handle.queue(), "todos");
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_session() {
        let broker = MemoryBroker::new().with_credentials("guest", "guest");
        let settings = settings(&["k"])
            .set(Setting::User("guest".into()))
            .set(Setting::Password("wrong".into()));
        let session = session(&broker, settings, Chain::default());

        let err = session.start().await.unwrap_err();

        assert!(matches!(err, SessionError::Connection(BrokerError::ConnectionFailed { .. })));
        assert!(!err.to_string().contains("wrong"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_exchange_type_conflict_fails_session() {
        let broker = MemoryBroker::new();
        let other = broker.connect("amqp://localhost").await.unwrap();
        other
            .create_channel()
            .await
            .unwrap()
            .assert_exchange("DEV", ExchangeType::Topic, &ExchangeOptions::default())
            .await
            .unwrap();

        let session = session(&broker, settings(&["k"]), Chain::default());
        let err = session.start().await.unwrap_err();

        match &err {
            SessionError::Assertion { step, source } => {
                assert_eq!(step, &AssertionStep::Exchange { name: "DEV".into() });
                assert!(matches!(source, BrokerError::PreconditionFailed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        // Only the connection that declared the topic exchange is left.
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_queue_of_other_connection_fails_at_queue_step() {
        let broker = MemoryBroker::new();
        let owner = broker.connect("amqp://localhost").await.unwrap();
        owner
            .create_channel()
            .await
            .unwrap()
            .assert_queue("todos", &QueueOptions::default())
            .await
            .unwrap();

        let settings = settings(&["k"]).set(Setting::Queue("todos".into()));
        let err = session(&broker, settings, Chain::default())
            .start()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Assertion {
                step: AssertionStep::Queue { .. },
                source: BrokerError::AccessRefused(_),
            }
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = MemoryBroker::new();
        let session = session(&broker, settings(&["k"]), Chain::default());
        let _handle = session.start().await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted(SessionState::Consuming)));
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_deliveries_reach_chain() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chain = Chain::builder()
            .handler(move |ctx: Arc<Context>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((ctx.routing_key().to_string(), ctx.json::<Value>().ok()));
                }
            })
            .build();
        let _handle = session(&broker, settings(&["k"]), chain).start().await.unwrap();

        broker.publish("DEV", "k", br#"{"n":1}"#.to_vec()).unwrap();

        let (key, body) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(key, "k");
        assert_eq!(body, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_failures_reach_observer_and_consumption_continues() {
        let broker = MemoryBroker::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let chain = Chain::builder()
            .handler(|ctx: Arc<Context>, next: Next| async move {
                if ctx.content() == b"panic" {
                    panic!("handler exploded");
                }
                let body: Value = ctx.json()?;
                ctx.set("body", body);
                next.run().await?;
                Ok::<(), BoxError>(())
            })
            .handler(move |ctx: Arc<Context>| {
                let done_tx = done_tx.clone();
                async move {
                    let _ = done_tx.send(ctx.get("body"));
                }
            })
            .build();
        let session = BindingSession::new(
            Arc::new(settings(&["k"])),
            Arc::new(broker.clone()),
            chain,
            observer(move |err, ctx| {
                let _ = err_tx.send((err.to_string(), ctx.content().to_vec()));
            }),
        );
        let handle = session.start().await.unwrap();

        broker.publish("DEV", "k", b"not json".to_vec()).unwrap();
        broker.publish("DEV", "k", b"panic".to_vec()).unwrap();
        broker.publish("DEV", "k", br#"{"ok":true}"#.to_vec()).unwrap();

        let body = timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
        assert_eq!(body, Some(json!({ "ok": true })));

        let mut failures = vec![
            timeout(WAIT, err_rx.recv()).await.unwrap().unwrap(),
            timeout(WAIT, err_rx.recv()).await.unwrap().unwrap(),
        ];
        failures.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(failures[0].1, b"not json");
        assert!(failures[0].0.starts_with("handler #0 failed"));
        assert_eq!(failures[1].1, b"panic");
        assert_eq!(failures[1].0, "handler panicked: handler exploded");

        assert_eq!(handle.state(), SessionState::Consuming);
    }

    #[tokio::test]
    async fn test_manual_ack_through_context() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chain = Chain::builder()
            .handler(move |ctx: Arc<Context>| {
                let tx = tx.clone();
                async move {
                    ctx.ack().await?;
                    let _ = tx.send(());
                    Ok::<(), BoxError>(())
                }
            })
            .build();
        let settings = settings(&["k"]).set(Setting::ConsumeOptions(ConsumeOptions {
            no_ack: false,
            ..ConsumeOptions::default()
        }));
        let _handle = session(&broker, settings, chain).start().await.unwrap();

        broker.publish("DEV", "k", b"{}".to_vec()).unwrap();
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_consuming_and_waits_for_in_flight() {
        let broker = MemoryBroker::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let chain = Chain::builder()
            .handler(move |_ctx: Arc<Context>| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                }
            })
            .build();
        let handle = session(&broker, settings(&["k"]), chain).start().await.unwrap();

        broker.publish("DEV", "k", b"{}".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close().await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(handle.closed().await, SessionState::Closed);
        assert_eq!(broker.connection_count(), 0);
        assert!(broker.publish("DEV", "k", b"{}".to_vec()).unwrap() == 0);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_disconnect_closes_session() {
        let broker = MemoryBroker::new();
        let handle = session(&broker, settings(&["k"]), Chain::default())
            .start()
            .await
            .unwrap();

        broker.disconnect("node down");

        assert_eq!(timeout(WAIT, handle.closed()).await.unwrap(), SessionState::Closed);
        handle.close().await.unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_stream_error_fails_session() {
        let state = Arc::new(watch::Sender::new(SessionState::Consuming));
        let stream: DeliveryStream = futures::stream::iter(vec![Err(BrokerError::Protocol(
            "frame error".into(),
        ))])
        .boxed();

        consume(
            stream,
            Chain::default(),
            default_observer(),
            CancellationToken::new(),
            TaskTracker::new(),
            Arc::clone(&state),
        )
        .await;

        assert_eq!(*state.borrow(), SessionState::Failed);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
