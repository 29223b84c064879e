//! The application facade.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ingot_runtime::Ingot;
//!
//! let app = Ingot::amqp();
//! app.set(Setting::Host("localhost".into()))
//!     .set(Setting::Aggregate("DEV".into()))
//!     .set(Setting::Events(vec!["DEV:TODO1".into()]));
//!
//! app.handler(parse_json).handler(store);
//! app.run().await?;
//! ```
//!
//! Or from configuration files:
//!
//! ```rust,ignore
//! let app = Ingot::builder()
//!     .config_file("config/ingot.toml")
//!     .profile("production")
//!     .build()?;
//! ```

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use ingot_core::{Broker, BoxedBroker, Context, Setting, Settings, SettingsResult};
use ingot_framework::{
    Chain, ChainBuilder, DispatchError, ErrorObserver, IntoMiddleware, default_observer,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::signal;
use tracing::{debug, info};

use crate::config::{ConfigLoader, IngotConfig, validate_logging, validate_settings};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::session::{BindingSession, SessionHandle};

/// A message consumer bound to one exchange.
///
/// Settings and handlers may be changed at any time; each call to
/// [`listen`](Self::listen) takes a snapshot of both.
pub struct Ingot {
    settings: RwLock<Arc<Settings>>,
    handlers: Mutex<ChainBuilder>,
    observer: RwLock<ErrorObserver>,
    broker: BoxedBroker,
}

impl Ingot {
    /// Creates a consumer with empty settings that connects through `broker`.
    pub fn new<B: Broker + 'static>(broker: B) -> Self {
        Self::with_broker(Arc::new(broker))
    }

    pub fn with_broker(broker: BoxedBroker) -> Self {
        Self {
            settings: RwLock::new(Arc::new(Settings::default())),
            handlers: Mutex::new(ChainBuilder::new()),
            observer: RwLock::new(default_observer()),
            broker,
        }
    }

    /// Creates a consumer that talks AMQP 0-9-1.
    #[cfg(feature = "amqp")]
    pub fn amqp() -> Self {
        Self::new(ingot_transport::AmqpBroker::new())
    }

    /// Creates a builder that loads configuration files.
    pub fn builder() -> IngotBuilder {
        IngotBuilder::new()
    }

    /// Creates a consumer from loaded configuration.
    ///
    /// Initializes logging from `config.logging` (a no-op if a subscriber is
    /// already installed) and uses `config.broker` as the initial settings.
    pub fn from_config(config: &IngotConfig, broker: BoxedBroker) -> Self {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            exchange = %config.broker.aggregate,
            "Ingot initialized from configuration"
        );

        let app = Self::with_broker(broker);
        *app.settings.write() = Arc::new(config.broker.clone());
        app
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Appends a handler to the chain.
    ///
    /// Handlers run in registration order for every message. Accepts
    /// `async fn(Arc<Context>, Next)` middleware, `async fn(Arc<Context>)`
    /// terminal handlers, or any [`Middleware`](ingot_framework::Middleware).
    pub fn handler<H, M>(&self, handler: H) -> &Self
    where
        H: IntoMiddleware<M>,
    {
        let mut handlers = self.handlers.lock();
        handlers.push(handler);
        debug!(handler_count = handlers.len(), "Registered handler");
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Compiles the handlers registered so far.
    pub fn chain(&self) -> Chain {
        self.handlers.lock().build()
    }

    /// Replaces the dispatch error observer.
    ///
    /// The observer is called once for every message whose dispatch failed,
    /// including panics. It replaces the default one, which logs the error.
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: Fn(&DispatchError, &Context) + Send + Sync + 'static,
    {
        *self.observer.write() = Arc::new(f);
        self
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Applies one setting, keeping every other key.
    pub fn set(&self, setting: Setting) -> &Self {
        let key = setting.key().to_string();
        let mut settings = self.settings.write();
        *settings = Arc::new(settings.set(setting));
        debug!(key = %key, "Setting updated");
        self
    }

    /// Applies a setting given as a string key and a JSON value.
    ///
    /// Unknown keys are stored verbatim. A recognised key with a value of the
    /// wrong shape is rejected and leaves the settings untouched.
    pub fn set_value(&self, key: &str, value: Value) -> SettingsResult<&Self> {
        let setting = Setting::parse(key, value)?;
        Ok(self.set(setting))
    }

    /// Returns the current settings snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts a binding session from the current settings and handlers.
    ///
    /// Resolves once the queue is bound and consuming. Handlers registered
    /// afterwards do not join the returned session.
    pub async fn listen(&self) -> RuntimeResult<SessionHandle> {
        let settings = self.settings();
        validate_settings(&settings)?;

        let chain = self.chain();
        let observer = Arc::clone(&self.observer.read());
        let session = BindingSession::new(settings, Arc::clone(&self.broker), chain, observer);

        Ok(session.start().await?)
    }

    /// Consumes until `shutdown` resolves, then closes the session.
    ///
    /// Fails with [`RuntimeError::SessionEnded`] if the session stops first.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.serve(async {
            shutdown.await;
            Ok(())
        })
        .await
    }

    /// Consumes until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.serve(async { shutdown_signal().await.map_err(RuntimeError::from) })
            .await
    }

    async fn serve<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = RuntimeResult<()>>,
    {
        let handle = self.listen().await?;
        info!(queue = %handle.queue(), "Ingot is now consuming");

        let outcome = tokio::select! {
            result = shutdown => result,
            state = handle.closed() => Err(RuntimeError::SessionEnded(state)),
        };

        handle.close().await?;
        outcome
    }
}

impl fmt::Debug for Ingot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingot")
            .field("exchange", &self.settings.read().aggregate)
            .field("handler_count", &self.handler_count())
            .finish_non_exhaustive()
    }
}

/// Waits for Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
        Ok(())
    }
}

// =============================================================================
// IngotBuilder
// =============================================================================

/// Builder for an [`Ingot`] configured from files and the environment.
pub struct IngotBuilder {
    config_loader: ConfigLoader,
    broker: Option<BoxedBroker>,
}

impl IngotBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            broker: None,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration below files and the environment.
    pub fn merge(mut self, config: IngotConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Connects through `broker` instead of the default AMQP client.
    pub fn broker<B: Broker + 'static>(mut self, broker: B) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Loads the configuration and creates the consumer.
    ///
    /// Broker settings are validated by [`Ingot::listen`], so they may still
    /// be completed with [`Ingot::set`] after building.
    pub fn build(self) -> RuntimeResult<Ingot> {
        let config = self.config_loader.load()?;
        validate_logging(&config.logging)?;

        let broker = match self.broker {
            Some(broker) => broker,
            None => default_broker()?,
        };
        Ok(Ingot::from_config(&config, broker))
    }
}

impl Default for IngotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "amqp")]
fn default_broker() -> RuntimeResult<BoxedBroker> {
    Ok(Arc::new(ingot_transport::AmqpBroker::new()))
}

#[cfg(not(feature = "amqp"))]
fn default_broker() -> RuntimeResult<BoxedBroker> {
    Err(crate::config::ConfigError::validation(
        "no broker client available; enable the `amqp` feature or call `IngotBuilder::broker`",
    )
    .into())
}
