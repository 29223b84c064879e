//! Connection and binding settings.
//!
//! [`Settings`] is an immutable snapshot. Updates go through
//! [`Settings::set`], which returns a new snapshot with one key replaced and
//! every other key preserved:
//!
//! ```rust,ignore
//! use ingot_core::{ExchangeType, Setting, Settings};
//!
//! let settings = Settings::default()
//!     .set(Setting::Host("localhost".into()))
//!     .set(Setting::Aggregate("DEV".into()))
//!     .set(Setting::ExchangeType(ExchangeType::Fanout))
//!     .set(Setting::Events(vec!["DEV:TODO1".into()]));
//!
//! assert_eq!(settings.url(), "amqp://localhost");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{SettingsError, SettingsResult};

// =============================================================================
// Exchange Type
// =============================================================================

/// The routing rule of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Every message goes to every bound queue; routing keys are ignored.
    #[default]
    Fanout,
    /// Exact routing-key match.
    Direct,
    /// Dot-separated routing-key patterns with `*` and `#` wildcards.
    Topic,
    /// Match on message header values.
    Headers,
}

impl ExchangeType {
    /// Returns the protocol name of this exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            _ => Err(SettingsError::UnknownExchangeType(s.to_string())),
        }
    }
}

// =============================================================================
// Option Groups
// =============================================================================

/// Flags used when asserting the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete once the last queue is unbound.
    pub auto_delete: bool,
    /// Reject direct publishes from clients.
    pub internal: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

/// Flags used when asserting the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    /// Only this connection may use the queue; it is deleted on close.
    pub exclusive: bool,
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete once the last consumer goes away.
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            exclusive: true,
            durable: false,
            auto_delete: false,
        }
    }
}

/// Flags used when starting consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumeOptions {
    /// The broker considers messages acknowledged as soon as they are sent.
    pub no_ack: bool,
    /// Request exclusive consumer access to the queue.
    pub exclusive: bool,
    /// Consumer tag; blank lets the broker pick one.
    pub consumer_tag: String,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            no_ack: true,
            exclusive: false,
            consumer_tag: String::new(),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Connection and binding configuration for one subscription.
///
/// Field names on the wire follow the keys callers use with
/// [`Setting::parse`]: `host`, `user`, `password`, `aggregate`, `type`,
/// `exchangeOption`, `queue`, `queueOption`, `consumeOption`, `events`.
/// Unrecognised keys are kept in [`extra`](Self::extra).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker network address.
    pub host: String,
    /// Optional user name; only used when `password` is also set.
    pub user: String,
    /// Optional password; only used when `user` is also set.
    pub password: String,
    /// Name of the exchange to bind to.
    pub aggregate: String,
    /// Exchange type used when asserting the exchange.
    #[serde(rename = "type")]
    pub exchange_type: ExchangeType,
    #[serde(rename = "exchangeOption")]
    pub exchange_options: ExchangeOptions,
    /// Queue name; blank means broker-assigned.
    pub queue: String,
    #[serde(rename = "queueOption")]
    pub queue_options: QueueOptions,
    #[serde(rename = "consumeOption")]
    pub consume_options: ConsumeOptions,
    /// Routing keys bound to the queue, in order.
    pub events: Vec<String>,
    /// Keys this crate does not interpret, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Returns a copy of these settings with `setting` applied.
    ///
    /// Every key not named by `setting` keeps its current value.
    #[must_use]
    pub fn set(&self, setting: Setting) -> Self {
        let mut next = self.clone();
        match setting {
            Setting::Host(v) => next.host = v,
            Setting::User(v) => next.user = v,
            Setting::Password(v) => next.password = v,
            Setting::Aggregate(v) => next.aggregate = v,
            Setting::ExchangeType(v) => next.exchange_type = v,
            Setting::ExchangeOptions(v) => next.exchange_options = v,
            Setting::Queue(v) => next.queue = v,
            Setting::QueueOptions(v) => next.queue_options = v,
            Setting::ConsumeOptions(v) => next.consume_options = v,
            Setting::Events(v) => next.events = v,
            // A recognised key never lands in `extra`: a well-shaped value is
            // applied as the typed setting and a malformed one is dropped.
            Setting::Other(key, value) => match Setting::parse(&key, value.clone()) {
                Ok(Setting::Other(..)) => {
                    next.extra.insert(key, value);
                }
                Ok(typed) => return self.set(typed),
                Err(err) => warn!(key = %key, error = %err, "Ignoring malformed setting"),
            },
        }
        next
    }

    /// Returns `true` when both user and password are non-empty.
    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }

    /// Builds the broker connection URL.
    ///
    /// `amqp://{user}:{password}@{host}` when both credentials are non-empty,
    /// `amqp://{host}` otherwise.
    pub fn url(&self) -> String {
        if self.has_credentials() {
            format!("amqp://{}:{}@{}", self.user, self.password, self.host)
        } else {
            format!("amqp://{}", self.host)
        }
    }

    /// Returns a passthrough value stored under an unrecognised key.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

// =============================================================================
// Setting
// =============================================================================

/// A single settings update, one variant per recognised key.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Host(String),
    User(String),
    Password(String),
    Aggregate(String),
    ExchangeType(ExchangeType),
    ExchangeOptions(ExchangeOptions),
    Queue(String),
    QueueOptions(QueueOptions),
    ConsumeOptions(ConsumeOptions),
    Events(Vec<String>),
    /// Any key this crate does not interpret.
    Other(String, Value),
}

impl Setting {
    /// Returns the wire key this setting updates.
    pub fn key(&self) -> &str {
        match self {
            Self::Host(_) => "host",
            Self::User(_) => "user",
            Self::Password(_) => "password",
            Self::Aggregate(_) => "aggregate",
            Self::ExchangeType(_) => "type",
            Self::ExchangeOptions(_) => "exchangeOption",
            Self::Queue(_) => "queue",
            Self::QueueOptions(_) => "queueOption",
            Self::ConsumeOptions(_) => "consumeOption",
            Self::Events(_) => "events",
            Self::Other(key, _) => key,
        }
    }

    /// Maps a string key and a JSON value to a typed setting.
    ///
    /// Unknown keys become [`Setting::Other`]. A recognised key whose value
    /// has the wrong shape is rejected.
    pub fn parse(key: &str, value: Value) -> SettingsResult<Self> {
        Ok(match key {
            "host" => Self::Host(decode(key, value)?),
            "user" => Self::User(decode(key, value)?),
            "password" => Self::Password(decode(key, value)?),
            "aggregate" => Self::Aggregate(decode(key, value)?),
            "type" => match value {
                Value::String(name) => Self::ExchangeType(name.parse()?),
                other => Self::ExchangeType(decode(key, other)?),
            },
            "exchangeOption" => Self::ExchangeOptions(decode(key, value)?),
            "queue" => Self::Queue(decode(key, value)?),
            "queueOption" => Self::QueueOptions(decode(key, value)?),
            "consumeOption" => Self::ConsumeOptions(decode(key, value)?),
            "events" => Self::Events(decode(key, value)?),
            _ => Self::Other(key.to_string(), value),
        })
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> SettingsResult<T> {
    serde_json::from_value(value).map_err(|e| SettingsError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.exchange_type, ExchangeType::Fanout);
        assert!(settings.exchange_options.durable);
        assert!(settings.queue_options.exclusive);
        assert!(settings.consume_options.no_ack);
        assert!(settings.events.is_empty());
    }

    #[test]
    fn test_set_preserves_other_keys() {
        let a = Settings::default()
            .set(Setting::Host("h".into()))
            .set(Setting::Aggregate("DEV".into()));
        let b = Settings::default()
            .set(Setting::Aggregate("DEV".into()))
            .set(Setting::Host("h".into()));

        assert_eq!(a, b);
        assert_eq!(a.host, "h");
        assert_eq!(a.aggregate, "DEV");
    }

    #[test]
    fn test_set_is_copy_on_write() {
        let original = Settings::default();
        let updated = original.set(Setting::Queue("jobs".into()));
        assert_eq!(original.queue, "");
        assert_eq!(updated.queue, "jobs");
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let settings = Settings::default()
            .set(Setting::Other("heartbeat".into(), json!(10)))
            .set(Setting::Host("h".into()));
        assert_eq!(settings.extra("heartbeat"), Some(&json!(10)));
    }

    #[test]
    fn test_other_with_known_key_is_typed() {
        let settings = Settings::default().set(Setting::Other("host".into(), json!("h")));
        assert_eq!(settings.host, "h");
        assert!(settings.extra.is_empty());
    }

    #[test]
    fn test_other_with_malformed_known_key_is_dropped() {
        let settings = Settings::default()
            .set(Setting::Host("h".into()))
            .set(Setting::Other("host".into(), json!(5)));
        assert_eq!(settings.host, "h");
        assert!(settings.extra.is_empty());

        let encoded = serde_json::to_string(&settings).unwrap();
        assert_eq!(encoded.matches("\"host\"").count(), 1);
        let decoded: Settings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_url_without_credentials() {
        let settings = Settings::default().set(Setting::Host("h".into()));
        assert_eq!(settings.url(), "amqp://h");
    }

    #[test]
    fn test_url_with_credentials() {
        let settings = Settings::default()
            .set(Setting::Host("h".into()))
            .set(Setting::User("u".into()))
            .set(Setting::Password("p".into()));
        assert_eq!(settings.url(), "amqp://u:p@h");
    }

    #[test]
    fn test_url_requires_both_credentials() {
        let settings = Settings::default()
            .set(Setting::Host("h".into()))
            .set(Setting::User("u".into()));
        assert_eq!(settings.url(), "amqp://h");
    }

    #[test]
    fn test_parse_known_keys() {
        assert_eq!(
            Setting::parse("type", json!("Topic")).unwrap(),
            Setting::ExchangeType(ExchangeType::Topic)
        );
        assert_eq!(
            Setting::parse("consumeOption", json!({ "noAck": false })).unwrap(),
            Setting::ConsumeOptions(ConsumeOptions {
                no_ack: false,
                ..Default::default()
            })
        );
        assert_eq!(
            Setting::parse("events", json!(["a", "b"])).unwrap(),
            Setting::Events(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(matches!(
            Setting::parse("events", json!("DEV:TODO1")),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            Setting::parse("type", json!("broadcast")),
            Err(SettingsError::UnknownExchangeType(_))
        ));
    }

    #[test]
    fn test_deserialize_wire_names() {
        let settings: Settings = serde_json::from_value(json!({
            "host": "rabbit",
            "type": "direct",
            "exchangeOption": { "durable": false },
            "events": ["k1"],
            "heartbeat": 10
        }))
        .unwrap();

        assert_eq!(settings.host, "rabbit");
        assert_eq!(settings.exchange_type, ExchangeType::Direct);
        assert!(!settings.exchange_options.durable);
        assert_eq!(settings.events, vec!["k1".to_string()]);
        assert_eq!(settings.extra("heartbeat"), Some(&json!(10)));
    }
}
