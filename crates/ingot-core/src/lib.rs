//! # Ingot Core
//!
//! Fundamental types shared by every Ingot crate:
//!
//! - **Settings**: connection and binding configuration ([`Settings`], [`Setting`])
//! - **Deliveries**: raw messages as a broker hands them over ([`Delivery`])
//! - **Context**: the per-message record handlers operate on ([`Context`])
//! - **Broker capability**: the abstract client the runtime drives ([`Broker`])
//!
//! Nothing in this crate talks to a network; broker implementations live in
//! `ingot-transport`.

pub mod broker;
pub mod context;
pub mod delivery;
pub mod error;
pub mod settings;

pub use broker::{
    BoxedBroker, BoxedChannel, BoxedConnection, Broker, Channel, Connection, DeliveryStream,
};
pub use context::Context;
pub use delivery::{Acknowledger, BoxedAcknowledger, Delivery, Properties};
pub use error::{BrokerError, BrokerResult, SettingsError, SettingsResult, mask_password};
pub use settings::{ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions, Setting, Settings};
