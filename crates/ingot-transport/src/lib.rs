//! # Ingot Transport
//!
//! Broker client implementations of the capability traits defined in
//! `ingot-core`.
//!
//! ## Features
//!
//! - (always) [`memory`]: an in-process broker with real routing semantics,
//!   used by tests and demos
//! - `amqp`: an AMQP 0-9-1 client backed by `lapin`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  ingot-runtime      │  (binding session)
//! ├─────────────────────┤
//! │  ingot-core         │  (Broker / Connection / Channel traits)
//! ├─────────────────────┤
//! │  ingot-transport    │  <- This crate (implementations)
//! ├─────────────────────┤
//! │  Network / memory   │
//! └─────────────────────┘
//! ```

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
