//! Forge Broker
//!
//! AMQP plumbing for the Forge worker.
//!
//! This crate provides:
//! - [`ConnectionSupervisor`]: connects to the broker, deduplicates close
//!   events and reconnects with a bounded backoff
//! - [`QueueDispatcher`]: binds handlers to durable queues with a prefetch
//!   limit, routes replies and settles every delivery exactly once
//!
//! It knows nothing about what the messages mean; handlers implement
//! [`MessageHandler`] and talk back through a [`Replier`].

pub mod connection;
pub mod dispatcher;
pub mod error;

pub use connection::{
    AmqpConnector, CloseSignal, ConnectionState, ConnectionSupervisor, Connector, ReconnectPolicy,
};
pub use dispatcher::{
    BoundedRun, Inbound, MessageHandler, QueueChannel, QueueDispatcher, Replier, Requeue,
    Settlement,
};
pub use error::{BrokerError, Result};
