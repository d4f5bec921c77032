//! Queue-mediated message routing between pipeline agents.
//!
//! Each agent owns a durable inbox bound to one topic exchange; control
//! moves between agents by publishing JSON envelopes, never by direct
//! in-process calls. [`AgentBus`] is the entry point: register agents,
//! queue runs, hand off between agents, and consume an agent's inbox.
//!
//! Delivery is at-least-once: a message is acknowledged only after the
//! consumer callback returns cleanly, and a callback failure puts it
//! back on the queue. No ordering is guaranteed across different agents'
//! queues.

pub mod bus;
pub mod config;
pub mod consume;
pub mod dispatch;
pub mod error;
pub mod handoff;
pub mod publish;
pub mod registry;
pub mod transport;
pub mod transport_amqp;
pub mod transport_memory;

pub use {
    bus::AgentBus,
    config::BrokerConfig,
    consume::{ConsumeRetryConfig, Consumer, MessageHandler},
    dispatch::{RunDispatcher, RunReceipt, RunStatus},
    error::{Error, Result},
    handoff::HandoffCoordinator,
    publish::Publisher,
    registry::{QueueBinding, QueueHealth, QueueRegistry},
    transport::{ConsumerSession, Delivery, QueueStats, Transport},
    transport_amqp::AmqpTransport,
    transport_memory::InMemoryTransport,
};
