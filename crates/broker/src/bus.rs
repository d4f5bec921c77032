//! The broker-integration facade.
//!
//! [`AgentBus`] wires the transport, registry, publisher, dispatcher,
//! and handoff coordinator together behind one handle, and owns the
//! shutdown signal observed by every consumer loop it starts.

use std::{collections::HashMap, sync::Arc};

use {
    beeline_protocol::{Agent, ChatMessage, RunOptions},
    tokio::sync::watch,
};

use crate::{
    config::BrokerConfig,
    consume::{ConsumeRetryConfig, Consumer, MessageHandler},
    dispatch::{RunDispatcher, RunReceipt},
    error::Result,
    handoff::HandoffCoordinator,
    publish::Publisher,
    registry::{QueueBinding, QueueHealth, QueueRegistry},
    transport::Transport,
    transport_amqp::AmqpTransport,
};

pub struct AgentBus {
    transport: Arc<dyn Transport>,
    registry: Arc<QueueRegistry>,
    dispatcher: RunDispatcher,
    handoffs: HandoffCoordinator,
    retry: ConsumeRetryConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentBus {
    /// Connect to the broker and declare the agent exchange.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let transport = Arc::new(AmqpTransport::connect(config).await?);
        Ok(Self::with_transport(transport))
    }

    /// Build a bus over an already-constructed transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::with_retry_config(transport, ConsumeRetryConfig::default())
    }

    pub fn with_retry_config(transport: Arc<dyn Transport>, retry: ConsumeRetryConfig) -> Self {
        let registry = Arc::new(QueueRegistry::new(Arc::clone(&transport)));
        let publisher = Publisher::new(Arc::clone(&transport));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dispatcher: RunDispatcher::new(Arc::clone(&registry), publisher.clone()),
            handoffs: HandoffCoordinator::new(Arc::clone(&registry), publisher),
            transport,
            registry,
            retry,
            shutdown_tx,
        }
    }

    /// Idempotent registration; see [`QueueRegistry::register_agent`].
    pub async fn register_agent(&self, agent: &Agent) -> Result<bool> {
        self.registry.register_agent(agent).await
    }

    /// Register a batch; returns the names that were newly registered.
    pub async fn register_agents(&self, agents: &[Agent]) -> Vec<String> {
        self.registry.register_agents(agents).await
    }

    pub async fn registered_agents(&self) -> Vec<QueueBinding> {
        self.registry.registered_agents().await
    }

    /// Queue a task for `agent`; returns an enqueue receipt, never a
    /// computed result.
    pub async fn run(
        &self,
        agent: &Agent,
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
        options: RunOptions,
    ) -> Result<RunReceipt> {
        self.dispatcher
            .run(agent, messages, context_variables, options)
            .await
    }

    /// Hand conversational control from `from` to `to`.
    pub async fn handoff(
        &self,
        from: &Agent,
        to: &Agent,
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.handoffs
            .handoff(from, to, messages, context_variables)
            .await
    }

    /// Consume `agent`'s queue until [`AgentBus::shutdown`] is called.
    ///
    /// Run one call per agent, each on its own task.
    pub async fn start_consuming(&self, agent: &Agent, handler: MessageHandler) -> Result<()> {
        let consumer = Consumer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.transport),
            self.retry.clone(),
            self.shutdown_tx.subscribe(),
        );
        consumer.start_consuming(agent, handler).await
    }

    /// Live queue stats for every registered agent.
    pub async fn debug_queues(&self) -> HashMap<String, QueueHealth> {
        self.registry.debug_queues().await
    }

    /// Signal every consumer loop started from this bus to stop after
    /// its in-flight message.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop consumers and release the broker connection. Never raises.
    pub async fn close(&self) {
        self.shutdown();
        self.transport.close().await;
    }
}
