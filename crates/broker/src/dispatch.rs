//! Task dispatch onto an agent's own queue.

use std::sync::Arc;

use {
    beeline_protocol::{Agent, ChatMessage, MessageEnvelope, RunOptions},
    serde::Serialize,
    tracing::info,
};

use crate::{error::Result, publish::Publisher, registry::QueueRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
}

/// Acknowledgement that a task was enqueued.
///
/// Nothing more: the agent processes the envelope asynchronously in
/// whatever process consumes its queue.
#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
    pub status: RunStatus,
    pub agent: String,
    pub routing_key: String,
}

pub struct RunDispatcher {
    registry: Arc<QueueRegistry>,
    publisher: Publisher,
}

impl RunDispatcher {
    pub fn new(registry: Arc<QueueRegistry>, publisher: Publisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    /// Queue an initial task for `agent`, registering it on first use.
    ///
    /// This is not an RPC: the receipt confirms enqueueing and nothing
    /// else.
    pub async fn run(
        &self,
        agent: &Agent,
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
        options: RunOptions,
    ) -> Result<RunReceipt> {
        let binding = self.registry.ensure_registered(agent).await?;
        let envelope = MessageEnvelope::dispatch(messages, context_variables, options);
        self.publisher
            .publish(&binding.routing_key, &envelope)
            .await?;
        info!(agent = %agent.name, routing_key = %binding.routing_key, "task queued");
        Ok(RunReceipt {
            status: RunStatus::Queued,
            agent: agent.name.clone(),
            routing_key: binding.routing_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{transport::Transport, transport_memory::InMemoryTransport},
    };

    #[tokio::test]
    async fn test_run_registers_and_queues() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(QueueRegistry::new(transport.clone()));
        let dispatcher = RunDispatcher::new(registry.clone(), Publisher::new(transport.clone()));

        let agent = Agent::new("Agent A", "You are a helpful agent.");
        let receipt = dispatcher
            .run(
                &agent,
                vec![ChatMessage::user("I want to talk to agent B.")],
                serde_json::Map::new(),
                RunOptions {
                    model: Some("llama3.1:latest".into()),
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.status, RunStatus::Queued);
        assert_eq!(receipt.routing_key, "agent.agent_a");
        assert!(registry.is_registered("Agent A").await);

        let stats = transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.messages, 1);
    }

    #[tokio::test]
    async fn test_run_twice_reuses_binding() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(QueueRegistry::new(transport.clone()));
        let dispatcher = RunDispatcher::new(registry.clone(), Publisher::new(transport.clone()));

        let agent = Agent::new("Agent A", "");
        for _ in 0..2 {
            dispatcher
                .run(
                    &agent,
                    vec![ChatMessage::user("go")],
                    serde_json::Map::new(),
                    RunOptions::default(),
                )
                .await
                .unwrap();
        }

        assert_eq!(registry.registered_agents().await.len(), 1);
        let stats = transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.messages, 2);
    }
}
