//! Agent-to-agent handoff.

use std::sync::Arc;

use {
    beeline_protocol::{Agent, ChatMessage, MessageEnvelope},
    tracing::info,
};

use crate::{error::Result, publish::Publisher, registry::QueueRegistry};

pub struct HandoffCoordinator {
    registry: Arc<QueueRegistry>,
    publisher: Publisher,
}

impl HandoffCoordinator {
    pub fn new(registry: Arc<QueueRegistry>, publisher: Publisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    /// Pass conversational control from `from` to `to`.
    ///
    /// The recipient is registered lazily, so a sender never has to
    /// pre-register every possible peer. Fire-and-forget: returning `Ok`
    /// means the envelope was published, not that anyone processed it.
    pub async fn handoff(
        &self,
        from: &Agent,
        to: &Agent,
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let binding = self.registry.ensure_registered(to).await?;
        let envelope = MessageEnvelope::handoff(&from.name, messages, context_variables);
        self.publisher
            .publish(&binding.routing_key, &envelope)
            .await?;
        info!(
            from = %from.name,
            to = %to.name,
            routing_key = %binding.routing_key,
            "handoff published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            transport::{ConsumerSession, Transport},
            transport_memory::InMemoryTransport,
        },
    };

    #[tokio::test]
    async fn test_handoff_lazily_provisions_recipient() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(QueueRegistry::new(transport.clone()));
        let coordinator =
            HandoffCoordinator::new(registry.clone(), Publisher::new(transport.clone()));

        let from = Agent::new("Agent A", "Sender");
        let to = Agent::new("Agent B", "Receiver");
        registry.register_agent(&from).await.unwrap();
        assert!(!registry.is_registered("Agent B").await);

        coordinator
            .handoff(
                &from,
                &to,
                vec![ChatMessage::user("over to you")],
                serde_json::Map::new(),
            )
            .await
            .unwrap();

        // B's binding was created, then exactly one envelope published.
        assert!(registry.is_registered("Agent B").await);
        assert_eq!(transport.published_count("agent.agent_b").await, 1);
        assert_eq!(transport.published_count("agent.agent_a").await, 0);

        let stats = transport.queue_stats("agent_agent_b_queue").await.unwrap();
        assert_eq!(stats.messages, 1);
    }

    #[tokio::test]
    async fn test_handoff_envelope_names_sender() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(QueueRegistry::new(transport.clone()));
        let coordinator =
            HandoffCoordinator::new(registry.clone(), Publisher::new(transport.clone()));

        let from = Agent::new("Agent A", "");
        let to = Agent::new("Agent B", "");
        coordinator
            .handoff(&from, &to, vec![ChatMessage::user("hi")], serde_json::Map::new())
            .await
            .unwrap();

        let mut session = transport.open_consumer("agent_agent_b_queue").await.unwrap();
        let delivery = session.next_delivery().await.unwrap().unwrap();
        let envelope: MessageEnvelope = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(envelope.from_agent.as_deref(), Some("Agent A"));
    }
}
