//! Agent -> queue binding registry.
//!
//! The registry exclusively owns the agent-name-to-binding mapping.
//! Provisioning is idempotent: re-registering a bound agent is a no-op
//! reported as "already registered", and a sibling's provisioning failure
//! never aborts a batch.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    beeline_protocol::Agent,
    serde::Serialize,
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    transport::Transport,
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The (queue name, routing key) pair owned by one agent.
#[derive(Debug, Clone, Serialize)]
pub struct QueueBinding {
    pub agent: String,
    pub queue_name: String,
    pub routing_key: String,
    pub created_at_ms: u64,
}

impl QueueBinding {
    /// Deterministic derivation: "Agent A" -> `agent_agent_a_queue` /
    /// `agent.agent_a`.
    #[must_use]
    pub fn derive(agent: &Agent) -> Self {
        let slug = agent.slug();
        Self {
            agent: agent.name.clone(),
            queue_name: format!("agent_{slug}_queue"),
            routing_key: format!("agent.{slug}"),
            created_at_ms: now_ms(),
        }
    }
}

/// Live status of one agent's queue, as reported by `debug_queues`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueueHealth {
    Ok {
        queue_name: String,
        messages: u32,
        consumers: u32,
    },
    Error {
        message: String,
    },
}

pub struct QueueRegistry {
    transport: Arc<dyn Transport>,
    roster: RwLock<HashMap<String, QueueBinding>>,
}

impl QueueRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            roster: RwLock::new(HashMap::new()),
        }
    }

    /// Register `agent`, provisioning its queue if the broker does not
    /// have it yet.
    ///
    /// Returns `Ok(true)` when newly registered and `Ok(false)` when the
    /// agent was already registered or provisioning failed (the cause is
    /// logged). `Err` is reserved for an unusable broker connection.
    pub async fn register_agent(&self, agent: &Agent) -> Result<bool> {
        if !self.transport.ensure_open().await {
            return Err(Error::connection("broker connection unavailable"));
        }
        if self.roster.read().await.contains_key(&agent.name) {
            debug!(agent = %agent.name, "already registered");
            return Ok(false);
        }

        let binding = QueueBinding::derive(agent);
        let exists = match self.transport.queue_exists(&binding.queue_name).await {
            Ok(exists) => exists,
            Err(error) => {
                debug!(queue = %binding.queue_name, %error, "existence probe failed, declaring");
                false
            }
        };
        if !exists
            && let Err(error) = self
                .transport
                .declare_and_bind(&binding.queue_name, &binding.routing_key)
                .await
        {
            warn!(agent = %agent.name, queue = %binding.queue_name, %error, "queue provisioning failed");
            return Ok(false);
        }

        let mut roster = self.roster.write().await;
        if roster.contains_key(&agent.name) {
            debug!(agent = %agent.name, "already registered");
            return Ok(false);
        }
        info!(
            agent = %agent.name,
            queue = %binding.queue_name,
            routing_key = %binding.routing_key,
            "agent registered"
        );
        roster.insert(agent.name.clone(), binding);
        Ok(true)
    }

    /// Register each agent independently; returns the names that were
    /// newly registered. One agent's failure does not abort its siblings.
    pub async fn register_agents(&self, agents: &[Agent]) -> Vec<String> {
        let mut registered = Vec::new();
        for agent in agents {
            match self.register_agent(agent).await {
                Ok(true) => registered.push(agent.name.clone()),
                Ok(false) => {}
                Err(error) => {
                    warn!(agent = %agent.name, %error, "registration failed");
                }
            }
        }
        registered
    }

    /// Register `agent` if it has no binding yet and return its binding.
    pub async fn ensure_registered(&self, agent: &Agent) -> Result<QueueBinding> {
        if let Some(binding) = self.binding_for(&agent.name).await {
            return Ok(binding);
        }
        self.register_agent(agent).await?;
        self.binding_for(&agent.name).await.ok_or_else(|| {
            Error::connection(format!("queue provisioning failed for agent {}", agent.name))
        })
    }

    pub async fn is_registered(&self, agent_name: &str) -> bool {
        self.roster.read().await.contains_key(agent_name)
    }

    pub async fn binding_for(&self, agent_name: &str) -> Option<QueueBinding> {
        self.roster.read().await.get(agent_name).cloned()
    }

    /// Defensive copy of the roster, sorted by agent name.
    pub async fn registered_agents(&self) -> Vec<QueueBinding> {
        let mut bindings: Vec<_> = self.roster.read().await.values().cloned().collect();
        bindings.sort_by(|a, b| a.agent.cmp(&b.agent));
        bindings
    }

    /// Live queue depth and consumer count for every registered agent.
    ///
    /// Best-effort: a broker query failure for one agent is reported
    /// inline without aborting the others.
    pub async fn debug_queues(&self) -> HashMap<String, QueueHealth> {
        let mut report = HashMap::new();
        for binding in self.registered_agents().await {
            let health = match self.transport.queue_stats(&binding.queue_name).await {
                Ok(stats) => QueueHealth::Ok {
                    queue_name: binding.queue_name.clone(),
                    messages: stats.messages,
                    consumers: stats.consumers,
                },
                Err(error) => QueueHealth::Error {
                    message: error.to_string(),
                },
            };
            report.insert(binding.agent, health);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::transport_memory::InMemoryTransport};

    fn registry() -> (Arc<InMemoryTransport>, QueueRegistry) {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = QueueRegistry::new(transport.clone());
        (transport, registry)
    }

    #[test]
    fn test_binding_derivation_is_deterministic() {
        let binding = QueueBinding::derive(&Agent::new("Agent A", "Sender"));
        assert_eq!(binding.queue_name, "agent_agent_a_queue");
        assert_eq!(binding.routing_key, "agent.agent_a");

        let other = QueueBinding::derive(&Agent::new("Agent B", "Receiver"));
        assert_ne!(binding.queue_name, other.queue_name);
        assert_ne!(binding.routing_key, other.routing_key);
    }

    #[tokio::test]
    async fn test_register_twice_is_idempotent() {
        let (_, registry) = registry();
        let agent = Agent::new("Agent A", "Sender");

        assert!(registry.register_agent(&agent).await.unwrap());
        let first = registry.binding_for("Agent A").await.unwrap();

        assert!(!registry.register_agent(&agent).await.unwrap());
        let second = registry.binding_for("Agent A").await.unwrap();

        assert_eq!(first.queue_name, second.queue_name);
        assert_eq!(first.routing_key, second.routing_key);
        assert_eq!(registry.registered_agents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_fails_cleanly_when_broker_down() {
        let (transport, registry) = registry();
        transport.set_open(false);

        let result = registry.register_agent(&Agent::new("Agent A", "")).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert!(!registry.is_registered("Agent A").await);
    }

    #[tokio::test]
    async fn test_register_agents_skips_failing_sibling() {
        let (transport, registry) = registry();
        transport.fail_declare("agent_b_queue").await;

        let agents = vec![
            Agent::new("A", ""),
            Agent::new("B", ""),
            Agent::new("C", ""),
        ];
        let registered = registry.register_agents(&agents).await;
        assert_eq!(registered, vec!["A", "C"]);
        assert!(registry.is_registered("A").await);
        assert!(!registry.is_registered("B").await);
        assert!(registry.is_registered("C").await);
    }

    #[tokio::test]
    async fn test_roster_copy_does_not_expose_internal_state() {
        let (_, registry) = registry();
        registry
            .register_agent(&Agent::new("Agent A", ""))
            .await
            .unwrap();

        let mut roster = registry.registered_agents().await;
        roster.clear();
        assert_eq!(registry.registered_agents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_debug_queues_reports_errors_inline() {
        let (transport, registry) = registry();
        registry
            .register_agent(&Agent::new("Agent A", ""))
            .await
            .unwrap();
        registry
            .register_agent(&Agent::new("Agent B", ""))
            .await
            .unwrap();

        // Lose Agent B's queue out from under the registry.
        transport.drop_queue("agent_agent_b_queue").await;
        transport.publish("agent.agent_a", b"{}").await.unwrap();

        let report = registry.debug_queues().await;
        assert_eq!(report.len(), 2);
        let QueueHealth::Ok { messages, .. } = &report["Agent A"] else {
            panic!("expected ok status for Agent A");
        };
        assert_eq!(*messages, 1);
        assert!(matches!(report["Agent B"], QueueHealth::Error { .. }));
    }
}
