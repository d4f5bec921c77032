//! Agent-traffic wire protocol definitions.
//!
//! All agent traffic flows through one topic exchange as UTF-8 JSON
//! envelopes. An envelope is a flat mapping: conversation `messages`,
//! free-form `context_variables`, an optional `from_agent` marker on
//! handoffs, and run options on dispatches. Fields at their defaults are
//! omitted from the wire.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// The well-known topic exchange carrying all agent traffic.
pub const AGENT_EXCHANGE: &str = "agent_exchange";
/// Message time-to-live applied to every agent queue.
pub const QUEUE_MESSAGE_TTL_MS: u32 = 3_600_000; // 1h
/// Unacknowledged messages a consumer may hold at once.
pub const PREFETCH_COUNT: u16 = 1;

// ── Agent identity ───────────────────────────────────────────────────────────

/// A named participant in the pipeline.
///
/// The broker layer only routes on `name`; `instructions` and `model` are
/// carried for the orchestration layer and stay opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Agent {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model: None,
        }
    }

    /// Queue slug: lowercase name, spaces replaced with underscores.
    #[must_use]
    pub fn slug(&self) -> String {
        self.name.to_lowercase().replace(' ', "_")
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// One role/content pair in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Options carried on a dispatch envelope.
///
/// Mirrors the run signature the orchestration layer exposes; the broker
/// layer only transports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub debug: bool,
    /// Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u64>,
    #[serde(skip_serializing_if = "is_true")]
    pub execute_tools: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            model: None,
            stream: false,
            debug: false,
            max_turns: None,
            execute_tools: true,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_true(v: &bool) -> bool {
    *v
}

/// The wire payload published to an agent's routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context_variables: serde_json::Map<String, serde_json::Value>,
    /// Sender identity on handoff envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    #[serde(flatten)]
    pub options: RunOptions,
}

impl MessageEnvelope {
    /// Dispatch envelope: an initial task queued to an agent's own inbox.
    pub fn dispatch(
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
        options: RunOptions,
    ) -> Self {
        Self {
            messages,
            context_variables,
            from_agent: None,
            options,
        }
    }

    /// Handoff envelope: conversational control passed from one agent to
    /// another.
    pub fn handoff(
        from_agent: impl Into<String>,
        messages: Vec<ChatMessage>,
        context_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            messages,
            context_variables,
            from_agent: Some(from_agent.into()),
            options: RunOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_derivation() {
        let agent = Agent::new("Agent A", "You are a helpful agent.");
        assert_eq!(agent.slug(), "agent_a");
        assert_eq!(Agent::new("Publisher", "").slug(), "publisher");
        assert_eq!(Agent::new("News Gatherer Two", "").slug(), "news_gatherer_two");
    }

    #[test]
    fn test_envelope_round_trip_is_structurally_identical() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("conversation_id".into(), "test_123".into());
        ctx.insert("attempt".into(), 2.into());
        let envelope = MessageEnvelope::dispatch(
            vec![
                ChatMessage::user("I want to talk to agent B."),
                ChatMessage::new("assistant", "Sure."),
            ],
            ctx,
            RunOptions {
                model: Some("llama3.1:latest".into()),
                max_turns: Some(4),
                ..RunOptions::default()
            },
        );

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: MessageEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_handoff_envelope_stays_minimal_on_the_wire() {
        let envelope = MessageEnvelope::handoff(
            "Agent A",
            vec![ChatMessage::user("over to you")],
            serde_json::Map::new(),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj["from_agent"], "Agent A");
        // Default run options and empty context are omitted entirely.
        let mut keys: Vec<_> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["from_agent", "messages"]);
    }

    #[test]
    fn test_run_option_defaults() {
        let opts: RunOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.execute_tools);
        assert!(!opts.stream);
        assert!(!opts.debug);
        assert_eq!(opts.max_turns, None);
        assert_eq!(opts.model, None);
    }

    #[test]
    fn test_dispatch_envelope_carries_run_options_flat() {
        let envelope = MessageEnvelope::dispatch(
            vec![ChatMessage::user("go")],
            serde_json::Map::new(),
            RunOptions {
                stream: true,
                execute_tools: false,
                ..RunOptions::default()
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        // Flattened, not nested under an "options" key.
        assert_eq!(value["stream"], true);
        assert_eq!(value["execute_tools"], false);
        assert!(value.get("options").is_none());
    }
}
