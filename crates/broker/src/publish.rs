//! Envelope publication.

use std::sync::Arc;

use {
    beeline_protocol::MessageEnvelope,
    tracing::{debug, error},
};

use crate::{
    error::{Error, Result},
    transport::Transport,
};

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Serialize `envelope` and publish it to `routing_key` with
    /// persistent delivery.
    ///
    /// Publishing through a stale channel fails outright, so the link is
    /// revalidated (reconnecting on demand) immediately before the send.
    pub async fn publish(&self, routing_key: &str, envelope: &MessageEnvelope) -> Result<()> {
        if !self.transport.ensure_open().await {
            return Err(Error::connection("broker connection unavailable"));
        }
        let body = serde_json::to_vec(envelope)?;
        if let Err(err) = self.transport.publish(routing_key, &body).await {
            error!(routing_key, error = %err, "publish failed");
            return Err(err);
        }
        debug!(routing_key, bytes = body.len(), "envelope published");
        Ok(())
    }
}
