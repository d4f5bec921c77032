//! Per-agent receive loop.
//!
//! One loop per agent, each on its own consumer session with prefetch 1.
//! A delivery is acknowledged only after the handler returns cleanly; a
//! handler error sends the message back to the queue (at-least-once, so
//! handlers must tolerate redelivery). Connection loss retries the whole
//! loop with linearly increasing waits, then gives up without taking the
//! process down.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    beeline_protocol::{Agent, MessageEnvelope},
    tokio::sync::watch,
    tracing::{error, info, warn},
};

use crate::{
    error::{Error, Result},
    registry::{QueueBinding, QueueRegistry},
    transport::{ConsumerSession, Delivery, Transport},
};

/// Callback invoked with each decoded envelope.
///
/// An `Err` return requeues the message.
pub type MessageHandler = Arc<
    dyn Fn(MessageEnvelope) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Reconnect policy for the consume loop.
#[derive(Debug, Clone)]
pub struct ConsumeRetryConfig {
    /// Reconnect attempts after the first connection-level failure.
    pub max_attempts: u32,
    /// Attempt `n` waits `n * backoff_step` before resubscribing.
    pub backoff_step: Duration,
}

impl Default for ConsumeRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(5),
        }
    }
}

pub struct Consumer {
    registry: Arc<QueueRegistry>,
    transport: Arc<dyn Transport>,
    retry: ConsumeRetryConfig,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    pub fn new(
        registry: Arc<QueueRegistry>,
        transport: Arc<dyn Transport>,
        retry: ConsumeRetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            transport,
            retry,
            shutdown,
        }
    }

    /// Consume `agent`'s queue until the shutdown signal fires.
    ///
    /// Fails with a validation error when the agent was never registered.
    /// On connection loss the loop is retried with increasing waits;
    /// exhausting the attempts returns [`Error::RetryExhausted`] so the
    /// caller can keep other agents running.
    pub async fn start_consuming(&self, agent: &Agent, handler: MessageHandler) -> Result<()> {
        let Some(binding) = self.registry.binding_for(&agent.name).await else {
            return Err(Error::validation(format!(
                "agent {} is not registered",
                agent.name
            )));
        };
        info!(agent = %agent.name, queue = %binding.queue_name, "consumer starting");

        let mut shutdown = self.shutdown.clone();
        let mut attempt: u32 = 0;
        loop {
            let err = match self.consume_session(&binding, &handler, &mut shutdown).await {
                Ok(()) => {
                    info!(agent = %agent.name, "consumer stopped");
                    return Ok(());
                }
                Err(err) => err,
            };

            attempt += 1;
            if attempt > self.retry.max_attempts {
                error!(
                    agent = %agent.name,
                    attempts = self.retry.max_attempts,
                    "consumer giving up"
                );
                return Err(Error::RetryExhausted {
                    agent: agent.name.clone(),
                    attempts: self.retry.max_attempts,
                });
            }

            let wait = self.retry.backoff_step * attempt;
            warn!(
                agent = %agent.name,
                error = %err,
                attempt,
                max_attempts = self.retry.max_attempts,
                wait_ms = wait.as_millis() as u64,
                "consume loop failed, retrying"
            );
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One subscription: runs until the shutdown signal (Ok) or a
    /// connection-level failure (Err).
    async fn consume_session(
        &self,
        binding: &QueueBinding,
        handler: &MessageHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.transport.ensure_open().await {
            return Err(Error::connection("broker connection unavailable"));
        }
        let mut session = self.transport.open_consumer(&binding.queue_name).await?;
        info!(queue = %binding.queue_name, "consuming");

        loop {
            // The shutdown arm only wins between deliveries, so an
            // in-flight message always reaches its ack or nack.
            let next = tokio::select! {
                next = session.next_delivery() => Some(next),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        None
                    } else {
                        continue;
                    }
                }
            };
            let Some(next) = next else {
                session.cancel().await;
                return Ok(());
            };
            match next {
                Ok(Some(delivery)) => {
                    self.handle_delivery(session.as_mut(), delivery, handler)
                        .await?;
                }
                Ok(None) => return Err(Error::connection("delivery stream ended")),
                Err(err) => return Err(err),
            }
        }
    }

    async fn handle_delivery(
        &self,
        session: &mut dyn ConsumerSession,
        delivery: Delivery,
        handler: &MessageHandler,
    ) -> Result<()> {
        let envelope: MessageEnvelope = match serde_json::from_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Requeueing an undecodable body would redeliver it
                // forever; drop it to keep the queue usable.
                error!(tag = delivery.tag, error = %err, "malformed envelope, discarding");
                return session.nack_discard(delivery.tag).await;
            }
        };
        match handler(envelope).await {
            Ok(()) => session.ack(delivery.tag).await,
            Err(cause) => {
                let err = Error::processing(cause);
                warn!(tag = delivery.tag, error = %err, "handler failed, requeueing");
                session.nack_requeue(delivery.tag).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use {
        super::*,
        crate::{publish::Publisher, transport_memory::InMemoryTransport},
        beeline_protocol::{ChatMessage, RunOptions},
    };

    struct Fixture {
        transport: Arc<InMemoryTransport>,
        registry: Arc<QueueRegistry>,
        publisher: Publisher,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(QueueRegistry::new(transport.clone()));
        let publisher = Publisher::new(transport.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Fixture {
            transport,
            registry,
            publisher,
            shutdown_tx,
        }
    }

    impl Fixture {
        fn consumer(&self) -> Consumer {
            self.consumer_with_retry(ConsumeRetryConfig {
                max_attempts: 3,
                backoff_step: Duration::from_millis(5),
            })
        }

        fn consumer_with_retry(&self, retry: ConsumeRetryConfig) -> Consumer {
            Consumer::new(
                self.registry.clone(),
                self.transport.clone(),
                retry,
                self.shutdown_tx.subscribe(),
            )
        }
    }

    fn envelope(content: &str) -> MessageEnvelope {
        let mut ctx = serde_json::Map::new();
        ctx.insert("conversation_id".into(), "test_123".into());
        MessageEnvelope::dispatch(
            vec![ChatMessage::user(content)],
            ctx,
            RunOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_unregistered_agent_is_rejected() {
        let fx = fixture();
        let handler: MessageHandler = Arc::new(|_| Box::pin(async { Ok(()) }));

        let result = fx
            .consumer()
            .start_consuming(&Agent::new("Ghost", ""), handler)
            .await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn test_round_trip_preserves_envelope_structure() {
        let fx = fixture();
        let agent = Agent::new("Agent A", "");
        fx.registry.register_agent(&agent).await.unwrap();

        let sent = envelope("I want to talk to agent B.");
        fx.publisher.publish("agent.agent_a", &sent).await.unwrap();

        let (received_tx, mut received_rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |envelope| {
            let tx = received_tx.clone();
            Box::pin(async move {
                let _ = tx.send(envelope);
                Ok(())
            })
        });

        let consumer = fx.consumer();
        let shutdown_tx = fx.shutdown_tx.clone();
        let received = tokio::spawn(async move {
            let envelope = received_rx.recv().await;
            let _ = shutdown_tx.send(true);
            envelope
        });

        consumer.start_consuming(&agent, handler).await.unwrap();
        let received = received.await.unwrap().unwrap();
        assert_eq!(received, sent);

        // Acked: nothing left on the queue.
        let stats = fx.transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn test_handler_error_requeues_for_redelivery() {
        let fx = fixture();
        let agent = Agent::new("Agent A", "");
        fx.registry.register_agent(&agent).await.unwrap();
        fx.publisher
            .publish("agent.agent_a", &envelope("flaky"))
            .await
            .unwrap();

        let deliveries = Arc::new(AtomicU32::new(0));
        let seen = deliveries.clone();
        let shutdown_tx = fx.shutdown_tx.clone();
        let handler: MessageHandler = Arc::new(move |_| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            let shutdown_tx = shutdown_tx.clone();
            Box::pin(async move {
                if attempt == 0 {
                    anyhow::bail!("transient processing failure");
                }
                let _ = shutdown_tx.send(true);
                Ok(())
            })
        });

        fx.consumer().start_consuming(&agent, handler).await.unwrap();
        // First delivery failed and was requeued, second succeeded.
        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
        let stats = fx.transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_discarded_not_requeued() {
        let fx = fixture();
        let agent = Agent::new("Agent A", "");
        fx.registry.register_agent(&agent).await.unwrap();
        fx.transport
            .publish("agent.agent_a", b"this is not json")
            .await
            .unwrap();
        fx.publisher
            .publish("agent.agent_a", &envelope("after the poison"))
            .await
            .unwrap();

        let deliveries = Arc::new(AtomicU32::new(0));
        let seen = deliveries.clone();
        let shutdown_tx = fx.shutdown_tx.clone();
        let handler: MessageHandler = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            let shutdown_tx = shutdown_tx.clone();
            Box::pin(async move {
                let _ = shutdown_tx.send(true);
                Ok(())
            })
        });

        fx.consumer().start_consuming(&agent, handler).await.unwrap();
        // The poison message never reached the handler and is gone.
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
        let stats = fx.transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_retries_with_increasing_waits() {
        let fx = fixture();
        let agent = Agent::new("Agent A", "");
        fx.registry.register_agent(&agent).await.unwrap();
        fx.transport.fail_consumers(u32::MAX);

        let consumer = fx.consumer_with_retry(ConsumeRetryConfig {
            max_attempts: 3,
            backoff_step: Duration::from_millis(5),
        });
        let handler: MessageHandler = Arc::new(|_| Box::pin(async { Ok(()) }));

        let started = tokio::time::Instant::now();
        let result = consumer.start_consuming(&agent, handler).await;
        assert!(matches!(
            result,
            Err(Error::RetryExhausted { attempts: 3, .. })
        ));
        // Initial subscribe plus exactly three reconnect attempts.
        assert_eq!(fx.transport.consumer_attempts(), 4);
        // Waits of 5, 10, 15 ms under the paused clock.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_consumer_cleanly() {
        let fx = fixture();
        let agent = Agent::new("Agent A", "");
        fx.registry.register_agent(&agent).await.unwrap();

        let consumer = fx.consumer();
        let shutdown_tx = fx.shutdown_tx.clone();
        let handler: MessageHandler = Arc::new(|_| Box::pin(async { Ok(()) }));

        let worker = tokio::spawn(async move {
            consumer.start_consuming(&agent, handler).await
        });
        tokio::task::yield_now().await;
        let _ = shutdown_tx.send(true);

        assert!(worker.await.unwrap().is_ok());
        // Consumer count released on cancel.
        let stats = fx.transport.queue_stats("agent_agent_a_queue").await.unwrap();
        assert_eq!(stats.consumers, 0);
    }
}
