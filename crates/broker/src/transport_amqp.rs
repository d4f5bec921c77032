//! AMQP transport backed by lapin.
//!
//! Owns the single connection plus a default channel used for declare and
//! publish traffic. Each consumer session gets its own channel over the
//! shared connection, so a consumer teardown never invalidates the
//! publish path.

use {
    async_trait::async_trait,
    futures::StreamExt,
    lapin::{
        BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
        options::{
            BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
            BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
            QueueDeclareOptions,
        },
        types::{AMQPValue, FieldTable},
    },
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use {
    beeline_protocol::{AGENT_EXCHANGE, PREFETCH_COUNT, QUEUE_MESSAGE_TTL_MS},
    crate::{
        config::BrokerConfig,
        error::{Error, Result},
        transport::{ConsumerSession, Delivery, QueueStats, Transport},
    },
};

struct AmqpState {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpTransport {
    config: BrokerConfig,
    state: RwLock<Option<AmqpState>>,
}

impl AmqpTransport {
    /// Connect and declare the agent topic exchange.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let transport = Self {
            config,
            state: RwLock::new(None),
        };
        let state = transport.establish().await?;
        *transport.state.write().await = Some(state);
        Ok(transport)
    }

    async fn establish(&self) -> Result<AmqpState> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&self.config.amqp_uri(), options)
            .await
            .map_err(|e| {
                Error::connection(format!(
                    "broker unreachable at {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::broker("open default channel", e))?;
        channel
            .exchange_declare(
                AGENT_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::broker("declare agent exchange", e))?;
        info!(host = %self.config.host, port = self.config.port, "connected to broker");
        Ok(AmqpState {
            connection,
            channel,
        })
    }

    /// Default channel for declare/publish traffic.
    async fn channel(&self) -> Result<Channel> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| Error::connection("broker connection not established"))
    }

    /// Throwaway channel for passive probes.
    ///
    /// A failed passive declare closes its channel, so probes must not run
    /// on the shared one.
    async fn probe_channel(&self) -> Result<Channel> {
        let guard = self.state.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| Error::connection("broker connection not established"))?;
        state
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::broker("open probe channel", e))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn ensure_open(&self) -> bool {
        {
            let guard = self.state.read().await;
            if let Some(state) = guard.as_ref()
                && state.connection.status().connected()
                && state.channel.status().connected()
            {
                // Lightweight round-trip: re-declaring an existing exchange
                // is a no-op on the broker side.
                let probe = state
                    .channel
                    .exchange_declare(
                        AGENT_EXCHANGE,
                        ExchangeKind::Topic,
                        ExchangeDeclareOptions {
                            durable: true,
                            ..ExchangeDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await;
                if probe.is_ok() {
                    return true;
                }
            }
        }

        warn!("broker link lost, reconnecting");
        match self.establish().await {
            Ok(state) => {
                *self.state.write().await = Some(state);
                true
            }
            Err(error) => {
                warn!(%error, "broker reconnect failed");
                false
            }
        }
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        let probe = self.probe_channel().await?;
        let declared = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        Ok(declared.is_ok())
    }

    async fn declare_and_bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel().await?;
        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(QUEUE_MESSAGE_TTL_MS));
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::broker(format!("declare queue {queue}"), e))?;
        channel
            .queue_bind(
                queue,
                AGENT_EXCHANGE,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::broker(format!("bind queue {queue} to {routing_key}"), e))?;
        debug!(queue, routing_key, "queue declared and bound");
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                AGENT_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| Error::broker(format!("publish to {routing_key}"), e))?;
        confirm
            .await
            .map_err(|e| Error::broker(format!("publish confirm for {routing_key}"), e))?;
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let probe = self.probe_channel().await?;
        let declared = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::broker(format!("inspect queue {queue}"), e))?;
        Ok(QueueStats {
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        })
    }

    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn ConsumerSession>> {
        let channel = {
            let guard = self.state.read().await;
            let state = guard
                .as_ref()
                .ok_or_else(|| Error::connection("broker connection not established"))?;
            state
                .connection
                .create_channel()
                .await
                .map_err(|e| Error::broker("open consumer channel", e))?
        };
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| Error::broker("set prefetch", e))?;
        let tag = format!("{queue}.{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::broker(format!("consume from {queue}"), e))?;
        Ok(Box::new(AmqpConsumerSession {
            channel,
            consumer,
            tag,
        }))
    }

    async fn close(&self) {
        let state = self.state.write().await.take();
        if let Some(state) = state {
            match state.connection.close(200, "client shutdown").await {
                Ok(()) => info!("broker connection closed"),
                Err(error) => warn!(%error, "broker connection close failed"),
            }
        }
    }
}

struct AmqpConsumerSession {
    channel: Channel,
    consumer: lapin::Consumer,
    tag: String,
}

#[async_trait]
impl ConsumerSession for AmqpConsumerSession {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
            })),
            Some(Err(e)) => Err(Error::connection(format!("delivery stream failed: {e}"))),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::broker("ack delivery", e))
    }

    async fn nack_requeue(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| Error::broker("nack delivery", e))
    }

    async fn nack_discard(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_nack(tag, BasicNackOptions::default())
            .await
            .map_err(|e| Error::broker("discard delivery", e))
    }

    async fn cancel(&mut self) {
        if let Err(error) = self
            .channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
        {
            warn!(%error, tag = %self.tag, "consumer cancel failed");
        }
    }
}
