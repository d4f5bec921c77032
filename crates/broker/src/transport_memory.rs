//! In-process transport double used by tests.
//!
//! Models just enough broker behavior for the routing layer: exact-match
//! bindings (every binding this system creates is a literal
//! `agent.<slug>` key, so topic wildcards are not modeled), per-queue
//! ready/unacked bookkeeping, and failure injection for outage and
//! provisioning scenarios.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    tokio::sync::{Mutex, Notify},
    tracing::debug,
};

use crate::{
    error::{Error, Result},
    transport::{ConsumerSession, Delivery, QueueStats, Transport},
};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    unacked: HashMap<u64, Vec<u8>>,
    consumers: u32,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Routing key -> queue name.
    bindings: HashMap<String, String>,
    /// Queues whose declare is rigged to fail.
    failing_declares: HashSet<String>,
    /// Per-routing-key publish counters.
    published: HashMap<String, u64>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    open: AtomicBool,
    next_tag: AtomicU64,
    /// Remaining `open_consumer` calls rigged to fail.
    failing_consumers: AtomicU32,
    /// Total `open_consumer` calls, successful or not.
    consumer_attempts: AtomicU32,
}

#[derive(Default, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let transport = Self::default();
        transport.inner.open.store(true, Ordering::SeqCst);
        transport
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_open(&self, open: bool) {
        self.inner.open.store(open, Ordering::SeqCst);
    }

    /// Rig the next `n` consumer subscriptions to fail at the connection
    /// level.
    pub fn fail_consumers(&self, n: u32) {
        self.inner.failing_consumers.store(n, Ordering::SeqCst);
    }

    /// How many consumer subscriptions were attempted in total.
    #[must_use]
    pub fn consumer_attempts(&self) -> u32 {
        self.inner.consumer_attempts.load(Ordering::SeqCst)
    }

    /// Rig `queue`'s declare to fail.
    pub async fn fail_declare(&self, queue: &str) {
        let mut state = self.inner.state.lock().await;
        state.failing_declares.insert(queue.to_string());
    }

    /// Delete `queue` out from under the registry.
    pub async fn drop_queue(&self, queue: &str) {
        let mut state = self.inner.state.lock().await;
        state.queues.remove(queue);
    }

    /// How many envelopes were published to `routing_key`.
    pub async fn published_count(&self, routing_key: &str) -> u64 {
        let state = self.inner.state.lock().await;
        state.published.get(routing_key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn ensure_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        let state = self.inner.state.lock().await;
        Ok(state.queues.contains_key(queue))
    }

    async fn declare_and_bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.failing_declares.contains(queue) {
            return Err(Error::broker(
                format!("declare queue {queue}"),
                std::io::Error::other("injected declare failure"),
            ));
        }
        state.queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .insert(routing_key.to_string(), queue.to_string());
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(Error::connection("simulated broker outage"));
        }
        let mut state = self.inner.state.lock().await;
        *state.published.entry(routing_key.to_string()).or_default() += 1;
        let Some(queue_name) = state.bindings.get(routing_key).cloned() else {
            // Topic exchanges drop unroutable messages.
            debug!(routing_key, "no binding matched, message dropped");
            return Ok(());
        };
        let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.ready.push_back((tag, body.to_vec()));
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let state = self.inner.state.lock().await;
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::connection(format!("queue {queue} does not exist")))?;
        Ok(QueueStats {
            messages: queue_state.ready.len() as u32,
            consumers: queue_state.consumers,
        })
    }

    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn ConsumerSession>> {
        self.inner.consumer_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(Error::connection("simulated broker outage"));
        }
        let failing = &self.inner.failing_consumers;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection("simulated connection loss"));
        }
        let mut state = self.inner.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::connection(format!("queue {queue} does not exist")))?;
        queue_state.consumers += 1;
        Ok(Box::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        // Wake blocked consumers so they observe the closed flag.
        let state = self.inner.state.lock().await;
        for queue in state.queues.values() {
            queue.notify.notify_one();
        }
        debug!("in-memory transport closed");
    }
}

struct InMemorySession {
    inner: Arc<Inner>,
    queue: String,
}

#[async_trait]
impl ConsumerSession for InMemorySession {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        loop {
            if !self.inner.open.load(Ordering::SeqCst) {
                return Err(Error::connection("simulated broker outage"));
            }
            let notify = {
                let mut state = self.inner.state.lock().await;
                let queue = state
                    .queues
                    .get_mut(&self.queue)
                    .ok_or_else(|| Error::connection(format!("queue {} vanished", self.queue)))?;
                if let Some((tag, body)) = queue.ready.pop_front() {
                    queue.unacked.insert(tag, body.clone());
                    return Ok(Some(Delivery { tag, body }));
                }
                Arc::clone(&queue.notify)
            };
            notify.notified().await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked.remove(&tag);
        }
        Ok(())
    }

    async fn nack_requeue(&mut self, tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&self.queue)
            && let Some(body) = queue.unacked.remove(&tag)
        {
            queue.ready.push_front((tag, body));
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn nack_discard(&mut self, tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked.remove(&tag);
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        let mut state = self.inner.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.consumers = queue.consumers.saturating_sub(1);
        }
    }
}
