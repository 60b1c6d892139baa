use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, RwLock};

use super::{MessageBroker, Stage, SuiteInit, SupportingImage, BROKER};
use crate::error::ImageError;
use crate::listener::Delivery;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Vec<u8>>,
    consumers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    next: usize,
}

impl QueueState {
    /// Hand the payload to one live consumer, round robin, or keep it
    fn deliver(&mut self, payload: Vec<u8>) {
        self.consumers.retain(|consumer| !consumer.is_closed());
        if self.consumers.is_empty() {
            self.pending.push_back(payload);
            return;
        }
        let index = self.next % self.consumers.len();
        self.next = self.next.wrapping_add(1);
        if let Err(mpsc::error::SendError(payload)) = self.consumers[index].send(payload) {
            self.pending.push_back(payload);
        }
    }
}

/// In-process STOMP-style broker.
///
/// Queue messages go to exactly one consumer and wait in the queue while
/// nobody listens. Topic messages fan out to current subscribers and are
/// dropped when there are none.
pub struct InMemoryBroker {
    name: String,
    queues: RwLock<HashMap<String, QueueState>>,
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::named(BROKER)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportingImage for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Supporting
    }

    async fn init(&self, _init: &mut SuiteInit) -> Result<(), ImageError> {
        log::debug!("In-memory broker '{}' ready", self.name);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ImageError> {
        // Dropping the senders ends every listener worker fed by this broker
        self.queues.write().await.clear();
        self.topics.write().await.clear();
        Ok(())
    }

    fn as_broker(&self) -> Option<&dyn MessageBroker> {
        Some(self)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(&self, queue: &str, payload: Vec<u8>) -> Result<(), ImageError> {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default().deliver(payload);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ImageError> {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe_queue(&self, queue: &str) -> Result<Delivery, ImageError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut queues = self.queues.write().await;
        let state = queues.entry(queue.to_string()).or_default();
        while let Some(payload) = state.pending.pop_front() {
            sender
                .send(payload)
                .map_err(|_| ImageError::OperationFailed("consumer closed during backlog".to_string()))?;
        }
        state.consumers.push(sender);
        Ok(receiver)
    }

    async fn subscribe_topic(&self, topic: &str) -> Result<Delivery, ImageError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, ImageError> {
        Ok(self
            .queues
            .read()
            .await
            .get(queue)
            .map(|state| state.pending.len())
            .unwrap_or(0))
    }
}
