use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Stage, StreamBroker, StreamSubscriber, SuiteInit, SupportingImage, STREAM};
use crate::error::ImageError;
use crate::listener::{panic_message, Delivery};

/// One keyed record on a stream topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub offset: u64,
}

/// Receives routed records. Returning `false` unregisters the handler.
pub type RecordHandler = Arc<dyn Fn(&StreamRecord) -> bool + Send + Sync>;

#[derive(Default)]
struct Group {
    handlers: Vec<RecordHandler>,
    next: usize,
}

impl Group {
    fn dispatch(&mut self, group: &str, record: &StreamRecord) {
        while !self.handlers.is_empty() {
            let index = self.next % self.handlers.len();
            self.next = self.next.wrapping_add(1);
            let handler = Arc::clone(&self.handlers[index]);
            match catch_unwind(AssertUnwindSafe(|| handler(record))) {
                Ok(true) => return,
                Ok(false) => {
                    self.handlers.remove(index);
                }
                Err(panic) => {
                    log::error!(
                        "Stream handler in group '{}' panicked on '{}': {}",
                        group,
                        record.topic,
                        panic_message(panic.as_ref())
                    );
                    self.handlers.remove(index);
                }
            }
        }
    }
}

/// Fans one topic's records out to consumer groups.
///
/// Every group sees every record; within a group exactly one handler gets
/// it, round robin. Routing happens on a background task so publishers
/// never run handler code.
pub struct ConsumerGroupRouter {
    topic: String,
    groups: Arc<Mutex<HashMap<String, Group>>>,
    inbound: mpsc::UnboundedSender<StreamRecord>,
    worker: JoinHandle<()>,
}

impl ConsumerGroupRouter {
    /// Spawn the routing task for `topic`. Must be called inside a runtime.
    pub fn start(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let groups: Arc<Mutex<HashMap<String, Group>>> = Arc::default();
        let (inbound, mut records) = mpsc::unbounded_channel::<StreamRecord>();

        let routed = Arc::clone(&groups);
        let worker = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let mut groups = routed.lock();
                for (name, group) in groups.iter_mut() {
                    group.dispatch(name, &record);
                }
            }
        });

        log::debug!("Consumer group router started for topic '{}'", topic);
        Self {
            topic,
            groups,
            inbound,
            worker,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn add_handler(&self, group: &str, handler: RecordHandler) {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .handlers
            .push(handler);
    }

    pub fn handler_count(&self, group: &str) -> usize {
        self.groups
            .lock()
            .get(group)
            .map(|group| group.handlers.len())
            .unwrap_or(0)
    }

    pub fn route(&self, record: StreamRecord) -> Result<(), ImageError> {
        self.inbound
            .send(record)
            .map_err(|_| ImageError::OperationFailed(format!("router for '{}' stopped", self.topic)))
    }

    pub fn stop(&self) {
        self.worker.abort();
        self.groups.lock().clear();
    }
}

impl Drop for ConsumerGroupRouter {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// In-process Kafka-style stream broker
pub struct InMemoryStream {
    name: String,
    routers: tokio::sync::Mutex<HashMap<String, ConsumerGroupRouter>>,
    offset: AtomicU64,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::named(STREAM)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routers: tokio::sync::Mutex::new(HashMap::new()),
            offset: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportingImage for InMemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Supporting
    }

    async fn init(&self, _init: &mut SuiteInit) -> Result<(), ImageError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ImageError> {
        let mut routers = self.routers.lock().await;
        for router in routers.values() {
            router.stop();
        }
        routers.clear();
        Ok(())
    }

    fn as_stream(&self) -> Option<&dyn StreamBroker> {
        Some(self)
    }
}

#[async_trait]
impl StreamBroker for InMemoryStream {
    async fn publish_record(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Vec<u8>,
    ) -> Result<(), ImageError> {
        let record = StreamRecord {
            topic: topic.to_string(),
            key,
            payload,
            offset: self.offset.fetch_add(1, Ordering::SeqCst),
        };
        let mut routers = self.routers.lock().await;
        routers
            .entry(topic.to_string())
            .or_insert_with(|| ConsumerGroupRouter::start(topic))
            .route(record)
    }

    async fn subscribe(&self, subscriber: StreamSubscriber) -> Result<Delivery, ImageError> {
        if !subscriber.mark.is_empty() {
            log::debug!(
                "Ignoring mark '{}' for group '{}'; the in-memory stream always starts at latest",
                subscriber.mark,
                subscriber.group
            );
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler: RecordHandler = Arc::new(move |record: &StreamRecord| sender.send(record.payload.clone()).is_ok());

        let mut routers = self.routers.lock().await;
        routers
            .entry(subscriber.topic.clone())
            .or_insert_with(|| ConsumerGroupRouter::start(subscriber.topic.as_str()))
            .add_handler(&subscriber.group, handler);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(delivery: &mut Delivery) -> Option<Vec<u8>> {
        tokio::time::timeout(Duration::from_millis(500), delivery.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_each_group_sees_every_record() {
        let stream = InMemoryStream::new();
        let mut billing = stream.subscribe(StreamSubscriber::new("billing", "orders")).await.unwrap();
        let mut audit = stream.subscribe(StreamSubscriber::new("audit", "orders")).await.unwrap();

        stream
            .publish_record("orders", Some("k1".to_string()), b"o1".to_vec())
            .await
            .unwrap();

        assert_eq!(recv(&mut billing).await, Some(b"o1".to_vec()));
        assert_eq!(recv(&mut audit).await, Some(b"o1".to_vec()));
    }

    #[tokio::test]
    async fn test_group_members_share_records() {
        let stream = InMemoryStream::new();
        let mut first = stream.subscribe(StreamSubscriber::new("g", "t")).await.unwrap();
        let mut second = stream.subscribe(StreamSubscriber::new("g", "t")).await.unwrap();

        stream.publish_record("t", None, b"r1".to_vec()).await.unwrap();
        stream.publish_record("t", None, b"r2".to_vec()).await.unwrap();

        assert_eq!(recv(&mut first).await, Some(b"r1".to_vec()));
        assert_eq!(recv(&mut second).await, Some(b"r2".to_vec()));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dropped() {
        let router = ConsumerGroupRouter::start("t");
        router.add_handler("g", Arc::new(|_: &StreamRecord| panic!("handler bug")));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        router.add_handler(
            "g",
            Arc::new(move |record: &StreamRecord| sender.send(record.payload.clone()).is_ok()),
        );

        for offset in 0..2 {
            router
                .route(StreamRecord {
                    topic: "t".to_string(),
                    key: None,
                    payload: vec![offset as u8],
                    offset,
                })
                .unwrap();
        }

        assert_eq!(recv(&mut receiver).await, Some(vec![0]));
        assert_eq!(recv(&mut receiver).await, Some(vec![1]));
        assert_eq!(router.handler_count("g"), 1);
    }

    #[test]
    fn test_subscriber_mark_defaults_empty() {
        let subscriber = StreamSubscriber::new("g", "t");
        assert!(subscriber.mark.is_empty());
    }
}
