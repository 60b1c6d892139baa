//! Background consumers of external events.
//!
//! A listener owns a bounded buffer that a single worker task writes into
//! while the main plan reads snapshots. Each listener has its own lock, so
//! disjoint listeners never contend.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::Cancellation;
use crate::error::HookError;

/// Raw payloads delivered by a supporting image to a listener worker
pub type Delivery = mpsc::UnboundedReceiver<Vec<u8>>;

/// Default retention for listeners declared without an explicit `max`
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Source a listener consumes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerKind {
    Queue,
    Topic,
    Stream,
    ChangeStream,
    Custom(&'static str),
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Queue => write!(f, "queue"),
            ListenerKind::Topic => write!(f, "topic"),
            ListenerKind::Stream => write!(f, "stream"),
            ListenerKind::ChangeStream => write!(f, "change-stream"),
            ListenerKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerState {
    Idle,
    Subscribed,
    Paused,
    Stopped,
}

/// How raw payloads become values
#[derive(Clone, Default)]
pub enum Unmarshal {
    /// Payload kept as UTF-8 text (lossy)
    #[default]
    Raw,
    /// Payload decoded as JSON, falling back to text when it is not valid JSON
    Json,
    Custom(Arc<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>),
}

impl fmt::Debug for Unmarshal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unmarshal::Raw => write!(f, "Raw"),
            Unmarshal::Json => write!(f, "Json"),
            Unmarshal::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Unmarshal {
    fn decode(&self, listener: &str, raw: &[u8]) -> Value {
        let text = || Value::String(String::from_utf8_lossy(raw).into_owned());
        match self {
            Unmarshal::Raw => text(),
            Unmarshal::Json => serde_json::from_slice(raw).unwrap_or_else(|e| {
                log::warn!("Listener '{}' received non-JSON payload: {}", listener, e);
                text()
            }),
            Unmarshal::Custom(decode) => decode(raw).unwrap_or_else(|e| {
                log::warn!("Listener '{}' unmarshaler failed: {}", listener, e);
                text()
            }),
        }
    }
}

/// Options accepted by listener registration hooks
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Retained messages; 0 disables retention but not counting
    pub max: usize,
    pub unmarshal: Unmarshal,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_MESSAGES,
            unmarshal: Unmarshal::Raw,
        }
    }
}

impl ListenerOptions {
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn json(mut self) -> Self {
        self.unmarshal = Unmarshal::Json;
        self
    }

    pub fn with_unmarshaler<F>(mut self, decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.unmarshal = Unmarshal::Custom(Arc::new(decode));
        self
    }
}

#[derive(Debug, Default)]
struct Buffer {
    count: i64,
    msgs: VecDeque<Value>,
}

/// Successor of a listener count. Rolls to 1 instead of overflowing so a
/// listener that has seen traffic never reports zero.
pub fn next_count(count: i64) -> i64 {
    if count == i64::MAX {
        1
    } else {
        count + 1
    }
}

/// Handle around one background consumer
pub struct Listener {
    name: String,
    kind: ListenerKind,
    max: usize,
    unmarshal: Unmarshal,
    buffer: RwLock<Buffer>,
    state: Mutex<ListenerState>,
    stop: Cancellation,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("max", &self.max)
            .field("count", &self.count())
            .field("state", &self.state())
            .finish()
    }
}

impl Listener {
    pub fn new(name: impl Into<String>, kind: ListenerKind, options: ListenerOptions) -> Self {
        Self {
            name: name.into(),
            kind,
            max: options.max,
            unmarshal: options.unmarshal,
            buffer: RwLock::new(Buffer::default()),
            state: Mutex::new(ListenerState::Idle),
            stop: Cancellation::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ListenerState) {
        let mut current = self.state.lock();
        // Stopped is terminal
        if *current != ListenerState::Stopped {
            *current = state;
        }
    }

    /// Decode and record a raw payload
    pub fn push(&self, raw: &[u8]) {
        let value = self.unmarshal.decode(&self.name, raw);
        self.push_value(value);
    }

    /// Record an already-decoded event. Drops the oldest retained message
    /// when the buffer is full.
    pub fn push_value(&self, value: Value) {
        let mut buffer = self.buffer.write();
        buffer.count = next_count(buffer.count);
        if self.max == 0 {
            return;
        }
        while buffer.msgs.len() >= self.max {
            buffer.msgs.pop_front();
        }
        buffer.msgs.push_back(value);
    }

    /// Copy of the retained messages, oldest first
    pub fn snapshot(&self) -> Vec<Value> {
        self.buffer.read().msgs.iter().cloned().collect()
    }

    pub fn count(&self) -> i64 {
        self.buffer.read().count
    }

    pub fn len(&self) -> usize {
        self.buffer.read().msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Message at `index`; negative indexes count from the newest message
    pub fn message(&self, index: i64) -> Option<Value> {
        let buffer = self.buffer.read();
        let len = buffer.msgs.len() as i64;
        let position = if index < 0 { len + index } else { index };
        if position < 0 || position >= len {
            return None;
        }
        buffer.msgs.get(position as usize).cloned()
    }

    /// Forget everything seen so far. The subscription is left untouched.
    pub fn clear(&self) {
        let previous = self.state();
        self.set_state(ListenerState::Paused);
        {
            let mut buffer = self.buffer.write();
            buffer.msgs.clear();
            buffer.count = 0;
        }
        if previous != ListenerState::Paused {
            self.set_state(previous);
        }
        log::debug!("Listener '{}' cleared", self.name);
    }

    /// Terminate the worker. A stopped listener is never revived.
    pub fn stop(&self) {
        self.stop.cancel();
        self.set_state(ListenerState::Stopped);
    }

    /// Start the background worker draining `delivery` into the buffer.
    ///
    /// The worker exits on `stop`, on suite cancellation, or when the
    /// delivering side hangs up. Panics are caught and logged.
    pub fn spawn(self: &Arc<Self>, mut delivery: Delivery, suite: Cancellation) -> JoinHandle<()> {
        self.set_state(ListenerState::Subscribed);
        let listener = Arc::clone(self);
        let worker = async move {
            loop {
                tokio::select! {
                    _ = listener.stop.cancelled() => break,
                    _ = suite.cancelled() => break,
                    message = delivery.recv() => match message {
                        Some(raw) => listener.push(&raw),
                        None => break,
                    },
                }
            }
        };

        let listener = Arc::clone(self);
        tokio::spawn(async move {
            log::debug!("Listener '{}' ({}) worker started", listener.name, listener.kind);
            if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
                log::error!(
                    "Listener '{}' worker panicked: {}",
                    listener.name,
                    panic_message(panic.as_ref())
                );
            }
            listener.set_state(ListenerState::Stopped);
            log::debug!("Listener '{}' worker stopped", listener.name);
        })
    }

    #[cfg(test)]
    pub(crate) fn force_count(&self, count: i64) {
        self.buffer.write().count = count;
    }
}

/// Outcome of preparing a registration
#[derive(Debug)]
pub enum Registration {
    /// New listener; the caller subscribes and spawns its worker
    Fresh(Arc<Listener>),
    /// Existing listener of the same kind, buffer cleared, still subscribed
    Reused(Arc<Listener>),
}

/// Named listeners of one run
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, Arc<Listener>>,
    workers: Vec<JoinHandle<()>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or reuse the listener registered under `name`.
    ///
    /// Re-registering with the same kind clears the buffer without
    /// re-subscribing; re-subscription requires an explicit stop and a new
    /// name. A different kind is an error.
    pub fn prepare(
        &mut self,
        name: &str,
        kind: ListenerKind,
        options: ListenerOptions,
    ) -> Result<Registration, HookError> {
        if let Some(existing) = self.listeners.get(name) {
            if existing.kind() != kind {
                return Err(HookError::ListenerKindMismatch {
                    name: name.to_string(),
                    existing: existing.kind().to_string(),
                    requested: kind.to_string(),
                });
            }
            existing.clear();
            return Ok(Registration::Reused(Arc::clone(existing)));
        }

        let listener = Arc::new(Listener::new(name, kind, options));
        self.listeners.insert(name.to_string(), Arc::clone(&listener));
        Ok(Registration::Fresh(listener))
    }

    /// Drop a listener whose subscription could not be established
    pub fn abandon(&mut self, name: &str) {
        self.listeners.remove(name);
    }

    pub fn track_worker(&mut self, worker: JoinHandle<()>) {
        self.workers.push(worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Listener>> {
        self.listeners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every listener and wait for the workers to exit
    pub async fn stop_all(&mut self) {
        for listener in self.listeners.values() {
            listener.stop();
        }
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                log::warn!("Listener worker did not exit cleanly: {}", e);
            }
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_max_one_keeps_newest() {
        let listener = Listener::new("q", ListenerKind::Queue, ListenerOptions::default().with_max(1));
        for message in ["m1", "m2", "m3"] {
            listener.push(message.as_bytes());
        }
        assert_eq!(listener.snapshot(), vec![json!("m3")]);
        assert_eq!(listener.count(), 3);
    }

    #[test]
    fn test_zero_max_counts_without_retaining() {
        let listener = Listener::new("q", ListenerKind::Queue, ListenerOptions::default().with_max(0));
        listener.push(b"m1");
        listener.push(b"m2");
        assert!(listener.is_empty());
        assert_eq!(listener.count(), 2);
    }

    #[test]
    fn test_count_rolls_to_one() {
        assert_eq!(next_count(i64::MAX), 1);
        assert_eq!(next_count(41), 42);

        let listener = Listener::new("t", ListenerKind::Topic, ListenerOptions::default());
        listener.force_count(i64::MAX);
        listener.push(b"overflow");
        assert_eq!(listener.count(), 1);
    }

    #[test]
    fn test_json_unmarshal_falls_back_to_text() {
        let listener = Listener::new("q", ListenerKind::Queue, ListenerOptions::default().json());
        listener.push(br#"{"id": 7}"#);
        listener.push(b"not json");
        assert_eq!(listener.snapshot(), vec![json!({"id": 7}), json!("not json")]);
    }

    #[test]
    fn test_custom_unmarshaler() {
        let options = ListenerOptions::default()
            .with_unmarshaler(|raw| Ok(json!({ "size": raw.len() })));
        let listener = Listener::new("q", ListenerKind::Queue, options);
        listener.push(b"abcd");
        assert_eq!(listener.message(-1), Some(json!({"size": 4})));
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_arrivals() {
        let listener = Listener::new("q", ListenerKind::Queue, ListenerOptions::default());
        listener.push(b"first");
        let snapshot = listener.snapshot();
        listener.push(b"second");
        assert_eq!(snapshot, vec![json!("first")]);
        assert_eq!(listener.len(), 2);
    }

    #[test]
    fn test_registry_reuses_same_kind_and_rejects_other_kinds() {
        let mut registry = ListenerRegistry::new();
        let first = match registry
            .prepare("events", ListenerKind::Queue, ListenerOptions::default())
            .unwrap()
        {
            Registration::Fresh(listener) => listener,
            Registration::Reused(_) => panic!("expected a fresh listener"),
        };
        first.push(b"m1");

        match registry
            .prepare("events", ListenerKind::Queue, ListenerOptions::default())
            .unwrap()
        {
            Registration::Reused(listener) => {
                assert!(Arc::ptr_eq(&first, &listener));
                assert!(listener.is_empty());
                assert_eq!(listener.count(), 0);
            }
            Registration::Fresh(_) => panic!("expected reuse"),
        }

        let err = registry
            .prepare("events", ListenerKind::Topic, ListenerOptions::default())
            .unwrap_err();
        assert!(matches!(err, HookError::ListenerKindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_worker_drains_delivery_and_stops() {
        let listener = Arc::new(Listener::new("q", ListenerKind::Queue, ListenerOptions::default()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = listener.spawn(receiver, Cancellation::new());
        assert_eq!(listener.state(), ListenerState::Subscribed);

        sender.send(b"hello".to_vec()).unwrap();
        for _ in 0..50 {
            if listener.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(listener.snapshot(), vec![json!("hello")]);

        listener.stop();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop")
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained() {
        let options = ListenerOptions::default().with_unmarshaler(|_| panic!("bad payload"));
        let listener = Arc::new(Listener::new("q", ListenerKind::Queue, options));
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = listener.spawn(receiver, Cancellation::new());

        sender.send(b"boom".to_vec()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should exit")
            .expect("panic must not escape the worker");
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    proptest! {
        #[test]
        fn prop_count_bounds_retained_messages(
            max in 0usize..8,
            messages in prop::collection::vec(".{0,8}", 0..40)
        ) {
            let listener = Listener::new("p", ListenerKind::Topic, ListenerOptions::default().with_max(max));
            for message in &messages {
                listener.push(message.as_bytes());
                prop_assert!(listener.count() >= listener.len() as i64);
                if max > 0 {
                    prop_assert!(listener.len() <= max);
                }
            }
            prop_assert_eq!(listener.count(), messages.len() as i64);
        }
    }
}
