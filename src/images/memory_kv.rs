use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KeyValueStore, Stage, SuiteInit, SupportingImage, KEY_VALUE};
use crate::error::ImageError;

#[derive(Debug)]
enum Entry {
    Text {
        value: String,
        expires_at: Option<Instant>,
    },
    List(VecDeque<String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Text { expires_at: Some(at), .. } if *at <= now)
    }
}

fn wrong_type(key: &str) -> ImageError {
    ImageError::OperationFailed(format!("WRONGTYPE key '{}' holds the wrong kind of value", key))
}

/// In-process Redis-style store with string keys and lists
pub struct InMemoryKeyValue {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self::named(KEY_VALUE)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
        }
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, ImageError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(Entry::List(items)) => {
                let item = items.pop_front();
                if items.is_empty() {
                    entries.remove(key);
                }
                Ok(item)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }
}

impl Default for InMemoryKeyValue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportingImage for InMemoryKeyValue {
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
        self.entries.lock().clear();
        self.pushed.notify_waiters();
        Ok(())
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueStore> {
        Some(self)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>, ImageError> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_expired(Instant::now())) {
            entries.remove(key);
        }
        match entries.get(key) {
            Some(Entry::Text { value, .. }) => Ok(Some(value.clone())),
            Some(Entry::List(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), ImageError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry::Text { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, ImageError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn list_len(&self, key: &str) -> Result<usize, ImageError> {
        match self.entries.lock().get(key) {
            Some(Entry::List(items)) => Ok(items.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn list_push(&self, key: &str, value: String) -> Result<usize, ImageError> {
        let len = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::List(VecDeque::new()));
            match entry {
                Entry::List(items) => {
                    items.push_back(value);
                    items.len()
                }
                Entry::Text { .. } => return Err(wrong_type(key)),
            }
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, ImageError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the wait is not missed
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(key)? {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_set_delete() {
        let kv = InMemoryKeyValue::new();
        assert_eq!(kv.get("pet").await.unwrap(), None);
        kv.set("pet", "Felix".to_string(), None).await.unwrap();
        assert_eq!(kv.get("pet").await.unwrap(), Some("Felix".to_string()));
        assert!(kv.delete("pet").await.unwrap());
        assert!(!kv.delete("pet").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_key() {
        let kv = InMemoryKeyValue::new();
        kv.set("session", "s1".to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.get("session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_verbs_and_wrong_type() {
        let kv = InMemoryKeyValue::new();
        assert_eq!(kv.list_push("jobs", "a".to_string()).await.unwrap(), 1);
        assert_eq!(kv.list_push("jobs", "b".to_string()).await.unwrap(), 2);
        assert_eq!(kv.list_len("jobs").await.unwrap(), 2);
        assert!(kv.get("jobs").await.is_err());
        assert_eq!(
            kv.blocking_pop("jobs", Duration::from_millis(10)).await.unwrap(),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_blocking_pop_waits_for_push() {
        let kv = Arc::new(InMemoryKeyValue::new());
        let popper = {
            let kv = Arc::clone(&kv);
            tokio::spawn(async move { kv.blocking_pop("jobs", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        kv.list_push("jobs", "late".to_string()).await.unwrap();
        assert_eq!(popper.await.unwrap().unwrap(), Some("late".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_times_out() {
        let kv = InMemoryKeyValue::new();
        let popped = kv.blocking_pop("empty", Duration::from_millis(50)).await.unwrap();
        assert_eq!(popped, None);
    }
}
