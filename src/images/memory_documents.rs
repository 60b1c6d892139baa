use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{DocumentStore, Stage, SuiteInit, SupportingImage, DOCUMENTS};
use crate::error::ImageError;
use crate::listener::Delivery;
use crate::value::values_equal;

/// True when every field of `filter` equals the document's field. Dotted
/// keys descend into nested objects; an empty or null filter matches all.
pub fn matches_filter(document: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return filter.is_null();
    };
    conditions.iter().all(|(path, expected)| {
        path.split('.')
            .try_fold(document, |current, key| current.get(key))
            .is_some_and(|actual| values_equal(actual, expected))
    })
}

struct Watcher {
    collection: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-process Mongo-style document store with change streams
pub struct InMemoryDocuments {
    name: String,
    collections: Mutex<HashMap<String, Vec<Value>>>,
    watchers: Mutex<Vec<Watcher>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::named(DOCUMENTS)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, collection: &str, change: Value) {
        let payload = change.to_string().into_bytes();
        self.watchers.lock().retain(|watcher| {
            watcher.collection != collection || watcher.sender.send(payload.clone()).is_ok()
        });
    }
}

impl Default for InMemoryDocuments {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportingImage for InMemoryDocuments {
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
        self.watchers.lock().clear();
        self.collections.lock().clear();
        Ok(())
    }

    fn as_documents(&self) -> Option<&dyn DocumentStore> {
        Some(self)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocuments {
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, ImageError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|document| matches_filter(document, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, document: Value) -> Result<(), ImageError> {
        let Value::Object(mut fields) = document else {
            return Err(ImageError::OperationFailed(format!(
                "documents must be objects, got {}",
                document
            )));
        };
        fields
            .entry("_id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        let document = Value::Object(fields);

        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        self.notify(
            collection,
            json!({
                "operationType": "insert",
                "ns": { "coll": collection },
                "fullDocument": document,
            }),
        );
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64, ImageError> {
        let removed: Vec<Value> = {
            let mut collections = self.collections.lock();
            let Some(documents) = collections.get_mut(collection) else {
                return Ok(0);
            };
            let (removed, kept): (Vec<Value>, Vec<Value>) = documents
                .drain(..)
                .partition(|document| matches_filter(document, filter));
            *documents = kept;
            removed
        };

        for document in &removed {
            self.notify(
                collection,
                json!({
                    "operationType": "delete",
                    "ns": { "coll": collection },
                    "documentKey": { "_id": document.get("_id").cloned().unwrap_or(Value::Null) },
                }),
            );
        }
        Ok(removed.len() as u64)
    }

    async fn clear(&self, collection: &str) -> Result<u64, ImageError> {
        self.delete_many(collection, &Value::Null).await
    }

    async fn watch(&self, collection: &str) -> Result<Delivery, ImageError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers.lock().push(Watcher {
            collection: collection.to_string(),
            sender,
        });
        Ok(receiver)
    }
}
