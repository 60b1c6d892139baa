//! Supporting images: named external services made available to hooks and
//! resolvables.
//!
//! The core only knows the lifecycle (`init`/`shutdown`) and a handful of
//! capability traits. Concrete clients stay behind those traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DeclarationError, ImageError};
use crate::listener::Delivery;

pub mod memory_broker;
pub mod memory_documents;
pub mod memory_kv;
pub mod memory_stream;
pub mod sqlite;

pub use memory_broker::InMemoryBroker;
pub use memory_documents::InMemoryDocuments;
pub use memory_kv::InMemoryKeyValue;
pub use memory_stream::{ConsumerGroupRouter, InMemoryStream};
pub use sqlite::SqliteImage;

/// Canonical image names used when a hook does not name its image
pub const BROKER: &str = "broker";
pub const STREAM: &str = "stream";
pub const KEY_VALUE: &str = "kv";
pub const DOCUMENTS: &str = "documents";

/// Initialization order. Supporting images start before primary ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Supporting,
    Primary,
}

#[async_trait]
pub trait SupportingImage: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage {
        Stage::Supporting
    }

    async fn init(&self, init: &mut SuiteInit) -> Result<(), ImageError>;

    async fn shutdown(&self) -> Result<(), ImageError>;

    fn as_broker(&self) -> Option<&dyn MessageBroker> {
        None
    }

    fn as_stream(&self) -> Option<&dyn StreamBroker> {
        None
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueStore> {
        None
    }

    fn as_documents(&self) -> Option<&dyn DocumentStore> {
        None
    }
}

/// Queue and topic messaging
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn send(&self, queue: &str, payload: Vec<u8>) -> Result<(), ImageError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ImageError>;

    async fn subscribe_queue(&self, queue: &str) -> Result<Delivery, ImageError>;

    async fn subscribe_topic(&self, topic: &str) -> Result<Delivery, ImageError>;

    /// Messages waiting in `queue` with no consumer
    async fn queue_depth(&self, queue: &str) -> Result<usize, ImageError>;
}

/// Consumer-group subscription to a stream topic.
///
/// `mark` is reserved for a consumer position marker; the core never
/// assigns it and images treat an empty mark as "latest".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSubscriber {
    pub group: String,
    pub topic: String,
    pub mark: String,
}

impl StreamSubscriber {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
            mark: String::new(),
        }
    }
}

/// Kafka-style keyed record streams
#[async_trait]
pub trait StreamBroker: Send + Sync {
    async fn publish_record(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Vec<u8>,
    ) -> Result<(), ImageError>;

    async fn subscribe(&self, subscriber: StreamSubscriber) -> Result<Delivery, ImageError>;
}

/// Redis-like keyed strings and lists
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ImageError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), ImageError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, ImageError>;

    async fn list_len(&self, key: &str) -> Result<usize, ImageError>;

    /// Append to the tail, returning the new length
    async fn list_push(&self, key: &str, value: String) -> Result<usize, ImageError>;

    /// Pop from the head, waiting up to `timeout` for an element
    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, ImageError>;
}

/// Mongo-like document collections
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents whose fields equal every field of `filter`
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, ImageError>;

    async fn insert(&self, collection: &str, document: Value) -> Result<(), ImageError>;

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64, ImageError>;

    async fn clear(&self, collection: &str) -> Result<u64, ImageError>;

    /// Change events for `collection`, JSON encoded
    async fn watch(&self, collection: &str) -> Result<Delivery, ImageError>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<usize, ImageError> {
        Ok(self.find(collection, filter).await?.len())
    }
}

/// SQL handle. Args are bound in order; rows come back as JSON objects.
#[async_trait]
pub trait SqlDatabase: Send + Sync {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, ImageError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Value>, ImageError>;
}

/// Argument-marker dialect of the registered SQL handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgStyle {
    /// `?`
    #[default]
    Positional,
    /// `$1`, `$2`, ...
    Dollar,
    /// `@p1`, `@p2`, ...
    AtP,
    /// `:name`
    Named,
}

impl ArgStyle {
    /// Marker for the 1-based argument `index`
    pub fn marker(&self, index: usize, name: Option<&str>) -> String {
        match self {
            ArgStyle::Positional => "?".to_string(),
            ArgStyle::Dollar => format!("${}", index),
            ArgStyle::AtP => format!("@p{}", index),
            ArgStyle::Named => match name {
                Some(name) => format!(":{}", name),
                None => format!(":p{}", index),
            },
        }
    }

    /// Rewrite `?` markers outside single-quoted literals into this style
    pub fn rewrite(&self, sql: &str, names: &[String]) -> String {
        if *self == ArgStyle::Positional {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut quoted = false;
        let mut index = 0;
        for c in sql.chars() {
            match c {
                '\'' => {
                    quoted = !quoted;
                    out.push(c);
                }
                '?' if !quoted => {
                    index += 1;
                    let name = names.get(index - 1).map(String::as_str);
                    out.push_str(&self.marker(index, name));
                }
                _ => out.push(c),
            }
        }
        out
    }
}

/// Mutable view handed to each image during initialization
pub struct SuiteInit {
    db: Option<Arc<dyn SqlDatabase>>,
    arg_style: ArgStyle,
    added: Vec<Arc<dyn SupportingImage>>,
    reaper_shutdowns_disabled: bool,
    api_base_url: String,
}

impl fmt::Debug for SuiteInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteInit")
            .field("has_db", &self.db.is_some())
            .field("arg_style", &self.arg_style)
            .field("added", &self.added.len())
            .field("reaper_shutdowns_disabled", &self.reaper_shutdowns_disabled)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

impl SuiteInit {
    pub fn new(api_base_url: impl Into<String>, reaper_shutdowns_disabled: bool) -> Self {
        Self {
            db: None,
            arg_style: ArgStyle::default(),
            added: Vec::new(),
            reaper_shutdowns_disabled,
            api_base_url: api_base_url.into(),
        }
    }

    /// Install the suite's SQL handle
    pub fn set_db(&mut self, db: Arc<dyn SqlDatabase>) {
        self.db = Some(db);
    }

    pub fn set_db_arg_markers(&mut self, style: ArgStyle) {
        self.arg_style = style;
    }

    /// Register an extra image discovered while initializing another one
    pub fn add_supporting_image(&mut self, image: Arc<dyn SupportingImage>) {
        self.added.push(image);
    }

    /// Set when the container reaper should not tear images down on exit
    pub fn reaper_shutdowns_disabled(&self) -> bool {
        self.reaper_shutdowns_disabled
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    /// Primary images that publish the API on a mapped port override the base URL
    pub fn set_api_base_url(&mut self, url: impl Into<String>) {
        self.api_base_url = url.into();
    }

    pub(crate) fn take_added(&mut self) -> Vec<Arc<dyn SupportingImage>> {
        std::mem::take(&mut self.added)
    }

    pub(crate) fn into_parts(self) -> (Option<Arc<dyn SqlDatabase>>, ArgStyle, String) {
        (self.db, self.arg_style, self.api_base_url)
    }
}

/// Initialized images by name, in initialization order
#[derive(Default, Clone)]
pub struct ImageRegistry {
    order: Vec<String>,
    images: HashMap<String, Arc<dyn SupportingImage>>,
}

impl fmt::Debug for ImageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: Arc<dyn SupportingImage>) -> Result<(), DeclarationError> {
        let name = image.name().to_string();
        if self.images.contains_key(&name) {
            return Err(DeclarationError::DuplicateImage(name));
        }
        self.order.push(name.clone());
        self.images.insert(name, image);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SupportingImage>> {
        self.images.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Images in reverse initialization order, for shutdown
    pub fn reversed(&self) -> Vec<Arc<dyn SupportingImage>> {
        self.order
            .iter()
            .rev()
            .filter_map(|name| self.images.get(name).cloned())
            .collect()
    }
}

/// Capability names used in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Broker,
    Stream,
    KeyValue,
    Documents,
}

impl Capability {
    pub fn provided_by(&self, image: &dyn SupportingImage) -> bool {
        match self {
            Capability::Broker => image.as_broker().is_some(),
            Capability::Stream => image.as_stream().is_some(),
            Capability::KeyValue => image.as_key_value().is_some(),
            Capability::Documents => image.as_documents().is_some(),
        }
    }

    /// Image name a hook or query falls back to
    pub fn canonical_image(&self) -> &'static str {
        match self {
            Capability::Broker => BROKER,
            Capability::Stream => STREAM,
            Capability::KeyValue => KEY_VALUE,
            Capability::Documents => DOCUMENTS,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Broker => write!(f, "a message broker"),
            Capability::Stream => write!(f, "a record stream"),
            Capability::KeyValue => write!(f, "a key-value store"),
            Capability::Documents => write!(f, "a document store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_markers() {
        assert_eq!(ArgStyle::Positional.marker(1, None), "?");
        assert_eq!(ArgStyle::Dollar.marker(2, None), "$2");
        assert_eq!(ArgStyle::AtP.marker(3, None), "@p3");
        assert_eq!(ArgStyle::Named.marker(1, Some("id")), ":id");
        assert_eq!(ArgStyle::Named.marker(4, None), ":p4");
    }

    #[test]
    fn test_rewrite_skips_quoted_literals() {
        let sql = "SELECT * FROM pets WHERE name = ? AND note = 'why?' AND id = ?";
        assert_eq!(
            ArgStyle::Dollar.rewrite(sql, &[]),
            "SELECT * FROM pets WHERE name = $1 AND note = 'why?' AND id = $2"
        );
        assert_eq!(
            ArgStyle::Named.rewrite("id = ?", &["pet".to_string()]),
            "id = :pet"
        );
        assert_eq!(ArgStyle::Positional.rewrite(sql, &[]), sql);
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_reverses() {
        let mut registry = ImageRegistry::new();
        registry.insert(Arc::new(InMemoryBroker::new())).unwrap();
        registry.insert(Arc::new(InMemoryKeyValue::new())).unwrap();
        assert!(matches!(
            registry.insert(Arc::new(InMemoryBroker::new())),
            Err(DeclarationError::DuplicateImage(_))
        ));

        let names: Vec<String> = registry
            .reversed()
            .iter()
            .map(|image| image.name().to_string())
            .collect();
        assert_eq!(names, vec![KEY_VALUE.to_string(), BROKER.to_string()]);
    }

    #[test]
    fn test_capability_lookup() {
        let broker = InMemoryBroker::new();
        assert!(Capability::Broker.provided_by(&broker));
        assert!(!Capability::KeyValue.provided_by(&broker));
        assert_eq!(Capability::Documents.canonical_image(), DOCUMENTS);
    }
}
