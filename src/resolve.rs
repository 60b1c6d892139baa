//! Lazy values dereferenced against the run context at use time.
//!
//! Containers are resolved recursively, so a literal request body may hold
//! variable references or JSON-path extractors at any depth.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::error::ResolveError;
use crate::images::Capability;
use crate::listener::ListenerKind;
use crate::value::{self, type_name};

pub use crate::value::LEN;

/// Extension point for values contributed by supporting images or users
#[async_trait]
pub trait DomainResolvable: Send + Sync {
    /// Symbolic form used in failure messages
    fn describe(&self) -> String;

    async fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError>;
}

/// Queries answered by a supporting image
#[derive(Debug, Clone)]
pub enum ImageQuery {
    QueueLength {
        image: Option<String>,
        queue: String,
    },
    KeyValue {
        image: Option<String>,
        key: String,
    },
    ListLength {
        image: Option<String>,
        key: String,
    },
    BlockingPop {
        image: Option<String>,
        key: String,
        timeout: Duration,
    },
    FindDocuments {
        image: Option<String>,
        collection: String,
        filter: Box<Resolvable>,
    },
    CountDocuments {
        image: Option<String>,
        collection: String,
        filter: Box<Resolvable>,
    },
    SqlQuery {
        sql: String,
        args: Vec<Resolvable>,
        names: Vec<String>,
    },
}

impl ImageQuery {
    fn image_slot(&mut self) -> Option<&mut Option<String>> {
        match self {
            ImageQuery::QueueLength { image, .. }
            | ImageQuery::KeyValue { image, .. }
            | ImageQuery::ListLength { image, .. }
            | ImageQuery::BlockingPop { image, .. }
            | ImageQuery::FindDocuments { image, .. }
            | ImageQuery::CountDocuments { image, .. } => Some(image),
            ImageQuery::SqlQuery { .. } => None,
        }
    }

    fn capability(&self) -> Option<Capability> {
        match self {
            ImageQuery::QueueLength { .. } => Some(Capability::Broker),
            ImageQuery::KeyValue { .. } | ImageQuery::ListLength { .. } | ImageQuery::BlockingPop { .. } => {
                Some(Capability::KeyValue)
            }
            ImageQuery::FindDocuments { .. } | ImageQuery::CountDocuments { .. } => Some(Capability::Documents),
            ImageQuery::SqlQuery { .. } => None,
        }
    }

    /// Image this query needs, for validation before the suite runs
    pub fn required_image(&self) -> Option<(String, Capability)> {
        let capability = self.capability()?;
        let image = match self {
            ImageQuery::QueueLength { image, .. }
            | ImageQuery::KeyValue { image, .. }
            | ImageQuery::ListLength { image, .. }
            | ImageQuery::BlockingPop { image, .. }
            | ImageQuery::FindDocuments { image, .. }
            | ImageQuery::CountDocuments { image, .. } => image.clone(),
            ImageQuery::SqlQuery { .. } => None,
        };
        Some((
            image.unwrap_or_else(|| capability.canonical_image().to_string()),
            capability,
        ))
    }

    async fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        if let ImageQuery::SqlQuery { sql, args, names } = self {
            let db = ctx.db().ok_or(ResolveError::NoDatabase)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(arg.resolve(ctx).await?);
            }
            let sql = ctx.db_arg_style().rewrite(sql, names);
            let rows = db.query(&sql, &values).await.map_err(|e| ResolveError::Image {
                image: "sql".to_string(),
                message: e.to_string(),
            })?;
            return Ok(Value::Array(rows));
        }

        let Some((name, capability)) = self.required_image() else {
            return Err(ResolveError::Custom(format!("{} has no owning image", self)));
        };
        let image = ctx.image(&name)?;
        let failed = |message: String| ResolveError::Image {
            image: name.clone(),
            message,
        };
        let missing = || failed(format!("does not provide {}", capability));

        match self {
            ImageQuery::QueueLength { queue, .. } => {
                let broker = image.as_broker().ok_or_else(missing)?;
                let depth = broker.queue_depth(queue).await.map_err(|e| failed(e.to_string()))?;
                Ok(Value::from(depth))
            }
            ImageQuery::KeyValue { key, .. } => {
                let store = image.as_key_value().ok_or_else(missing)?;
                let value = store.get(key).await.map_err(|e| failed(e.to_string()))?;
                Ok(value.map(Value::String).unwrap_or(Value::Null))
            }
            ImageQuery::ListLength { key, .. } => {
                let store = image.as_key_value().ok_or_else(missing)?;
                let len = store.list_len(key).await.map_err(|e| failed(e.to_string()))?;
                Ok(Value::from(len))
            }
            ImageQuery::BlockingPop { key, timeout, .. } => {
                let store = image.as_key_value().ok_or_else(missing)?;
                let popped = tokio::select! {
                    popped = store.blocking_pop(key, *timeout) => popped.map_err(|e| failed(e.to_string()))?,
                    _ = ctx.cancellation().cancelled() => None,
                };
                Ok(popped.map(Value::String).unwrap_or(Value::Null))
            }
            ImageQuery::FindDocuments { collection, filter, .. } => {
                let filter = filter.resolve(ctx).await?;
                let store = image.as_documents().ok_or_else(missing)?;
                let found = store
                    .find(collection, &filter)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                Ok(Value::Array(found))
            }
            ImageQuery::CountDocuments { collection, filter, .. } => {
                let filter = filter.resolve(ctx).await?;
                let store = image.as_documents().ok_or_else(missing)?;
                let count = store
                    .count(collection, &filter)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                Ok(Value::from(count))
            }
            ImageQuery::SqlQuery { .. } => Err(missing()),
        }
    }
}

impl fmt::Display for ImageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageQuery::QueueLength { queue, .. } => write!(f, "QueueLength({:?})", queue),
            ImageQuery::KeyValue { key, .. } => write!(f, "KeyValue({:?})", key),
            ImageQuery::ListLength { key, .. } => write!(f, "ListLength({:?})", key),
            ImageQuery::BlockingPop { key, timeout, .. } => {
                write!(f, "BlockingPop({:?}, {}ms)", key, timeout.as_millis())
            }
            ImageQuery::FindDocuments { collection, filter, .. } => {
                write!(f, "FindDocuments({:?}, {})", collection, filter)
            }
            ImageQuery::CountDocuments { collection, filter, .. } => {
                write!(f, "CountDocuments({:?}, {})", collection, filter)
            }
            ImageQuery::SqlQuery { sql, .. } => write!(f, "SqlQuery({:?})", sql),
        }
    }
}

/// A value whose final form is decided at execution time
#[derive(Clone)]
pub enum Resolvable {
    Literal(Value),
    Object(Vec<(String, Resolvable)>),
    Array(Vec<Resolvable>),
    Var(String),
    Body,
    Status,
    Headers,
    Header(String),
    JsonPath(Box<Resolvable>, String),
    First(Box<Resolvable>),
    Last(Box<Resolvable>),
    Events(String),
    EventsCount(String),
    ListenerCount {
        kind: ListenerKind,
        name: String,
    },
    ListenerMessage {
        kind: ListenerKind,
        name: String,
        index: i64,
    },
    Image(ImageQuery),
    Custom(Arc<dyn DomainResolvable>),
}

impl fmt::Debug for Resolvable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Resolvable {
    pub fn object<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Resolvable>,
        I: IntoIterator<Item = (K, V)>,
    {
        Resolvable::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn array<V, I>(items: I) -> Self
    where
        V: Into<Resolvable>,
        I: IntoIterator<Item = V>,
    {
        Resolvable::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn custom<R: DomainResolvable + 'static>(resolvable: R) -> Self {
        Resolvable::Custom(Arc::new(resolvable))
    }

    /// Direct an image query at a non-canonical image name
    pub fn on_image(mut self, name: impl Into<String>) -> Self {
        if let Resolvable::Image(query) = &mut self {
            if let Some(slot) = query.image_slot() {
                *slot = Some(name.into());
            }
        }
        self
    }

    /// Every image query reachable from this value
    pub fn image_queries(&self) -> Vec<&ImageQuery> {
        let mut queries = Vec::new();
        self.collect_image_queries(&mut queries);
        queries
    }

    fn collect_image_queries<'a>(&'a self, out: &mut Vec<&'a ImageQuery>) {
        match self {
            Resolvable::Image(query) => {
                out.push(query);
                match query {
                    ImageQuery::FindDocuments { filter, .. } | ImageQuery::CountDocuments { filter, .. } => {
                        filter.collect_image_queries(out)
                    }
                    ImageQuery::SqlQuery { args, .. } => {
                        for arg in args {
                            arg.collect_image_queries(out);
                        }
                    }
                    _ => {}
                }
            }
            Resolvable::Object(fields) => {
                for (_, value) in fields {
                    value.collect_image_queries(out);
                }
            }
            Resolvable::Array(items) => {
                for item in items {
                    item.collect_image_queries(out);
                }
            }
            Resolvable::JsonPath(source, _) | Resolvable::First(source) | Resolvable::Last(source) => {
                source.collect_image_queries(out)
            }
            _ => {}
        }
    }

    pub fn resolve<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value, ResolveError>> {
        async move {
            match self {
                Resolvable::Literal(value) => Ok(value.clone()),
                Resolvable::Object(fields) => {
                    let mut resolved = Map::new();
                    for (key, value) in fields {
                        resolved.insert(key.clone(), value.resolve(ctx).await?);
                    }
                    Ok(Value::Object(resolved))
                }
                Resolvable::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(item.resolve(ctx).await?);
                    }
                    Ok(Value::Array(resolved))
                }
                Resolvable::Var(name) => ctx.var(name),
                Resolvable::Body => Ok(ctx.last_response()?.value.clone()),
                Resolvable::Status => Ok(Value::from(ctx.last_response()?.status)),
                Resolvable::Headers => Ok(ctx.last_response()?.headers_value()),
                Resolvable::Header(name) => ctx
                    .last_response()?
                    .header(name)
                    .map(|value| Value::String(value.to_string()))
                    .ok_or_else(|| ResolveError::MissingKey(name.clone())),
                Resolvable::JsonPath(source, key) => {
                    let container = decode(ctx, source.resolve(ctx).await?)?;
                    value::step(&container, key)
                }
                Resolvable::First(source) => {
                    let items = sequence(ctx, source.resolve(ctx).await?)?;
                    items.into_iter().next().ok_or(ResolveError::EmptySequence("First"))
                }
                Resolvable::Last(source) => {
                    let items = sequence(ctx, source.resolve(ctx).await?)?;
                    items.into_iter().last().ok_or(ResolveError::EmptySequence("Last"))
                }
                Resolvable::Events(name) => Ok(Value::Array(ctx.events_snapshot(name)?)),
                Resolvable::EventsCount(name) => Ok(Value::from(ctx.events_count(name)?)),
                Resolvable::ListenerCount { kind, name } => {
                    let listener = typed_listener(ctx, *kind, name)?;
                    Ok(Value::from(listener.count()))
                }
                Resolvable::ListenerMessage { kind, name, index } => {
                    let listener = typed_listener(ctx, *kind, name)?;
                    listener.message(*index).ok_or(ResolveError::IndexOutOfRange {
                        index: *index,
                        len: listener.len(),
                    })
                }
                Resolvable::Image(query) => query.resolve(ctx).await,
                Resolvable::Custom(custom) => custom.resolve(ctx).await,
            }
        }
        .boxed()
    }
}

/// Strings holding JSON are parsed (and cached) before traversal
fn decode(ctx: &Context, value: Value) -> Result<Value, ResolveError> {
    match value {
        Value::String(text) => ctx.parse_json_cached(&text),
        other => Ok(other),
    }
}

fn sequence(ctx: &Context, value: Value) -> Result<Vec<Value>, ResolveError> {
    match decode(ctx, value)? {
        Value::Array(items) => Ok(items),
        other => Err(ResolveError::TypeMismatch {
            expected: "array".to_string(),
            actual: type_name(&other).to_string(),
        }),
    }
}

fn typed_listener(
    ctx: &Context,
    kind: ListenerKind,
    name: &str,
) -> Result<Arc<crate::listener::Listener>, ResolveError> {
    let listener = ctx
        .listener(name)
        .ok_or_else(|| ResolveError::UnknownListener(name.to_string()))?;
    if listener.kind() != kind {
        return Err(ResolveError::ListenerKindMismatch {
            name: name.to_string(),
            expected: kind.to_string(),
            actual: listener.kind().to_string(),
        });
    }
    Ok(listener)
}

impl fmt::Display for Resolvable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolvable::Literal(value) => write!(f, "{}", value),
            Resolvable::Object(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Resolvable::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Resolvable::Var(name) => write!(f, "Var({:?})", name),
            Resolvable::Body => write!(f, "Body"),
            Resolvable::Status => write!(f, "Status"),
            Resolvable::Headers => write!(f, "Headers"),
            Resolvable::Header(name) => write!(f, "Header({:?})", name),
            Resolvable::JsonPath(source, key) => write!(f, "JsonPath({}, {:?})", source, key),
            Resolvable::First(source) => write!(f, "First({})", source),
            Resolvable::Last(source) => write!(f, "Last({})", source),
            Resolvable::Events(name) => write!(f, "Events({:?})", name),
            Resolvable::EventsCount(name) => write!(f, "EventsCount({:?})", name),
            Resolvable::ListenerCount { kind, name } => write!(f, "Received{}Messages({:?})", kind_label(*kind), name),
            Resolvable::ListenerMessage { kind, name, index } => {
                write!(f, "Received{}Message({:?}, {})", kind_label(*kind), name, index)
            }
            Resolvable::Image(query) => write!(f, "{}", query),
            Resolvable::Custom(custom) => f.write_str(&custom.describe()),
        }
    }
}

fn kind_label(kind: ListenerKind) -> &'static str {
    match kind {
        ListenerKind::Queue => "Queue",
        ListenerKind::Topic => "Topic",
        ListenerKind::Stream => "Stream",
        ListenerKind::ChangeStream => "Change",
        ListenerKind::Custom(name) => name,
    }
}

impl From<Value> for Resolvable {
    fn from(value: Value) -> Self {
        Resolvable::Literal(value)
    }
}

impl From<&str> for Resolvable {
    fn from(value: &str) -> Self {
        Resolvable::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Resolvable {
    fn from(value: String) -> Self {
        Resolvable::Literal(Value::String(value))
    }
}

impl From<bool> for Resolvable {
    fn from(value: bool) -> Self {
        Resolvable::Literal(Value::Bool(value))
    }
}

macro_rules! literal_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Resolvable {
                fn from(value: $ty) -> Self {
                    Resolvable::Literal(Value::from(value))
                }
            }
        )*
    };
}

literal_from_number!(i32, i64, u16, u32, u64, usize, f64);

impl From<Vec<Resolvable>> for Resolvable {
    fn from(items: Vec<Resolvable>) -> Self {
        Resolvable::Array(items)
    }
}

// Constructors mirroring the declarative surface

pub fn var(name: impl Into<String>) -> Resolvable {
    Resolvable::Var(name.into())
}

pub fn body() -> Resolvable {
    Resolvable::Body
}

pub fn status() -> Resolvable {
    Resolvable::Status
}

pub fn headers() -> Resolvable {
    Resolvable::Headers
}

pub fn header(name: impl Into<String>) -> Resolvable {
    Resolvable::Header(name.into())
}

pub fn json_path(source: impl Into<Resolvable>, key: impl Into<String>) -> Resolvable {
    Resolvable::JsonPath(Box::new(source.into()), key.into())
}

/// Successive `json_path` steps
pub fn json_traverse<K: Into<String>>(source: impl Into<Resolvable>, keys: impl IntoIterator<Item = K>) -> Resolvable {
    keys.into_iter()
        .fold(source.into(), |source, key| json_path(source, key))
}

pub fn first(source: impl Into<Resolvable>) -> Resolvable {
    Resolvable::First(Box::new(source.into()))
}

pub fn last(source: impl Into<Resolvable>) -> Resolvable {
    Resolvable::Last(Box::new(source.into()))
}

pub fn events(name: impl Into<String>) -> Resolvable {
    Resolvable::Events(name.into())
}

pub fn events_count(name: impl Into<String>) -> Resolvable {
    Resolvable::EventsCount(name.into())
}

pub fn received_queue_messages(name: impl Into<String>) -> Resolvable {
    Resolvable::ListenerCount {
        kind: ListenerKind::Queue,
        name: name.into(),
    }
}

pub fn received_queue_message(name: impl Into<String>, index: i64) -> Resolvable {
    Resolvable::ListenerMessage {
        kind: ListenerKind::Queue,
        name: name.into(),
        index,
    }
}

pub fn received_topic_messages(name: impl Into<String>) -> Resolvable {
    Resolvable::ListenerCount {
        kind: ListenerKind::Topic,
        name: name.into(),
    }
}

pub fn received_topic_message(name: impl Into<String>, index: i64) -> Resolvable {
    Resolvable::ListenerMessage {
        kind: ListenerKind::Topic,
        name: name.into(),
        index,
    }
}

pub fn received_stream_messages(name: impl Into<String>) -> Resolvable {
    Resolvable::ListenerCount {
        kind: ListenerKind::Stream,
        name: name.into(),
    }
}

pub fn received_stream_message(name: impl Into<String>, index: i64) -> Resolvable {
    Resolvable::ListenerMessage {
        kind: ListenerKind::Stream,
        name: name.into(),
        index,
    }
}

pub fn received_changes(name: impl Into<String>) -> Resolvable {
    Resolvable::ListenerCount {
        kind: ListenerKind::ChangeStream,
        name: name.into(),
    }
}

pub fn received_change(name: impl Into<String>, index: i64) -> Resolvable {
    Resolvable::ListenerMessage {
        kind: ListenerKind::ChangeStream,
        name: name.into(),
        index,
    }
}

pub fn queue_length(queue: impl Into<String>) -> Resolvable {
    Resolvable::Image(ImageQuery::QueueLength {
        image: None,
        queue: queue.into(),
    })
}

pub fn key_value(key: impl Into<String>) -> Resolvable {
    Resolvable::Image(ImageQuery::KeyValue {
        image: None,
        key: key.into(),
    })
}

pub fn list_length(key: impl Into<String>) -> Resolvable {
    Resolvable::Image(ImageQuery::ListLength {
        image: None,
        key: key.into(),
    })
}

pub fn blocking_pop(key: impl Into<String>, timeout: Duration) -> Resolvable {
    Resolvable::Image(ImageQuery::BlockingPop {
        image: None,
        key: key.into(),
        timeout,
    })
}

pub fn find_documents(collection: impl Into<String>, filter: impl Into<Resolvable>) -> Resolvable {
    Resolvable::Image(ImageQuery::FindDocuments {
        image: None,
        collection: collection.into(),
        filter: Box::new(filter.into()),
    })
}

pub fn count_documents(collection: impl Into<String>, filter: impl Into<Resolvable>) -> Resolvable {
    Resolvable::Image(ImageQuery::CountDocuments {
        image: None,
        collection: collection.into(),
        filter: Box::new(filter.into()),
    })
}

/// Rows as JSON objects; `?` markers are rewritten to the database's style
pub fn sql_query<I>(sql: impl Into<String>, args: I) -> Resolvable
where
    I: IntoIterator,
    I::Item: Into<Resolvable>,
{
    Resolvable::Image(ImageQuery::SqlQuery {
        sql: sql.into(),
        args: args.into_iter().map(Into::into).collect(),
        names: Vec::new(),
    })
}

/// `sql_query` with `(name, value)` arguments for the `Named` arg style
pub fn sql_query_named<I, K, V>(sql: impl Into<String>, args: I) -> Resolvable
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Resolvable>,
{
    let (names, args): (Vec<String>, Vec<Resolvable>) =
        args.into_iter().map(|(name, value)| (name.into(), value.into())).unzip();
    Resolvable::Image(ImageQuery::SqlQuery {
        sql: sql.into(),
        args,
        names,
    })
}
