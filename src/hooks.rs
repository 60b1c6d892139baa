//! Before/after operations around a method's HTTP call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::error::{HookError, ResolveError};
use crate::frame::Frame;
use crate::images::{Capability, StreamSubscriber, SupportingImage};
use crate::listener::{panic_message, Delivery, ListenerKind, ListenerOptions, Registration};
use crate::resolve::{ImageQuery, Resolvable};
use crate::value::stringify;

/// Phase a hook runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum When {
    Before,
    After,
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            When::Before => write!(f, "before"),
            When::After => write!(f, "after"),
        }
    }
}

/// User callback run with mutable access to the context
pub type CaptureFn = Arc<dyn Fn(&mut Context) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum HookAction {
    Wait(Duration),
    SetVar {
        name: String,
        value: Resolvable,
    },
    CaptureFunc(CaptureFn),
    SendMessage {
        queue: String,
        message: Resolvable,
    },
    PublishMessage {
        topic: String,
        message: Resolvable,
    },
    PublishRecord {
        topic: String,
        key: Resolvable,
        message: Resolvable,
    },
    SetKey {
        key: String,
        value: Resolvable,
        ttl: Option<Duration>,
    },
    DeleteKey {
        key: String,
    },
    PushList {
        key: String,
        value: Resolvable,
    },
    InsertDocument {
        collection: String,
        document: Resolvable,
    },
    ClearCollection {
        collection: String,
    },
    DeleteDocuments {
        collection: String,
        filter: Resolvable,
    },
    SqlExec {
        sql: String,
        args: Vec<Resolvable>,
        /// Marker names for the `Named` arg style, one per arg when given
        names: Vec<String>,
    },
    QueueListener {
        name: String,
        queue: String,
        options: ListenerOptions,
    },
    TopicListener {
        name: String,
        topic: String,
        options: ListenerOptions,
    },
    StreamListener {
        name: String,
        subscriber: StreamSubscriber,
        options: ListenerOptions,
    },
    ChangeStreamListener {
        name: String,
        collection: String,
        options: ListenerOptions,
    },
    StopListener {
        name: String,
    },
    RecordEvent {
        name: String,
        event: Resolvable,
    },
}

impl HookAction {
    fn capability(&self) -> Option<Capability> {
        match self {
            HookAction::SendMessage { .. }
            | HookAction::PublishMessage { .. }
            | HookAction::QueueListener { .. }
            | HookAction::TopicListener { .. } => Some(Capability::Broker),
            HookAction::PublishRecord { .. } | HookAction::StreamListener { .. } => Some(Capability::Stream),
            HookAction::SetKey { .. } | HookAction::DeleteKey { .. } | HookAction::PushList { .. } => {
                Some(Capability::KeyValue)
            }
            HookAction::InsertDocument { .. }
            | HookAction::ClearCollection { .. }
            | HookAction::DeleteDocuments { .. }
            | HookAction::ChangeStreamListener { .. } => Some(Capability::Documents),
            _ => None,
        }
    }

    fn resolvables(&self) -> Vec<&Resolvable> {
        match self {
            HookAction::SetVar { value, .. }
            | HookAction::SetKey { value, .. }
            | HookAction::PushList { value, .. } => vec![value],
            HookAction::SendMessage { message, .. } | HookAction::PublishMessage { message, .. } => vec![message],
            HookAction::PublishRecord { key, message, .. } => vec![key, message],
            HookAction::InsertDocument { document, .. } => vec![document],
            HookAction::DeleteDocuments { filter, .. } => vec![filter],
            HookAction::SqlExec { args, .. } => args.iter().collect(),
            HookAction::RecordEvent { event, .. } => vec![event],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for HookAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookAction::Wait(duration) => write!(f, "Wait({}ms)", duration.as_millis()),
            HookAction::SetVar { name, value } => write!(f, "SetVar({:?}, {})", name, value),
            HookAction::CaptureFunc(_) => write!(f, "CaptureFunc"),
            HookAction::SendMessage { queue, message } => write!(f, "SendMessage({:?}, {})", queue, message),
            HookAction::PublishMessage { topic, message } => write!(f, "PublishMessage({:?}, {})", topic, message),
            HookAction::PublishRecord { topic, key, message } => {
                write!(f, "PublishRecord({:?}, {}, {})", topic, key, message)
            }
            HookAction::SetKey { key, value, .. } => write!(f, "SetKey({:?}, {})", key, value),
            HookAction::DeleteKey { key } => write!(f, "DeleteKey({:?})", key),
            HookAction::PushList { key, value } => write!(f, "PushList({:?}, {})", key, value),
            HookAction::InsertDocument { collection, document } => {
                write!(f, "InsertDocument({:?}, {})", collection, document)
            }
            HookAction::ClearCollection { collection } => write!(f, "ClearCollection({:?})", collection),
            HookAction::DeleteDocuments { collection, filter } => {
                write!(f, "DeleteDocuments({:?}, {})", collection, filter)
            }
            HookAction::SqlExec { sql, .. } => write!(f, "SqlExec({:?})", sql),
            HookAction::QueueListener { name, queue, .. } => write!(f, "QueueListener({:?}, {:?})", name, queue),
            HookAction::TopicListener { name, topic, .. } => write!(f, "TopicListener({:?}, {:?})", name, topic),
            HookAction::StreamListener { name, subscriber, .. } => write!(
                f,
                "StreamListener({:?}, {:?}, {:?})",
                name, subscriber.group, subscriber.topic
            ),
            HookAction::ChangeStreamListener { name, collection, .. } => {
                write!(f, "ChangeStreamListener({:?}, {:?})", name, collection)
            }
            HookAction::StopListener { name } => write!(f, "StopListener({:?})", name),
            HookAction::RecordEvent { name, event } => write!(f, "RecordEvent({:?}, {})", name, event),
        }
    }
}

/// One operation attached to a method
#[derive(Clone)]
pub struct Hook {
    pub when: When,
    pub frame: Frame,
    pub action: HookAction,
    /// Owning image; the capability's canonical name when unset
    pub image: Option<String>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.when, self.action, self.frame)
    }
}

impl Hook {
    pub fn new(when: When, action: HookAction, frame: Frame) -> Self {
        Self {
            when,
            frame,
            action,
            image: None,
        }
    }

    /// Run against a differently named image
    pub fn on_image(mut self, name: impl Into<String>) -> Self {
        self.image = Some(name.into());
        self
    }

    /// Expiry for `set_key`
    pub fn with_ttl(mut self, expiry: Duration) -> Self {
        if let HookAction::SetKey { ttl, .. } = &mut self.action {
            *ttl = Some(expiry);
        }
        self
    }

    /// Image this hook's own verb runs against
    pub fn required_image(&self) -> Option<(String, Capability)> {
        let capability = self.action.capability()?;
        let name = self
            .image
            .clone()
            .unwrap_or_else(|| capability.canonical_image().to_string());
        Some((name, capability))
    }

    /// Images needed by the verb and by any image query in its operands
    pub fn image_requirements(&self) -> Vec<(String, Capability)> {
        let mut requirements: Vec<(String, Capability)> = self.required_image().into_iter().collect();
        for resolvable in self.action.resolvables() {
            requirements.extend(
                resolvable
                    .image_queries()
                    .into_iter()
                    .filter_map(ImageQuery::required_image),
            );
        }
        requirements
    }

    /// True when the hook executes SQL or queries it in an operand
    pub fn needs_db(&self) -> bool {
        matches!(self.action, HookAction::SqlExec { .. })
            || self.action.resolvables().iter().any(|resolvable| {
                resolvable
                    .image_queries()
                    .iter()
                    .any(|query| matches!(query, ImageQuery::SqlQuery { .. }))
            })
    }

    fn owning_image(&self, ctx: &Context) -> Result<(Arc<dyn SupportingImage>, Capability), HookError> {
        let Some((name, capability)) = self.required_image() else {
            return Err(HookError::Callback(format!("{} has no owning image", self.action)));
        };
        let image = ctx.image(&name).map_err(|_| HookError::UnknownImage(name.clone()))?;
        if !capability.provided_by(image.as_ref()) {
            return Err(HookError::MissingCapability {
                image: name,
                capability: capability.to_string(),
            });
        }
        Ok((image, capability))
    }

    pub async fn run(&self, ctx: &mut Context) -> Result<(), HookError> {
        log::debug!("Running {} hook {} ({})", self.when, self.action, self.frame);
        match &self.action {
            HookAction::Wait(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(()),
                    _ = ctx.cancellation().cancelled() => Err(HookError::Cancelled),
                }
            }
            HookAction::SetVar { name, value } => {
                let value = value.resolve(ctx).await?;
                ctx.set_var(name.clone(), value);
                Ok(())
            }
            HookAction::CaptureFunc(callback) => match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HookError::Callback(format!("{:#}", e))),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!("Capture callback at {} panicked: {}", self.frame, message);
                    Err(HookError::Panicked(message))
                }
            },
            HookAction::SqlExec { sql, args, names } => {
                let db = ctx.db().ok_or(HookError::NoDatabase)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.resolve(ctx).await?);
                }
                let sql = ctx.db_arg_style().rewrite(sql, names);
                let affected = db.exec(&sql, &values).await?;
                log::debug!("SQL exec affected {} row(s)", affected);
                Ok(())
            }
            HookAction::StopListener { name } => {
                let listener = ctx
                    .listener(name)
                    .ok_or_else(|| ResolveError::UnknownListener(name.clone()))?;
                listener.stop();
                Ok(())
            }
            HookAction::RecordEvent { name, event } => {
                let event = event.resolve(ctx).await?;
                ctx.record_event(name.clone(), event);
                Ok(())
            }
            HookAction::QueueListener { name, options, .. }
            | HookAction::TopicListener { name, options, .. }
            | HookAction::StreamListener { name, options, .. }
            | HookAction::ChangeStreamListener { name, options, .. } => {
                self.register_listener(ctx, name, options.clone()).await
            }
            _ => self.run_image_verb(ctx).await,
        }
    }

    async fn register_listener(
        &self,
        ctx: &mut Context,
        name: &str,
        options: ListenerOptions,
    ) -> Result<(), HookError> {
        let (image, _) = self.owning_image(ctx)?;
        let kind = match &self.action {
            HookAction::QueueListener { .. } => ListenerKind::Queue,
            HookAction::TopicListener { .. } => ListenerKind::Topic,
            HookAction::StreamListener { .. } => ListenerKind::Stream,
            _ => ListenerKind::ChangeStream,
        };

        let listener = match ctx.listeners_mut().prepare(name, kind, options)? {
            Registration::Reused(_) => {
                log::debug!("Listener '{}' already registered; buffer cleared", name);
                return Ok(());
            }
            Registration::Fresh(listener) => listener,
        };

        let subscribed: Result<Delivery, HookError> = match &self.action {
            HookAction::QueueListener { queue, .. } => match image.as_broker() {
                Some(broker) => broker.subscribe_queue(queue).await.map_err(HookError::from),
                None => Err(HookError::MissingCapability {
                    image: image.name().to_string(),
                    capability: Capability::Broker.to_string(),
                }),
            },
            HookAction::TopicListener { topic, .. } => match image.as_broker() {
                Some(broker) => broker.subscribe_topic(topic).await.map_err(HookError::from),
                None => Err(HookError::MissingCapability {
                    image: image.name().to_string(),
                    capability: Capability::Broker.to_string(),
                }),
            },
            HookAction::StreamListener { subscriber, .. } => match image.as_stream() {
                Some(stream) => stream.subscribe(subscriber.clone()).await.map_err(HookError::from),
                None => Err(HookError::MissingCapability {
                    image: image.name().to_string(),
                    capability: Capability::Stream.to_string(),
                }),
            },
            HookAction::ChangeStreamListener { collection, .. } => match image.as_documents() {
                Some(documents) => documents.watch(collection).await.map_err(HookError::from),
                None => Err(HookError::MissingCapability {
                    image: image.name().to_string(),
                    capability: Capability::Documents.to_string(),
                }),
            },
            _ => Err(HookError::Callback(format!("{} is not a listener registration", self.action))),
        };

        match subscribed {
            Ok(delivery) => {
                let worker = listener.spawn(delivery, ctx.cancellation().clone());
                ctx.listeners_mut().track_worker(worker);
                log::info!("Registered {} listener '{}' on image '{}'", kind, name, image.name());
                Ok(())
            }
            Err(e) => {
                ctx.listeners_mut().abandon(name);
                Err(e)
            }
        }
    }

    async fn run_image_verb(&self, ctx: &mut Context) -> Result<(), HookError> {
        let (image, capability) = self.owning_image(ctx)?;
        let missing = || HookError::MissingCapability {
            image: image.name().to_string(),
            capability: capability.to_string(),
        };

        match &self.action {
            HookAction::SendMessage { queue, message } => {
                let payload = payload(ctx, message).await?;
                image.as_broker().ok_or_else(missing)?.send(queue, payload).await?;
            }
            HookAction::PublishMessage { topic, message } => {
                let payload = payload(ctx, message).await?;
                image.as_broker().ok_or_else(missing)?.publish(topic, payload).await?;
            }
            HookAction::PublishRecord { topic, key, message } => {
                let key = match key.resolve(ctx).await? {
                    serde_json::Value::Null => None,
                    key => Some(stringify(&key)),
                };
                let payload = payload(ctx, message).await?;
                image
                    .as_stream()
                    .ok_or_else(missing)?
                    .publish_record(topic, key, payload)
                    .await?;
            }
            HookAction::SetKey { key, value, ttl } => {
                let value = stringify(&value.resolve(ctx).await?);
                image.as_key_value().ok_or_else(missing)?.set(key, value, *ttl).await?;
            }
            HookAction::DeleteKey { key } => {
                image.as_key_value().ok_or_else(missing)?.delete(key).await?;
            }
            HookAction::PushList { key, value } => {
                let value = stringify(&value.resolve(ctx).await?);
                image.as_key_value().ok_or_else(missing)?.list_push(key, value).await?;
            }
            HookAction::InsertDocument { collection, document } => {
                let document = document.resolve(ctx).await?;
                image
                    .as_documents()
                    .ok_or_else(missing)?
                    .insert(collection, document)
                    .await?;
            }
            HookAction::ClearCollection { collection } => {
                image.as_documents().ok_or_else(missing)?.clear(collection).await?;
            }
            HookAction::DeleteDocuments { collection, filter } => {
                let filter = filter.resolve(ctx).await?;
                image
                    .as_documents()
                    .ok_or_else(missing)?
                    .delete_many(collection, &filter)
                    .await?;
            }
            other => {
                return Err(HookError::Callback(format!("{} does not run against an image", other)));
            }
        }
        Ok(())
    }
}

/// Resolve then stringify a message operand
async fn payload(ctx: &Context, message: &Resolvable) -> Result<Vec<u8>, HookError> {
    Ok(stringify(&message.resolve(ctx).await?).into_bytes())
}

// Constructors. Each captures the caller's location.

#[track_caller]
pub fn wait(when: When, millis: u64) -> Hook {
    Hook::new(when, HookAction::Wait(Duration::from_millis(millis)), Frame::caller("Wait"))
}

#[track_caller]
pub fn set_var(when: When, name: impl Into<String>, value: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::SetVar {
            name: name.into(),
            value: value.into(),
        },
        Frame::caller("SetVar"),
    )
}

#[track_caller]
pub fn capture_func<F>(when: When, callback: F) -> Hook
where
    F: Fn(&mut Context) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Hook::new(when, HookAction::CaptureFunc(Arc::new(callback)), Frame::caller("CaptureFunc"))
}

#[track_caller]
pub fn send_message(when: When, queue: impl Into<String>, message: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::SendMessage {
            queue: queue.into(),
            message: message.into(),
        },
        Frame::caller("SendMessage"),
    )
}

#[track_caller]
pub fn publish_message(when: When, topic: impl Into<String>, message: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::PublishMessage {
            topic: topic.into(),
            message: message.into(),
        },
        Frame::caller("PublishMessage"),
    )
}

/// Keyed stream record; a `null` key publishes without a key
#[track_caller]
pub fn publish_record(
    when: When,
    topic: impl Into<String>,
    key: impl Into<Resolvable>,
    message: impl Into<Resolvable>,
) -> Hook {
    Hook::new(
        when,
        HookAction::PublishRecord {
            topic: topic.into(),
            key: key.into(),
            message: message.into(),
        },
        Frame::caller("Publish"),
    )
}

#[track_caller]
pub fn set_key(when: When, key: impl Into<String>, value: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::SetKey {
            key: key.into(),
            value: value.into(),
            ttl: None,
        },
        Frame::caller("SetKey"),
    )
}

#[track_caller]
pub fn delete_key(when: When, key: impl Into<String>) -> Hook {
    Hook::new(when, HookAction::DeleteKey { key: key.into() }, Frame::caller("DeleteKey"))
}

#[track_caller]
pub fn push_list(when: When, key: impl Into<String>, value: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::PushList {
            key: key.into(),
            value: value.into(),
        },
        Frame::caller("PushList"),
    )
}

#[track_caller]
pub fn insert_document(when: When, collection: impl Into<String>, document: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::InsertDocument {
            collection: collection.into(),
            document: document.into(),
        },
        Frame::caller("InsertDocument"),
    )
}

#[track_caller]
pub fn clear_collection(when: When, collection: impl Into<String>) -> Hook {
    Hook::new(
        when,
        HookAction::ClearCollection {
            collection: collection.into(),
        },
        Frame::caller("ClearCollection"),
    )
}

#[track_caller]
pub fn delete_documents(when: When, collection: impl Into<String>, filter: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::DeleteDocuments {
            collection: collection.into(),
            filter: filter.into(),
        },
        Frame::caller("DeleteDocuments"),
    )
}

#[track_caller]
pub fn sql_exec<I>(when: When, sql: impl Into<String>, args: I) -> Hook
where
    I: IntoIterator,
    I::Item: Into<Resolvable>,
{
    Hook::new(
        when,
        HookAction::SqlExec {
            sql: sql.into(),
            args: args.into_iter().map(Into::into).collect(),
            names: Vec::new(),
        },
        Frame::caller("SqlExec"),
    )
}

/// `sql_exec` with named arguments; under the `Named` arg style each `?`
/// becomes `:name` in declaration order
#[track_caller]
pub fn sql_exec_named<I, K, V>(when: When, sql: impl Into<String>, args: I) -> Hook
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Resolvable>,
{
    let (names, args): (Vec<String>, Vec<Resolvable>) =
        args.into_iter().map(|(name, value)| (name.into(), value.into())).unzip();
    Hook::new(
        when,
        HookAction::SqlExec {
            sql: sql.into(),
            args,
            names,
        },
        Frame::caller("SqlExec"),
    )
}

#[track_caller]
pub fn queue_listener(
    when: When,
    name: impl Into<String>,
    queue: impl Into<String>,
    options: ListenerOptions,
) -> Hook {
    Hook::new(
        when,
        HookAction::QueueListener {
            name: name.into(),
            queue: queue.into(),
            options,
        },
        Frame::caller("QueueListener"),
    )
}

#[track_caller]
pub fn topic_listener(
    when: When,
    name: impl Into<String>,
    topic: impl Into<String>,
    options: ListenerOptions,
) -> Hook {
    Hook::new(
        when,
        HookAction::TopicListener {
            name: name.into(),
            topic: topic.into(),
            options,
        },
        Frame::caller("TopicListener"),
    )
}

#[track_caller]
pub fn stream_listener(
    when: When,
    name: impl Into<String>,
    subscriber: StreamSubscriber,
    options: ListenerOptions,
) -> Hook {
    Hook::new(
        when,
        HookAction::StreamListener {
            name: name.into(),
            subscriber,
            options,
        },
        Frame::caller("StreamListener"),
    )
}

#[track_caller]
pub fn change_stream_listener(
    when: When,
    name: impl Into<String>,
    collection: impl Into<String>,
    options: ListenerOptions,
) -> Hook {
    Hook::new(
        when,
        HookAction::ChangeStreamListener {
            name: name.into(),
            collection: collection.into(),
            options: options.json(),
        },
        Frame::caller("ChangeStreamListener"),
    )
}

#[track_caller]
pub fn stop_listener(when: When, name: impl Into<String>) -> Hook {
    Hook::new(when, HookAction::StopListener { name: name.into() }, Frame::caller("StopListener"))
}

#[track_caller]
pub fn record_event(when: When, name: impl Into<String>, event: impl Into<Resolvable>) -> Hook {
    Hook::new(
        when,
        HookAction::RecordEvent {
            name: name.into(),
            event: event.into(),
        },
        Frame::caller("RecordEvent"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::http::{HttpDoer, HttpRequest, HttpResponse};
    use crate::images::{ImageRegistry, InMemoryBroker, InMemoryKeyValue, KeyValueStore};
    use crate::resolve::{events, received_queue_messages, var};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NoopDoer;

    #[async_trait]
    impl HttpDoer for NoopDoer {
        async fn do_request(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(200))
        }
    }

    fn context_with(images: Vec<Arc<dyn SupportingImage>>) -> Context {
        let mut registry = ImageRegistry::new();
        for image in images {
            registry.insert(image).unwrap();
        }
        let mut ctx = Context::new(Arc::new(NoopDoer), "http://localhost");
        ctx.set_images(registry);
        ctx
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_set_var_resolves_operands() {
        let mut ctx = context_with(vec![]);
        ctx.set_var("id", json!("C1"));
        set_var(When::Before, "body", json!({"ok": true}))
            .run(&mut ctx)
            .await
            .unwrap();
        set_var(When::After, "copy", var("id")).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.var("body").unwrap(), json!({"ok": true}));
        assert_eq!(ctx.var("copy").unwrap(), json!("C1"));
    }

    #[tokio::test]
    async fn test_capture_func_errors_and_panics_are_contained() {
        let mut ctx = context_with(vec![]);
        capture_func(When::After, |ctx: &mut Context| {
            ctx.set_var("seen", json!(true));
            Ok(())
        })
        .run(&mut ctx)
        .await
        .unwrap();
        assert_eq!(ctx.var("seen").unwrap(), json!(true));

        let err = capture_func(When::After, |_: &mut Context| anyhow::bail!("bad state"))
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err, HookError::Callback("bad state".to_string()));

        let err = capture_func(When::After, |_: &mut Context| panic!("oops"))
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err, HookError::Panicked("oops".to_string()));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let mut ctx = context_with(vec![]);
        ctx.cancellation().cancel();
        let err = wait(When::Before, 60_000).run(&mut ctx).await.unwrap_err();
        assert_eq!(err, HookError::Cancelled);
    }

    #[tokio::test]
    async fn test_queue_listener_receives_sent_messages() {
        let mut ctx = context_with(vec![Arc::new(InMemoryBroker::new())]);
        queue_listener(When::Before, "q", "orders", ListenerOptions::default().with_max(3))
            .run(&mut ctx)
            .await
            .unwrap();
        for i in 1..=6 {
            send_message(When::Before, "orders", format!("m{}", i))
                .run(&mut ctx)
                .await
                .unwrap();
        }

        let listener = ctx.listener("q").unwrap();
        settle(|| listener.count() == 6).await;
        assert_eq!(received_queue_messages("q").resolve(&ctx).await.unwrap(), json!(6));
        assert_eq!(
            events("q").resolve(&ctx).await.unwrap(),
            json!(["m4", "m5", "m6"])
        );
    }

    #[tokio::test]
    async fn test_duplicate_listener_registration() {
        let mut ctx = context_with(vec![Arc::new(InMemoryBroker::new())]);
        let register = || topic_listener(When::Before, "t", "news", ListenerOptions::default());
        register().run(&mut ctx).await.unwrap();
        publish_message(When::Before, "news", json!({"n": 1}))
            .run(&mut ctx)
            .await
            .unwrap();
        let listener = ctx.listener("t").unwrap();
        settle(|| listener.count() == 1).await;

        register().run(&mut ctx).await.unwrap();
        assert_eq!(listener.count(), 0);
        assert!(Arc::ptr_eq(&listener, &ctx.listener("t").unwrap()));

        let err = queue_listener(When::Before, "t", "news", ListenerOptions::default())
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::ListenerKindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_key_value_hooks_and_image_override() {
        let cache = Arc::new(InMemoryKeyValue::named("cache"));
        let mut ctx = context_with(vec![cache.clone()]);

        let err = set_key(When::Before, "k", "v").run(&mut ctx).await.unwrap_err();
        assert_eq!(err, HookError::UnknownImage("kv".to_string()));

        set_key(When::Before, "k", json!({"a": 1}))
            .on_image("cache")
            .run(&mut ctx)
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(r#"{"a":1}"#.to_string()));

        push_list(When::Before, "jobs", 42).on_image("cache").run(&mut ctx).await.unwrap();
        assert_eq!(cache.list_len("jobs").await.unwrap(), 1);

        delete_key(When::After, "k").on_image("cache").run(&mut ctx).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_capability_is_reported() {
        let mut ctx = context_with(vec![Arc::new(InMemoryBroker::named("kv"))]);
        let err = set_key(When::Before, "k", "v").run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, HookError::MissingCapability { .. }));
    }

    #[tokio::test]
    async fn test_record_event_appends() {
        let mut ctx = context_with(vec![]);
        record_event(When::After, "audit", "created").run(&mut ctx).await.unwrap();
        record_event(When::After, "audit", "deleted").run(&mut ctx).await.unwrap();
        assert_eq!(ctx.events_snapshot("audit").unwrap(), vec![json!("created"), json!("deleted")]);
    }

    #[test]
    fn test_requirements() {
        let hook = send_message(When::Before, "q", crate::resolve::key_value("k").on_image("cache"));
        assert_eq!(
            hook.image_requirements(),
            vec![
                ("broker".to_string(), Capability::Broker),
                ("cache".to_string(), Capability::KeyValue)
            ]
        );
        assert!(!hook.needs_db());
        assert!(sql_exec(When::Before, "DELETE FROM pets", Vec::<Resolvable>::new()).needs_db());
        assert_eq!(wait(When::Before, 1).required_image(), None);
    }

    #[derive(Default)]
    struct RecordingDb {
        statements: parking_lot::Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl crate::images::SqlDatabase for RecordingDb {
        async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, crate::error::ImageError> {
            self.statements.lock().push((sql.to_string(), args.to_vec()));
            Ok(1)
        }

        async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Value>, crate::error::ImageError> {
            self.statements.lock().push((sql.to_string(), args.to_vec()));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_sql_exec_uses_named_markers() {
        let db = Arc::new(RecordingDb::default());
        let mut ctx = context_with(vec![]);
        let handle: Arc<dyn crate::images::SqlDatabase> = db.clone();
        ctx.set_db(Some(handle), crate::images::ArgStyle::Named);

        sql_exec_named(
            When::Before,
            "UPDATE pets SET name = ? WHERE id = ?",
            [("name", Resolvable::from("Rex")), ("id", Resolvable::from(7))],
        )
        .run(&mut ctx)
        .await
        .unwrap();
        sql_exec(When::Before, "DELETE FROM pets WHERE id = ?", [7])
            .run(&mut ctx)
            .await
            .unwrap();

        let statements = db.statements.lock().clone();
        assert_eq!(
            statements,
            vec![
                (
                    "UPDATE pets SET name = :name WHERE id = :id".to_string(),
                    vec![json!("Rex"), json!(7)]
                ),
                ("DELETE FROM pets WHERE id = :p1".to_string(), vec![json!(7)]),
            ]
        );
    }

    #[test]
    fn test_frames_point_at_declaration() {
        let line = line!() + 1;
        let hook = wait(When::Before, 10);
        assert_eq!(hook.frame.line, line);
        assert_eq!(hook.frame.symbol, "Wait");
    }
}
