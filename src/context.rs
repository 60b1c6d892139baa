//! Per-run scratchpad shared by hooks, resolvables and expectations.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::coverage::CoverageCollector;
use crate::error::ResolveError;
use crate::harness::Sink;
use crate::http::{HttpDoer, HttpResponse};
use crate::images::{ArgStyle, ImageRegistry, SqlDatabase, SupportingImage};
use crate::listener::{Listener, ListenerRegistry};
use crate::timings::Timings;

/// Response of the method currently executing
#[derive(Debug, Clone, PartialEq)]
pub struct LastResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Body decoded as JSON, or as text when it is not JSON
    pub value: Value,
    pub duration: Duration,
}

impl LastResponse {
    pub fn new(response: HttpResponse, duration: Duration) -> Self {
        let value = if response.body.is_empty() {
            Value::String(String::new())
        } else {
            serde_json::from_slice(&response.body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into_owned()))
        };
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            value,
            duration,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers_value(&self) -> Value {
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), Value::String(value.clone()));
        }
        Value::Object(headers)
    }
}

pub struct Context {
    vars: HashMap<String, Value>,
    images: ImageRegistry,
    listeners: ListenerRegistry,
    events: HashMap<String, Vec<Value>>,
    last_response: Option<LastResponse>,
    json_cache: Mutex<HashMap<String, Value>>,
    db: Option<Arc<dyn SqlDatabase>>,
    db_arg_style: ArgStyle,
    http: Arc<dyn HttpDoer>,
    base_url: String,
    request_timeout: Option<Duration>,
    timings: Timings,
    coverage: Option<CoverageCollector>,
    stdout: Sink,
    stderr: Sink,
    cancellation: Cancellation,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("vars", &self.vars)
            .field("images", &self.images)
            .field("listeners", &self.listeners.names())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("base_url", &self.base_url)
            .field("has_db", &self.db.is_some())
            .finish()
    }
}

impl Context {
    pub fn new(http: Arc<dyn HttpDoer>, base_url: impl Into<String>) -> Self {
        Self {
            vars: HashMap::new(),
            images: ImageRegistry::new(),
            listeners: ListenerRegistry::new(),
            events: HashMap::new(),
            last_response: None,
            json_cache: Mutex::new(HashMap::new()),
            db: None,
            db_arg_style: ArgStyle::default(),
            http,
            base_url: base_url.into(),
            request_timeout: None,
            timings: Timings::new(),
            coverage: None,
            stdout: Sink::stdout(),
            stderr: Sink::stderr(),
            cancellation: Cancellation::new(),
        }
    }

    // Variables

    pub fn var(&self, name: &str) -> Result<Value, ResolveError> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UndefinedVariable(name.to_string()))
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    /// Replace every variable with the given initial set
    pub fn reset_vars(&mut self, initial: &HashMap<String, Value>) {
        self.vars = initial.clone();
    }

    // Response

    pub fn last_response(&self) -> Result<&LastResponse, ResolveError> {
        self.last_response.as_ref().ok_or(ResolveError::NoResponse)
    }

    pub fn set_last_response(&mut self, response: HttpResponse, duration: Duration) {
        self.last_response = Some(LastResponse::new(response, duration));
    }

    pub fn clear_last_response(&mut self) {
        self.last_response = None;
    }

    /// Parse a JSON string, reusing earlier parses of identical content
    pub fn parse_json_cached(&self, text: &str) -> Result<Value, ResolveError> {
        if let Some(value) = self.json_cache.lock().get(text) {
            return Ok(value.clone());
        }
        let value: Value =
            serde_json::from_str(text).map_err(|e| ResolveError::InvalidJson(e.to_string()))?;
        self.json_cache.lock().insert(text.to_string(), value.clone());
        Ok(value)
    }

    pub(crate) fn clear_json_cache(&self) {
        self.json_cache.lock().clear();
    }

    // Listeners and events

    pub fn listener(&self, name: &str) -> Option<Arc<Listener>> {
        self.listeners.get(name)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    /// Append to the named event log
    pub fn record_event(&mut self, name: impl Into<String>, event: Value) {
        self.events.entry(name.into()).or_default().push(event);
    }

    /// Copy of a listener's buffer, or of the named event log
    pub fn events_snapshot(&self, name: &str) -> Result<Vec<Value>, ResolveError> {
        if let Some(listener) = self.listeners.get(name) {
            return Ok(listener.snapshot());
        }
        self.events
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownListener(name.to_string()))
    }

    /// Listener count (including dropped messages) or event log length
    pub fn events_count(&self, name: &str) -> Result<i64, ResolveError> {
        if let Some(listener) = self.listeners.get(name) {
            return Ok(listener.count());
        }
        self.events
            .get(name)
            .map(|events| events.len() as i64)
            .ok_or_else(|| ResolveError::UnknownListener(name.to_string()))
    }

    // Images and SQL

    pub fn image(&self, name: &str) -> Result<Arc<dyn SupportingImage>, ResolveError> {
        self.images
            .get(name)
            .ok_or_else(|| ResolveError::UnknownImage(name.to_string()))
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    pub(crate) fn set_images(&mut self, images: ImageRegistry) {
        self.images = images;
    }

    pub fn db(&self) -> Option<Arc<dyn SqlDatabase>> {
        self.db.clone()
    }

    pub fn db_arg_style(&self) -> ArgStyle {
        self.db_arg_style
    }

    pub fn set_db(&mut self, db: Option<Arc<dyn SqlDatabase>>, style: ArgStyle) {
        self.db = db;
        self.db_arg_style = style;
    }

    // HTTP

    pub fn http(&self) -> Arc<dyn HttpDoer> {
        Arc::clone(&self.http)
    }

    pub(crate) fn set_http(&mut self, http: Arc<dyn HttpDoer>) {
        self.http = http;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = base_url.into();
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub(crate) fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    // Collectors and sinks

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn timings_mut(&mut self) -> &mut Timings {
        &mut self.timings
    }

    pub fn coverage(&self) -> Option<&CoverageCollector> {
        self.coverage.as_ref()
    }

    pub fn coverage_mut(&mut self) -> Option<&mut CoverageCollector> {
        self.coverage.as_mut()
    }

    pub(crate) fn set_coverage(&mut self, coverage: Option<CoverageCollector>) {
        self.coverage = coverage;
    }

    pub fn stdout(&self) -> &Sink {
        &self.stdout
    }

    pub fn stderr(&self) -> &Sink {
        &self.stderr
    }

    pub(crate) fn set_sinks(&mut self, stdout: Sink, stderr: Sink) {
        self.stdout = stdout;
        self.stderr = stderr;
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub(crate) fn set_cancellation(&mut self, cancellation: Cancellation) {
        self.cancellation = cancellation;
    }
}
