#![allow(dead_code)]

use apisuite::harness::node_name;
use apisuite::{Frame, Harness, HttpDoer, HttpRequest, HttpResponse, TransportError};
use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// Mock HTTP doer for tests that only care about the calls made
mock! {
    pub Doer {}

    #[async_trait]
    impl HttpDoer for Doer {
        async fn do_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
    }
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<HttpResponse, TransportError>>,
    requests: Vec<HttpRequest>,
}

/// Doer answering from a queue of scripted replies and recording every
/// request it receives. Clones share the same script.
#[derive(Clone, Default)]
pub struct ScriptedDoer {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDoer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, response: HttpResponse) -> Self {
        self.script.lock().replies.push_back(Ok(response));
        self
    }

    pub fn json(self, status: u16, body: Value) -> Self {
        self.reply(HttpResponse::new(status).with_json(&body))
    }

    pub fn status(self, status: u16) -> Self {
        self.reply(HttpResponse::new(status))
    }

    pub fn fail(self, error: TransportError) -> Self {
        self.script.lock().replies.push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().replies.len()
    }
}

#[async_trait]
impl HttpDoer for ScriptedDoer {
    async fn do_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut script = self.script.lock();
        script.requests.push(request);
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::ConnectionFailed("no scripted reply left".to_string())))
    }
}

/// Doer that answers every request with the same status after `delay`
pub struct SlowDoer {
    pub status: u16,
    pub delay: Duration,
}

#[async_trait]
impl HttpDoer for SlowDoer {
    async fn do_request(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(HttpResponse::new(self.status))
    }
}

/// Harness event, as an attached harness would see it
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessEvent {
    Begin(String),
    Error(String, String),
    Fatal(String, String),
    Skip(String),
    End(String),
}

/// Attached-mode harness recording every call
#[derive(Clone, Default)]
pub struct RecordingHarness {
    pub events: Arc<Mutex<Vec<HarnessEvent>>>,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl RecordingHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HarnessEvent> {
        self.events.lock().clone()
    }

    /// Mark a node stopped, as a harness that aborted it would
    pub fn stop(&self, name: &str) {
        self.stopped.lock().push(name.to_string());
    }
}

impl Harness for RecordingHarness {
    fn begin(&mut self, path: &[String]) {
        self.events.lock().push(HarnessEvent::Begin(node_name(path)));
    }

    fn error(&mut self, path: &[String], _frame: &Frame, message: &str) {
        self.events
            .lock()
            .push(HarnessEvent::Error(node_name(path), message.to_string()));
    }

    fn fatal(&mut self, path: &[String], _frame: &Frame, message: &str) {
        let name = node_name(path);
        self.stopped.lock().push(name.clone());
        self.events.lock().push(HarnessEvent::Fatal(name, message.to_string()));
    }

    fn skip(&mut self, path: &[String], _reason: &str) {
        self.events.lock().push(HarnessEvent::Skip(node_name(path)));
    }

    fn end(&mut self, path: &[String]) {
        self.events.lock().push(HarnessEvent::End(node_name(path)));
    }

    fn is_stopped(&self, path: &[String]) -> bool {
        let stopped = self.stopped.lock();
        (1..=path.len()).any(|depth| stopped.contains(&node_name(&path[..depth])))
    }

    fn failed(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|event| matches!(event, HarnessEvent::Error(..) | HarnessEvent::Fatal(..)))
    }
}

pub fn request_line(request: &HttpRequest) -> String {
    format!("{} {}", request.method, request.url)
}
