//! HTTP driver: request building, the injectable doer seam and the default
//! reqwest-backed doer.

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{Result, SuiteError, TransportError};
use crate::plan::{fill_template, ExecutionUnit, RequestBody};
use crate::value::stringify;

/// HTTP verbs supported by method declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
        }
    }

    /// Case-insensitive parse, used for OpenAPI operation keys
    pub fn parse(verb: &str) -> Option<Self> {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::GET),
            "POST" => Some(HttpMethod::POST),
            "PUT" => Some(HttpMethod::PUT),
            "DELETE" => Some(HttpMethod::DELETE),
            "PATCH" => Some(HttpMethod::PATCH),
            "HEAD" => Some(HttpMethod::HEAD),
            "OPTIONS" => Some(HttpMethod::OPTIONS),
            _ => None,
        }
    }

    fn to_reqwest(self) -> Method {
        match self {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::DELETE => Method::DELETE,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::HEAD => Method::HEAD,
            HttpMethod::OPTIONS => Method::OPTIONS,
        }
    }
}

/// Fully resolved request handed to the doer
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }
}

/// Response as seen by the suite. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Duration measured by the doer itself, preferred over wall clock
    pub duration: Option<Duration>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Injectable transport. Implementations must be safe to reuse; the suite
/// calls them sequentially.
#[async_trait]
pub trait HttpDoer: Send + Sync {
    async fn do_request(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Default doer backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestDoer {
    client: Client,
    timeout: Duration,
}

impl ReqwestDoer {
    pub fn new(timeout: Duration) -> std::result::Result<Self, TransportError> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn extract_headers(response: &reqwest::Response) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        headers
    }
}

#[async_trait]
impl HttpDoer for ReqwestDoer {
    async fn do_request(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let mut builder = self
            .client
            .request(request.method.to_reqwest(), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout { timeout }
            } else if e.is_connect() {
                TransportError::ConnectionFailed(e.to_string())
            } else if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else {
                TransportError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = Self::extract_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::NetworkError(format!("Failed to read response body: {}", e)))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
            duration: Some(started.elapsed()),
        })
    }
}

/// Resolve everything the unit needs and assemble the request
pub async fn build_request(unit: &ExecutionUnit, ctx: &Context) -> Result<HttpRequest> {
    // Each value fills exactly one path segment
    let mut params = Vec::with_capacity(unit.path_params.len());
    for param in &unit.path_params {
        let value = stringify(&param.resolve(ctx).await?);
        params.push(urlencoding::encode(&value).into_owned());
    }
    let path = fill_template(&unit.path, &params)?;

    let base = ctx.base_url().trim_end_matches('/');
    let mut url = Url::parse(&format!("{}{}", base, path))
        .map_err(|e| TransportError::InvalidUrl(format!("{}{}: {}", base, path, e)))?;
    if !unit.query.is_empty() {
        let mut pairs = Vec::with_capacity(unit.query.len());
        for (name, value) in &unit.query {
            pairs.push((name.clone(), stringify(&value.resolve(ctx).await?)));
        }
        url.query_pairs_mut().extend_pairs(pairs);
    }

    let mut headers = Vec::with_capacity(unit.headers.len() + 1);
    for (name, value) in &unit.headers {
        headers.push((name.clone(), stringify(&value.resolve(ctx).await?)));
    }

    let (body, content_type) = match &unit.body {
        RequestBody::Empty => (None, None),
        RequestBody::Raw { bytes, content_type } => (Some(bytes.clone()), content_type.clone()),
        RequestBody::Value(body) => match body.resolve(ctx).await? {
            Value::Null => (None, None),
            Value::String(text) => (Some(text.into_bytes()), Some("text/plain; charset=utf-8".to_string())),
            value => (
                Some(serde_json::to_vec(&value).map_err(SuiteError::Serialization)?),
                Some("application/json".to_string()),
            ),
        },
    };
    if let Some(content_type) = content_type {
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
            headers.push(("Content-Type".to_string(), content_type));
        }
    }

    Ok(HttpRequest {
        method: unit.verb,
        url: url.to_string(),
        headers,
        body,
        timeout: ctx.request_timeout(),
    })
}
