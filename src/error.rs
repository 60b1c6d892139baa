use std::time::Duration;
use thiserror::Error;

use crate::reporting::SuiteReport;

/// Core error types for a suite run
#[derive(Error, Debug)]
pub enum SuiteError {
    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolveError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("OpenAPI document error: {0}")]
    Oas(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Suite cancelled")]
    Cancelled,

    #[error("Suite failed with {failures} recorded failure(s)")]
    Failed {
        failures: usize,
        report: Box<SuiteReport>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SuiteError {
    /// Report attached to a failed run, if any
    pub fn report(&self) -> Option<&SuiteReport> {
        match self {
            SuiteError::Failed { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Malformed declaration tree, raised before anything runs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeclarationError {
    #[error("{frame}: path '{path}' has {expected} placeholder(s) but {found} path param(s) were given")]
    PathParamMismatch {
        path: String,
        expected: usize,
        found: usize,
        frame: String,
    },

    #[error("{frame}: unknown supporting image '{image}'")]
    UnknownImage { image: String, frame: String },

    #[error("{frame}: image '{image}' does not provide {capability}")]
    MissingCapability {
        image: String,
        capability: String,
        frame: String,
    },

    #[error("{frame}: no SQL database registered")]
    NoDatabase { frame: String },

    #[error("Duplicate supporting image name: {0}")]
    DuplicateImage(String),

    #[error("Invalid path template: {0}")]
    InvalidPath(String),
}

/// Failure to dereference a resolvable against the context
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Variable not set: {0}")]
    UndefinedVariable(String),

    #[error("No response recorded for the current method")]
    NoResponse,

    #[error("Key not found: {0}")]
    MissingKey(String),

    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("Key '{key}' is not a valid list index")]
    InvalidIndex { key: String },

    #[error("Cannot traverse '{key}' into {found}")]
    NotAContainer { key: String, found: String },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("{0} of an empty sequence")]
    EmptySequence(&'static str),

    #[error("Unknown listener: {0}")]
    UnknownListener(String),

    #[error("Listener '{name}' is a {actual} listener, not {expected}")]
    ListenerKindMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown supporting image: {0}")]
    UnknownImage(String),

    #[error("Image '{image}' query failed: {message}")]
    Image { image: String, message: String },

    #[error("No SQL database registered")]
    NoDatabase,

    #[error("{0}")]
    Custom(String),
}

/// Errors returned by an HTTP doer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Errors raised while running a before/after hook
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HookError {
    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("Unknown supporting image: {0}")]
    UnknownImage(String),

    #[error("Image '{image}' does not provide {capability}")]
    MissingCapability { image: String, capability: String },

    #[error("Listener '{name}' already registered as {existing}, cannot register as {requested}")]
    ListenerKindMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("{0}")]
    Image(#[from] ImageError),

    #[error("No SQL database registered")]
    NoDatabase,

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Callback panicked: {0}")]
    Panicked(String),

    #[error("Hook cancelled")]
    Cancelled,
}

/// Supporting image lifecycle and verb errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("Image initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Image not initialized: {0}")]
    NotInitialized(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}

impl From<sqlx::Error> for ImageError {
    fn from(err: sqlx::Error) -> Self {
        ImageError::Sql(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SuiteError>;
