//! API Suite - declarative integration testing for HTTP APIs
//!
//! Endpoints and methods are declared as a tree, flattened into an ordered
//! plan and run against the system under test. Hooks drive supporting
//! infrastructure (brokers, streams, key-value and document stores, SQL)
//! and listeners collect what the system emits, so expectations can check
//! both the HTTP response and the side effects.

pub mod cancel;
pub mod config;
pub mod context;
pub mod coverage;
pub mod endpoint;
pub mod error;
pub mod expect;
pub mod frame;
pub mod harness;
pub mod hooks;
pub mod http;
pub mod images;
pub mod listener;
pub mod options;
pub mod plan;
pub mod reporting;
pub mod resolve;
pub mod runner;
pub mod timings;
pub mod value;

// Re-export commonly used types
pub use cancel::Cancellation;
pub use config::SuiteConfig;
pub use context::{Context, LastResponse};
pub use coverage::{CoverageCollector, CoverageReport, OasTable};
pub use endpoint::{endpoint, Endpoint, EndpointItem, Method};
pub use error::{DeclarationError, HookError, ImageError, ResolveError, Result, SuiteError, TransportError};
pub use expect::{predicate, Check, CompareOp, Expectation};
pub use frame::Frame;
pub use harness::{CaptureBuffer, Harness, Sink, StandaloneHarness};
pub use hooks::{Hook, HookAction, When};
pub use http::{HttpDoer, HttpMethod, HttpRequest, HttpResponse, ReqwestDoer};
pub use images::{ArgStyle, Stage, SuiteInit, SupportingImage};
pub use listener::{Listener, ListenerKind, ListenerOptions};
pub use options::SuiteOption;
pub use plan::{ExecutionUnit, Plan, RequestBody};
pub use reporting::{FailureKind, MethodOutcome, MethodPhase, MethodReport, SuiteReport};
pub use resolve::Resolvable;
pub use runner::{InitializedSuite, Suite};
pub use timings::{TimingStats, Timings};
pub use value::LEN;

/// Crate name, sent in the default user agent
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install `env_logger` once. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .try_init();
}
