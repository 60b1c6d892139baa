//! Options accepted by `Suite::init`. They apply in order; a later option
//! overrides an earlier one of the same kind.

use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::coverage::{CoverageReport, OasTable};
use crate::harness::{Harness, Sink};
use crate::hooks::Hook;
use crate::http::HttpDoer;
use crate::images::SupportingImage;

/// Receives the final coverage report
pub type CoverageCallback = Box<dyn Fn(&CoverageReport) + Send + Sync>;

pub enum SuiteOption {
    ApiHost { host: String, port: u16 },
    ApiScheme(String),
    HttpDo(Arc<dyn HttpDoer>),
    /// Raw OpenAPI document, or the read error that prevented loading it
    Oas(std::result::Result<String, String>),
    OasTable(OasTable),
    Repeats { count: usize, stop_on_failure: bool },
    Logging { stdout: Sink, stderr: Sink },
    Var(String, Value),
    TraceTimings,
    Testing(Box<dyn Harness>),
    ReportCoverage(CoverageCallback),
    DisableReaperShutdowns,
    Image(Arc<dyn SupportingImage>),
    RequestTimeout(Duration),
    /// Hook run once at the start of every repeat, before the first method
    Setup(Hook),
    /// Write the JSON run report here when the run ends
    ReportPath(PathBuf),
}

impl fmt::Debug for SuiteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteOption::ApiHost { host, port } => write!(f, "ApiHost({}, {})", host, port),
            SuiteOption::ApiScheme(scheme) => write!(f, "ApiScheme({})", scheme),
            SuiteOption::HttpDo(_) => write!(f, "HttpDo"),
            SuiteOption::Oas(_) => write!(f, "OAS"),
            SuiteOption::OasTable(table) => write!(f, "OasTable({} operations)", table.len()),
            SuiteOption::Repeats { count, stop_on_failure } => {
                write!(f, "Repeats({}, {})", count, stop_on_failure)
            }
            SuiteOption::Logging { .. } => write!(f, "Logging"),
            SuiteOption::Var(name, value) => write!(f, "Var({}, {})", name, value),
            SuiteOption::TraceTimings => write!(f, "TraceTimings"),
            SuiteOption::Testing(_) => write!(f, "Testing"),
            SuiteOption::ReportCoverage(_) => write!(f, "ReportCoverage"),
            SuiteOption::DisableReaperShutdowns => write!(f, "DisableReaperShutdowns"),
            SuiteOption::Image(image) => write!(f, "Image({})", image.name()),
            SuiteOption::RequestTimeout(timeout) => write!(f, "RequestTimeout({:?})", timeout),
            SuiteOption::Setup(hook) => write!(f, "Setup({:?})", hook),
            SuiteOption::ReportPath(path) => write!(f, "ReportPath({})", path.display()),
        }
    }
}

pub fn api_host(host: impl Into<String>, port: u16) -> SuiteOption {
    SuiteOption::ApiHost {
        host: host.into(),
        port,
    }
}

/// `http` (default) or `https`
pub fn api_scheme(scheme: impl Into<String>) -> SuiteOption {
    SuiteOption::ApiScheme(scheme.into())
}

pub fn http_do<D: HttpDoer + 'static>(doer: D) -> SuiteOption {
    SuiteOption::HttpDo(Arc::new(doer))
}

pub fn http_do_shared(doer: Arc<dyn HttpDoer>) -> SuiteOption {
    SuiteOption::HttpDo(doer)
}

/// OpenAPI 3 document, YAML or JSON. Parse errors surface from `init`.
pub fn oas<R: Read>(mut reader: R) -> SuiteOption {
    let mut document = String::new();
    SuiteOption::Oas(
        reader
            .read_to_string(&mut document)
            .map(|_| document)
            .map_err(|e| e.to_string()),
    )
}

/// Already-parsed path/method/status table
pub fn oas_table(table: OasTable) -> SuiteOption {
    SuiteOption::OasTable(table)
}

pub fn repeats(count: usize, stop_on_failure: bool) -> SuiteOption {
    SuiteOption::Repeats {
        count,
        stop_on_failure,
    }
}

/// Writers for the standalone reporter's stdout and stderr lines
pub fn logging<O, E>(stdout: O, stderr: E) -> SuiteOption
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    SuiteOption::Logging {
        stdout: Sink::new(stdout),
        stderr: Sink::new(stderr),
    }
}

pub fn logging_sinks(stdout: Sink, stderr: Sink) -> SuiteOption {
    SuiteOption::Logging { stdout, stderr }
}

pub fn var(name: impl Into<String>, value: impl Into<Value>) -> SuiteOption {
    SuiteOption::Var(name.into(), value.into())
}

/// Log every request duration and the final statistics
pub fn trace_timings() -> SuiteOption {
    SuiteOption::TraceTimings
}

/// Route results into an external harness instead of the standalone reporter
pub fn testing<H: Harness + 'static>(harness: H) -> SuiteOption {
    SuiteOption::Testing(Box::new(harness))
}

pub fn report_coverage<F>(callback: F) -> SuiteOption
where
    F: Fn(&CoverageReport) + Send + Sync + 'static,
{
    SuiteOption::ReportCoverage(Box::new(callback))
}

pub fn disable_reaper_shutdowns() -> SuiteOption {
    SuiteOption::DisableReaperShutdowns
}

pub fn image<I: SupportingImage + 'static>(image: I) -> SuiteOption {
    SuiteOption::Image(Arc::new(image))
}

pub fn image_shared(image: Arc<dyn SupportingImage>) -> SuiteOption {
    SuiteOption::Image(image)
}

pub fn request_timeout(timeout: Duration) -> SuiteOption {
    SuiteOption::RequestTimeout(timeout)
}

pub fn setup(hook: Hook) -> SuiteOption {
    SuiteOption::Setup(hook)
}

pub fn report_path(path: impl Into<PathBuf>) -> SuiteOption {
    SuiteOption::ReportPath(path.into())
}
