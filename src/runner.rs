//! Suite runner: option handling, image lifecycle and the sequential
//! execution of a flattened plan.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::Cancellation;
use crate::context::Context;
use crate::coverage::{CoverageCollector, OasTable};
use crate::endpoint::Endpoint;
use crate::error::{DeclarationError, HookError, Result, SuiteError, TransportError};
use crate::frame::Frame;
use crate::harness::{node_name, Harness, NodeStack, Sink, StandaloneHarness};
use crate::hooks::Hook;
use crate::http::{build_request, HttpDoer, ReqwestDoer};
use crate::images::{Capability, ImageRegistry, SuiteInit, SupportingImage};
use crate::options::{CoverageCallback, SuiteOption};
use crate::plan::{ExecutionUnit, Plan};
use crate::reporting::{FailureKind, FailureRecord, MethodOutcome, MethodPhase, MethodReport, SuiteReport};
use crate::resolve::ImageQuery;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Option values after applying every `SuiteOption` in order
struct Settings {
    scheme: String,
    host: String,
    port: u16,
    http: Option<Arc<dyn HttpDoer>>,
    oas: Option<OasTable>,
    repeats: usize,
    stop_on_failure: bool,
    stdout: Sink,
    stderr: Sink,
    vars: HashMap<String, Value>,
    trace_timings: bool,
    harness: Option<Box<dyn Harness>>,
    coverage_callback: Option<CoverageCallback>,
    reaper_shutdowns_disabled: bool,
    images: Vec<Arc<dyn SupportingImage>>,
    request_timeout: Option<Duration>,
    setup: Vec<Hook>,
    report_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            http: None,
            oas: None,
            repeats: 1,
            stop_on_failure: false,
            stdout: Sink::stdout(),
            stderr: Sink::stderr(),
            vars: HashMap::new(),
            trace_timings: false,
            harness: None,
            coverage_callback: None,
            reaper_shutdowns_disabled: false,
            images: Vec::new(),
            request_timeout: None,
            setup: Vec::new(),
            report_path: None,
        }
    }
}

impl Settings {
    fn apply(&mut self, option: SuiteOption) -> Result<()> {
        log::debug!("Applying option {:?}", option);
        match option {
            SuiteOption::ApiHost { host, port } => {
                if host.trim().is_empty() {
                    return Err(SuiteError::Configuration("API host must not be empty".to_string()));
                }
                self.host = host;
                self.port = port;
            }
            SuiteOption::ApiScheme(scheme) => {
                let scheme = scheme.to_ascii_lowercase();
                if scheme != "http" && scheme != "https" {
                    return Err(SuiteError::Configuration(format!("unsupported scheme '{}'", scheme)));
                }
                self.scheme = scheme;
            }
            SuiteOption::HttpDo(doer) => self.http = Some(doer),
            SuiteOption::Oas(document) => {
                let text = document.map_err(SuiteError::Oas)?;
                self.oas = Some(OasTable::parse(&text)?);
            }
            SuiteOption::OasTable(table) => self.oas = Some(table),
            SuiteOption::Repeats { count, stop_on_failure } => {
                if count == 0 {
                    return Err(SuiteError::Configuration("repeat count must be at least 1".to_string()));
                }
                self.repeats = count;
                self.stop_on_failure = stop_on_failure;
            }
            SuiteOption::Logging { stdout, stderr } => {
                self.stdout = stdout;
                self.stderr = stderr;
            }
            SuiteOption::Var(name, value) => {
                self.vars.insert(name, value);
            }
            SuiteOption::TraceTimings => self.trace_timings = true,
            SuiteOption::Testing(harness) => self.harness = Some(harness),
            SuiteOption::ReportCoverage(callback) => self.coverage_callback = Some(callback),
            SuiteOption::DisableReaperShutdowns => self.reaper_shutdowns_disabled = true,
            SuiteOption::Image(image) => self.images.push(image),
            SuiteOption::RequestTimeout(timeout) => self.request_timeout = Some(timeout),
            SuiteOption::Setup(hook) => self.setup.push(hook),
            SuiteOption::ReportPath(path) => self.report_path = Some(path),
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Declared endpoint trees, not yet initialized
pub struct Suite {
    endpoints: Vec<Endpoint>,
}

impl Suite {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
        }
    }

    /// Apply options, start supporting images and validate the plan against
    /// them. Nothing runs when this fails.
    pub async fn init(self, options: impl IntoIterator<Item = SuiteOption>) -> Result<InitializedSuite> {
        let plan = Plan::flatten(&self.endpoints)?;

        let mut settings = Settings::default();
        for option in options {
            settings.apply(option)?;
        }

        let http: Arc<dyn HttpDoer> = match settings.http.take() {
            Some(doer) => doer,
            None => Arc::new(ReqwestDoer::new(
                settings.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )?),
        };

        let mut declared = std::mem::take(&mut settings.images);
        declared.sort_by_key(|image| image.stage());
        let mut suite_init = SuiteInit::new(settings.base_url(), settings.reaper_shutdowns_disabled);
        let images = start_images(declared, &mut suite_init).await?;
        let (db, arg_style, base_url) = suite_init.into_parts();

        if let Err(err) = validate(&plan, &settings.setup, &images, db.is_some()) {
            shutdown_images(&images).await;
            return Err(err.into());
        }

        let cancellation = Cancellation::new();
        let mut ctx = Context::new(http, base_url);
        ctx.set_images(images);
        ctx.set_db(db, arg_style);
        ctx.set_request_timeout(settings.request_timeout);
        ctx.set_coverage(settings.oas.take().map(CoverageCollector::new));
        ctx.set_sinks(settings.stdout.clone(), settings.stderr.clone());
        ctx.set_cancellation(cancellation.clone());

        let harness = match settings.harness.take() {
            Some(harness) => harness,
            None => Box::new(StandaloneHarness::new(settings.stdout.clone(), settings.stderr.clone())),
        };

        log::info!(
            "Suite initialized: {} method(s), {} image(s), base URL {}",
            plan.len(),
            ctx.images().len(),
            ctx.base_url()
        );

        Ok(InitializedSuite {
            plan,
            ctx,
            harness,
            settings,
            cancellation,
        })
    }
}

/// Init images in stage order. On failure the ones already started are shut
/// down in reverse before the error is returned.
async fn start_images(
    declared: Vec<Arc<dyn SupportingImage>>,
    suite_init: &mut SuiteInit,
) -> Result<ImageRegistry> {
    let mut registry = ImageRegistry::new();
    for image in declared {
        log::info!("Initializing image {} ({:?})", image.name(), image.stage());
        if let Err(err) = image.init(suite_init).await {
            log::error!("Image {} failed to initialize: {}", image.name(), err);
            shutdown_images(&registry).await;
            return Err(err.into());
        }
        let added = suite_init.take_added();
        for image in std::iter::once(image).chain(added) {
            if let Err(err) = registry.insert(image) {
                shutdown_images(&registry).await;
                return Err(err.into());
            }
        }
    }
    Ok(registry)
}

async fn shutdown_images(images: &ImageRegistry) {
    for image in images.reversed() {
        match image.shutdown().await {
            Ok(()) => log::debug!("Image {} shut down", image.name()),
            Err(err) => log::warn!("Image {} shutdown failed: {}", image.name(), err),
        }
    }
}

fn check_image(
    images: &ImageRegistry,
    name: &str,
    capability: Capability,
    frame: &Frame,
) -> std::result::Result<(), DeclarationError> {
    let image = images.get(name).ok_or_else(|| DeclarationError::UnknownImage {
        image: name.to_string(),
        frame: frame.to_string(),
    })?;
    if !capability.provided_by(image.as_ref()) {
        return Err(DeclarationError::MissingCapability {
            image: name.to_string(),
            capability: capability.to_string(),
            frame: frame.to_string(),
        });
    }
    Ok(())
}

/// Every image a hook or resolvable names must exist and provide the verb
/// it is used for
fn validate(
    plan: &Plan,
    setup: &[Hook],
    images: &ImageRegistry,
    has_db: bool,
) -> std::result::Result<(), DeclarationError> {
    let hooks = setup.iter().chain(plan.units().iter().flat_map(|unit| unit.hooks()));
    for hook in hooks {
        for (name, capability) in hook.image_requirements() {
            check_image(images, &name, capability, &hook.frame)?;
        }
        if hook.needs_db() && !has_db {
            return Err(DeclarationError::NoDatabase {
                frame: hook.frame.to_string(),
            });
        }
    }

    for unit in plan.units() {
        for resolvable in unit.resolvables() {
            for query in resolvable.image_queries() {
                if let Some((name, capability)) = query.required_image() {
                    check_image(images, &name, capability, &unit.frame)?;
                }
                if matches!(query, ImageQuery::SqlQuery { .. }) && !has_db {
                    return Err(DeclarationError::NoDatabase {
                        frame: unit.frame.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Suite ready to run
pub struct InitializedSuite {
    plan: Plan,
    ctx: Context,
    harness: Box<dyn Harness>,
    settings: Settings,
    cancellation: Cancellation,
}

impl InitializedSuite {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Handle that stops the run cooperatively from another task
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Run and fail with `SuiteError::Failed` when anything was recorded
    pub async fn run(self) -> Result<SuiteReport> {
        let report = self.run_report().await;
        let failures = report.failure_count();
        if failures > 0 {
            return Err(SuiteError::Failed {
                failures,
                report: Box::new(report),
            });
        }
        if report.cancelled {
            return Err(SuiteError::Cancelled);
        }
        Ok(report)
    }

    /// Standalone entry point: run, print the verdict and exit the process
    pub async fn run_main(self) {
        let stdout = self.settings.stdout.clone();
        let stderr = self.settings.stderr.clone();
        let report = self.run_report().await;
        let summary = report.summary();
        let line = format!(
            "{}\t{} passed, {} failed, {} error(s), {} skipped ({:.3}s)",
            if report.passed() { "ok" } else { "FAIL" },
            summary.passed,
            summary.failed,
            summary.errors,
            summary.skipped,
            report.duration().as_secs_f64()
        );
        if report.passed() {
            stdout.write_line(&line);
        } else {
            stderr.write_line(&line);
        }
        std::process::exit(report.exit_code())
    }

    /// Run every repeat and return what was observed, failures included
    pub async fn run_report(mut self) -> SuiteReport {
        let mut report = SuiteReport::new();
        let initial_vars = self.settings.vars.clone();
        log::info!(
            "Running {} method(s), {} repeat(s)",
            self.plan.len(),
            self.settings.repeats
        );

        for repeat in 0..self.settings.repeats {
            if self.cancellation.is_cancelled() {
                report.cancelled = true;
                break;
            }
            log::debug!("Starting repeat {}", repeat + 1);
            let failures_before = report.failure_count();

            self.ctx.reset_vars(&initial_vars);
            self.ctx.clear_last_response();
            self.ctx.clear_json_cache();

            if !self.run_setup(&mut report).await {
                report.repeats_run += 1;
                break;
            }

            let mut nodes = NodeStack::new();
            for unit in self.plan.units() {
                let node = harness_path(self.settings.repeats, repeat, &unit.name_path);
                nodes.enter(self.harness.as_mut(), &node);

                if self.cancellation.is_cancelled() {
                    report.cancelled = true;
                    self.harness.skip(&node, "suite cancelled");
                    report.methods.push(skipped_report(unit, repeat));
                    continue;
                }
                if self.harness.is_stopped(&node) {
                    self.harness.skip(&node, "stopped by an earlier fatal failure");
                    report.methods.push(skipped_report(unit, repeat));
                    continue;
                }

                let method = run_unit(&mut self.ctx, unit, repeat, self.settings.trace_timings).await;
                for failure in &method.failures {
                    if fatal(failure) {
                        self.harness.fatal(&node, &failure.frame, &failure.message);
                    } else {
                        self.harness.error(&node, &failure.frame, &failure.message);
                    }
                }
                report.methods.push(method);
            }
            nodes.close_all(self.harness.as_mut());
            report.repeats_run += 1;

            if self.settings.stop_on_failure && report.failure_count() > failures_before {
                log::info!("Stopping after repeat {}: failures recorded", repeat + 1);
                break;
            }
        }

        if self.cancellation.is_cancelled() {
            report.cancelled = true;
        }
        self.finish(&mut report).await;
        report
    }

    /// Runs setup hooks; false when one failed and the run must stop
    async fn run_setup(&mut self, report: &mut SuiteReport) -> bool {
        for hook in &self.settings.setup {
            if let Err(err) = hook.run(&mut self.ctx).await {
                log::error!("Setup hook {} failed: {}", hook.action, err);
                let path = vec!["setup".to_string()];
                let message = err.to_string();
                self.harness.begin(&path);
                self.harness.fatal(&path, &hook.frame, &message);
                self.harness.end(&path);
                report.setup_failures.push(FailureRecord {
                    kind: FailureKind::Hook,
                    phase: MethodPhase::Before,
                    message,
                    frame: hook.frame.clone(),
                });
                if matches!(err, HookError::Cancelled) {
                    report.cancelled = true;
                }
                return false;
            }
        }
        true
    }

    async fn finish(&mut self, report: &mut SuiteReport) {
        report.timings = self.ctx.timings().stats(false);
        if self.settings.trace_timings {
            let stats = report.timings;
            let line = format!(
                "timings: count={} mean={:?} stddev={:?} min={:?} max={:?} p50={:?} p90={:?} p99={:?}",
                stats.count, stats.mean, stats.stddev, stats.min, stats.max, stats.p50, stats.p90, stats.p99
            );
            log::info!("{}", line);
            self.ctx.stdout().write_line(&line);
        }

        if let Some(coverage) = self.ctx.coverage() {
            let coverage = coverage.report();
            if let Some(callback) = &self.settings.coverage_callback {
                callback(&coverage);
            }
            report.coverage = Some(coverage);
        }

        self.ctx.listeners_mut().stop_all().await;
        shutdown_images(self.ctx.images()).await;

        report.finished_at = chrono::Utc::now();
        if let Some(path) = &self.settings.report_path {
            if let Err(err) = report.write_json(path) {
                log::error!("Failed to write report to {}: {}", path.display(), err);
            }
        }
        log::info!(
            "Suite finished: {} method run(s), {} failure(s)",
            report.methods.len(),
            report.failure_count()
        );
    }
}

/// Harness node path of a unit. With more than one repeat every repeat
/// gets its own root node, so a node stopped in one repeat stays live in
/// the next.
fn harness_path(repeats: usize, repeat: usize, name_path: &[String]) -> Vec<String> {
    if repeats <= 1 {
        return name_path.to_vec();
    }
    let mut path = Vec::with_capacity(name_path.len() + 1);
    path.push(format!("repeat#{}", repeat + 1));
    path.extend(name_path.iter().cloned());
    path
}

/// Requirement, transport and before-hook failures stop the method's node
fn fatal(failure: &FailureRecord) -> bool {
    match failure.kind {
        FailureKind::Requirement | FailureKind::Transport => true,
        FailureKind::Hook | FailureKind::Resolution => failure.phase != MethodPhase::After,
        FailureKind::Assertion => false,
    }
}

fn skipped_report(unit: &ExecutionUnit, repeat: usize) -> MethodReport {
    MethodReport {
        repeat,
        index: unit.index,
        name: node_name(&unit.name_path),
        path: unit.path.clone(),
        verb: unit.verb,
        status: None,
        duration: None,
        outcome: MethodOutcome::Skipped,
        phases: vec![MethodPhase::Pending],
        failures: Vec::new(),
        frame: unit.frame.clone(),
    }
}

/// One method: before hooks, the call, expectations, after hooks
async fn run_unit(ctx: &mut Context, unit: &ExecutionUnit, repeat: usize, trace_timings: bool) -> MethodReport {
    let mut phases = vec![MethodPhase::Pending];
    let mut failures = Vec::new();
    let mut status = None;
    let mut duration = None;
    ctx.clear_last_response();

    phases.push(MethodPhase::Before);
    let mut proceed = true;
    for hook in &unit.before {
        if let Err(err) = hook.run(ctx).await {
            failures.push(FailureRecord {
                kind: FailureKind::Hook,
                phase: MethodPhase::Before,
                message: err.to_string(),
                frame: hook.frame.clone(),
            });
            proceed = false;
            break;
        }
    }

    if proceed {
        phases.push(MethodPhase::Calling);
        match call(ctx, unit).await {
            Ok(elapsed) => {
                status = ctx.last_response().ok().map(|response| response.status);
                duration = Some(elapsed);
                if trace_timings {
                    log::info!("{} {} -> {:?} in {:?}", unit.verb, unit.path, status, elapsed);
                }
            }
            Err(failure) => {
                failures.push(failure);
                proceed = false;
            }
        }
    }

    if proceed {
        phases.push(MethodPhase::Asserting);
        for expectation in &unit.expectations {
            let evaluation = expectation.evaluate(ctx).await;
            if evaluation.ok {
                continue;
            }
            failures.push(FailureRecord {
                kind: if expectation.must {
                    FailureKind::Requirement
                } else {
                    FailureKind::Assertion
                },
                phase: MethodPhase::Asserting,
                message: evaluation.message,
                frame: expectation.frame.clone(),
            });
            if expectation.must {
                break;
            }
        }
    }

    phases.push(MethodPhase::After);
    for hook in &unit.after {
        if let Err(err) = hook.run(ctx).await {
            failures.push(FailureRecord {
                kind: FailureKind::Hook,
                phase: MethodPhase::After,
                message: err.to_string(),
                frame: hook.frame.clone(),
            });
        }
    }
    phases.push(MethodPhase::Done);

    let outcome = if failures.is_empty() {
        MethodOutcome::Pass
    } else if failures
        .iter()
        .all(|failure| matches!(failure.kind, FailureKind::Assertion | FailureKind::Requirement))
    {
        MethodOutcome::Fail
    } else {
        MethodOutcome::Error
    };
    log::debug!("{} {} finished: {:?}", unit.verb, unit.path, outcome);

    MethodReport {
        repeat,
        index: unit.index,
        name: node_name(&unit.name_path),
        path: unit.path.clone(),
        verb: unit.verb,
        status,
        duration,
        outcome,
        phases,
        failures,
        frame: unit.frame.clone(),
    }
}

/// Build and send the request, recording duration, coverage and the
/// response. A failed build or transport error becomes the method's failure.
async fn call(ctx: &mut Context, unit: &ExecutionUnit) -> std::result::Result<Duration, FailureRecord> {
    let failure = |kind: FailureKind, message: String| FailureRecord {
        kind,
        phase: MethodPhase::Calling,
        message,
        frame: unit.frame.clone(),
    };

    let request = build_request(unit, ctx).await.map_err(|err| match err {
        SuiteError::Resolution(err) => failure(FailureKind::Resolution, err.to_string()),
        other => failure(FailureKind::Transport, other.to_string()),
    })?;
    log::debug!("{} {}", request.method, request.url);

    let http = ctx.http();
    let cancellation = ctx.cancellation().clone();
    let started = Instant::now();
    let result = tokio::select! {
        result = http.do_request(request) => result,
        _ = cancellation.cancelled() => Err(TransportError::Cancelled),
    };
    let elapsed = started.elapsed();

    match result {
        Ok(response) => {
            let duration = response.duration.unwrap_or(elapsed);
            ctx.timings_mut().record(duration);
            if let Some(coverage) = ctx.coverage_mut() {
                coverage.record(&unit.path, unit.verb, response.status);
            }
            ctx.set_last_response(response, duration);
            Ok(duration)
        }
        Err(err) => {
            log::warn!("{} {} failed: {}", unit.verb, unit.path, err);
            ctx.timings_mut().record(Duration::ZERO);
            Err(failure(FailureKind::Transport, err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{endpoint, Method};
    use crate::error::ImageError;
    use crate::harness::CaptureBuffer;
    use crate::hooks::{self, When};
    use crate::http::{HttpRequest, HttpResponse};
    use crate::images::{InMemoryBroker, Stage};
    use crate::options;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedDoer(u16);

    #[async_trait]
    impl HttpDoer for FixedDoer {
        async fn do_request(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(self.0).with_duration(Duration::from_millis(5)))
        }
    }

    struct TrackedImage {
        name: &'static str,
        stage: Stage,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SupportingImage for TrackedImage {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> Stage {
            self.stage
        }

        async fn init(&self, _init: &mut SuiteInit) -> std::result::Result<(), ImageError> {
            self.log.lock().push(format!("init {}", self.name));
            if self.fail {
                return Err(ImageError::InitializationFailed(self.name.to_string()));
            }
            Ok(())
        }

        async fn shutdown(&self) -> std::result::Result<(), ImageError> {
            self.log.lock().push(format!("shutdown {}", self.name));
            Ok(())
        }
    }

    fn tracked(name: &'static str, stage: Stage, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> SuiteOption {
        options::image(TrackedImage {
            name,
            stage,
            fail,
            log: log.clone(),
        })
    }

    fn quiet() -> SuiteOption {
        options::logging_sinks(Sink::discard(), Sink::discard())
    }

    #[tokio::test]
    async fn test_images_start_by_stage_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let suite = Suite::new(vec![endpoint("/", "", vec![Method::get("").assert_ok()])])
            .init(vec![
                options::http_do(FixedDoer(200)),
                quiet(),
                tracked("api", Stage::Primary, false, &log),
                tracked("db", Stage::Supporting, false, &log),
            ])
            .await
            .unwrap();
        let report = suite.run_report().await;
        assert!(report.passed());
        assert_eq!(
            *log.lock(),
            vec!["init db", "init api", "shutdown api", "shutdown db"]
        );
    }

    #[tokio::test]
    async fn test_failed_image_init_shuts_down_started_images() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = Suite::new(vec![])
            .init(vec![
                options::http_do(FixedDoer(200)),
                tracked("first", Stage::Supporting, false, &log),
                tracked("second", Stage::Supporting, true, &log),
            ])
            .await;
        assert!(matches!(result, Err(SuiteError::Image(_))));
        assert_eq!(*log.lock(), vec!["init first", "init second", "shutdown first"]);
    }

    #[tokio::test]
    async fn test_unknown_image_is_a_declaration_error() {
        let method = Method::post("").perform(hooks::send_message(When::Before, "jobs", "{}"));
        let result = Suite::new(vec![endpoint("/jobs", "", vec![method])])
            .init(vec![options::http_do(FixedDoer(200))])
            .await;
        match result {
            Err(SuiteError::Declaration(DeclarationError::UnknownImage { image, .. })) => {
                assert_eq!(image, "broker")
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }

        let method = Method::post("").perform(hooks::send_message(When::Before, "jobs", "{}"));
        let ok = Suite::new(vec![endpoint("/jobs", "", vec![method])])
            .init(vec![options::http_do(FixedDoer(200)), options::image(InMemoryBroker::new())])
            .await;
        assert!(ok.is_ok());
    }

    #[test]
    fn test_harness_path_is_scoped_by_repeat() {
        let name_path = vec!["/api".to_string(), "GET".to_string()];
        assert_eq!(harness_path(1, 0, &name_path), name_path);
        assert_eq!(harness_path(3, 1, &name_path), vec!["repeat#2", "/api", "GET"]);
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let bad_scheme = Suite::new(vec![]).init(vec![options::api_scheme("ftp")]).await;
        assert!(matches!(bad_scheme, Err(SuiteError::Configuration(_))));

        let zero_repeats = Suite::new(vec![]).init(vec![options::repeats(0, false)]).await;
        assert!(matches!(zero_repeats, Err(SuiteError::Configuration(_))));

        let bad_oas = Suite::new(vec![]).init(vec![options::oas("not: [valid".as_bytes())]).await;
        assert!(matches!(bad_oas, Err(SuiteError::Oas(_))));
    }

    #[tokio::test]
    async fn test_require_failure_skips_remaining_expectations() {
        let method = Method::get("").require_created().assert_ok();
        let suite = Suite::new(vec![endpoint("/items", "", vec![method])])
            .init(vec![options::http_do(FixedDoer(200)), quiet()])
            .await
            .unwrap();
        let report = suite.run_report().await;
        let method = &report.methods[0];
        assert_eq!(method.outcome, MethodOutcome::Fail);
        assert_eq!(method.failures.len(), 1);
        assert_eq!(method.failures[0].kind, FailureKind::Requirement);
        assert_eq!(
            method.phases,
            vec![
                MethodPhase::Pending,
                MethodPhase::Before,
                MethodPhase::Calling,
                MethodPhase::Asserting,
                MethodPhase::After,
                MethodPhase::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_standalone_output_and_run_error() {
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        let suite = Suite::new(vec![endpoint(
            "/items",
            "",
            vec![Method::get("").assert_ok(), Method::delete("").assert_not_found()],
        )])
        .init(vec![options::http_do(FixedDoer(200)), options::logging_sinks(out.sink(), err.sink())])
        .await
        .unwrap();

        let result = suite.run().await;
        let failures = match result {
            Err(SuiteError::Failed { failures, .. }) => failures,
            other => panic!("expected failure, got {:?}", other.map(|r| r.methods.len())),
        };
        assert_eq!(failures, 1);
        assert!(out.contents().contains("--- PASS: /items/GET"));
        assert!(err.contents().contains("--- FAIL: /items/DELETE"));
        assert!(err.contents().contains("AssertNotFound"));
    }

    #[tokio::test]
    async fn test_cancelled_suite_skips_methods() {
        let suite = Suite::new(vec![endpoint("/", "", vec![Method::get("").assert_ok()])])
            .init(vec![options::http_do(FixedDoer(200)), quiet(), options::repeats(2, false)])
            .await
            .unwrap();
        suite.cancellation().cancel();
        let report = suite.run_report().await;
        assert!(report.cancelled);
        assert!(report.methods.is_empty());
        assert_eq!(report.exit_code(), 1);
    }
}
