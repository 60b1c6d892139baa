//! Structured per-run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::coverage::CoverageReport;
use crate::error::Result;
use crate::frame::Frame;
use crate::http::HttpMethod;
use crate::timings::TimingStats;

/// Method lifecycle: `Pending -> Before -> Calling -> Asserting -> After -> Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodPhase {
    Pending,
    Before,
    Calling,
    Asserting,
    After,
    Done,
}

impl fmt::Display for MethodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodPhase::Pending => "PENDING",
            MethodPhase::Before => "BEFORE",
            MethodPhase::Calling => "CALLING",
            MethodPhase::Asserting => "ASSERTING",
            MethodPhase::After => "AFTER",
            MethodPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodOutcome {
    Pass,
    /// An expectation failed
    Fail,
    /// A hook, resolution or transport error
    Error,
    /// Not run because an ancestor was stopped or the suite was cancelled
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Assertion,
    Requirement,
    Resolution,
    Transport,
    Hook,
}

/// One recorded failure with the declaration site it points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub phase: MethodPhase,
    pub message: String,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodReport {
    /// Zero-based repeat the method ran in
    pub repeat: usize,
    pub index: usize,
    /// Hierarchical harness name, segments joined by `/`
    pub name: String,
    pub path: String,
    pub verb: HttpMethod,
    pub status: Option<u16>,
    pub duration: Option<Duration>,
    pub outcome: MethodOutcome,
    /// Phases entered, in order
    pub phases: Vec<MethodPhase>,
    pub failures: Vec<FailureRecord>,
    pub frame: Frame,
}

impl MethodReport {
    pub fn passed(&self) -> bool {
        self.outcome == MethodOutcome::Pass
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub failures: usize,
}

/// Everything observed during one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repeats_run: usize,
    pub cancelled: bool,
    /// Failures of suite-level setup hooks
    pub setup_failures: Vec<FailureRecord>,
    pub methods: Vec<MethodReport>,
    pub coverage: Option<CoverageReport>,
    pub timings: TimingStats,
}

impl SuiteReport {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            repeats_run: 0,
            cancelled: false,
            setup_failures: Vec::new(),
            methods: Vec::new(),
            coverage: None,
            timings: TimingStats::default(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.setup_failures
            .iter()
            .chain(self.methods.iter().flat_map(|method| method.failures.iter()))
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn passed(&self) -> bool {
        self.failure_count() == 0 && !self.cancelled
    }

    pub fn summary(&self) -> ReportSummary {
        let count = |outcome: MethodOutcome| self.methods.iter().filter(|m| m.outcome == outcome).count();
        ReportSummary {
            total: self.methods.len(),
            passed: count(MethodOutcome::Pass),
            failed: count(MethodOutcome::Fail),
            errors: count(MethodOutcome::Error),
            skipped: count(MethodOutcome::Skipped),
            failures: self.failure_count(),
        }
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        log::info!("Report written to {}", path.display());
        Ok(())
    }

    /// Process exit code for standalone runs
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}
