//! Test outcomes, per-specification reports and their aggregation

use crate::memcheck::MemcheckReport;
use annotation::{ParseError, ScanError, Specification, TestCase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Why a test that ran did not pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailReason {
    /// Normalized stdout differs from the expected output
    Output { expected: String, actual: String },
    /// Output matched but the exit code did not
    ExitCode { expected: i32, actual: Option<i32> },
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Output { expected, actual } => write!(
                f,
                "Expected output {:?} but found {:?}",
                annotation::normalize_output(expected),
                annotation::normalize_output(actual)
            ),
            FailReason::ExitCode {
                expected,
                actual: Some(actual),
            } => write!(f, "Expected exit code {} but found {}", expected, actual),
            FailReason::ExitCode {
                expected,
                actual: None,
            } => write!(f, "Expected exit code {} but the process was killed by a signal", expected),
        }
    }
}

/// Why a test could not produce a verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorReason {
    Timeout { timeout_ms: u64 },
    Cancelled,
    SetupFailed,
    ToolUnavailable { tool: String },
    Runner { message: String },
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::Timeout { timeout_ms } => {
                write!(f, "timeout of {:.1}s", *timeout_ms as f64 / 1000.0)
            }
            ErrorReason::Cancelled => write!(f, "cancelled"),
            ErrorReason::SetupFailed => write!(f, "setup failed"),
            ErrorReason::ToolUnavailable { tool } => {
                write!(f, "tool unavailable: memory checker '{}' not found", tool)
            }
            ErrorReason::Runner { message } => write!(f, "{}", message),
        }
    }
}

/// Verdict of a single test execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail(FailReason),
    Error(ErrorReason),
    MemoryError(MemcheckReport),
}

/// The four mutually exclusive outcome classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Pass,
    Fail,
    Error,
    MemoryError,
}

impl OutcomeClass {
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeClass::Pass => "PASS",
            OutcomeClass::Fail => "FAIL",
            OutcomeClass::Error => "ERROR",
            OutcomeClass::MemoryError => "MEMORY",
        }
    }
}

impl Outcome {
    pub fn class(&self) -> OutcomeClass {
        match self {
            Outcome::Pass => OutcomeClass::Pass,
            Outcome::Fail(_) => OutcomeClass::Fail,
            Outcome::Error(_) => OutcomeClass::Error,
            Outcome::MemoryError(_) => OutcomeClass::MemoryError,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    /// One-line explanation for non-passing outcomes.
    pub fn describe(&self) -> String {
        match self {
            Outcome::Pass => "passed".to_string(),
            Outcome::Fail(reason) => reason.to_string(),
            Outcome::Error(reason) => reason.to_string(),
            Outcome::MemoryError(report) => format!(
                "{} reported {} memory defect(s): {}",
                report.tool,
                report.defects.len(),
                report.summary()
            ),
        }
    }
}

/// The record of one test run; never modified once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub test: TestCase,
    pub outcome: Outcome,
    pub actual_output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    /// Present only when the command actually ran under the memory checker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memcheck: Option<MemcheckReport>,
}

impl ExecutionResult {
    /// A result for a test whose command never ran.
    pub fn not_run(test: &TestCase, reason: ErrorReason) -> Self {
        Self {
            test: test.clone(),
            outcome: Outcome::Error(reason),
            actual_output: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            started_at: Utc::now(),
            memcheck: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.test.name
    }
}

/// How the setup phase of a specification went
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SetupOutcome {
    Skipped,
    Success,
    Failed { reason: String },
}

impl SetupOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SetupOutcome::Failed { .. })
    }
}

/// Results of executing one specification, in declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub specification: Arc<Specification>,
    pub setup: SetupOutcome,
    pub results: Vec<ExecutionResult>,
}

impl RunReport {
    pub fn label(&self) -> String {
        self.specification.label()
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        tally.record(self);
        tally
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.outcome.is_pass())
    }

    pub fn is_success(&self) -> bool {
        !self.setup.is_failed() && self.results.iter().all(|r| r.outcome.is_pass())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The file could not be read
    Read,
    /// Block delimiters are broken or missing
    Scan,
    /// A block's payload is not a valid specification
    Parse,
}

/// A problem found before any test could run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub path: PathBuf,
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn read(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Read,
            path: path.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn scan(path: impl Into<PathBuf>, line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Scan,
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

impl From<ScanError> for Diagnostic {
    fn from(error: ScanError) -> Self {
        Self::scan(
            error.path(),
            Some(error.line()),
            "unterminated !theo block (no closing marker before end of file)",
        )
    }
}

impl From<ParseError> for Diagnostic {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::MalformedSpec { path, line, reason } => Self {
                kind: DiagnosticKind::Parse,
                path,
                line: Some(line),
                message: format!("malformed specification: {}", reason),
            },
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.path.display(), line, self.message),
            None => write!(f, "{}: {}", self.path.display(), self.message),
        }
    }
}

/// Outcome counts; an owned accumulator, merged rather than shared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub memory_errored: usize,
    pub total: usize,
    pub setup_failures: usize,
    pub diagnostics: usize,
}

impl Tally {
    pub fn record(&mut self, report: &RunReport) {
        if report.setup.is_failed() {
            self.setup_failures += 1;
        }
        for result in &report.results {
            self.record_outcome(&result.outcome);
        }
    }

    pub fn record_outcome(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome.class() {
            OutcomeClass::Pass => self.passed += 1,
            OutcomeClass::Fail => self.failed += 1,
            OutcomeClass::Error => self.errored += 1,
            OutcomeClass::MemoryError => self.memory_errored += 1,
        }
    }

    pub fn record_diagnostic(&mut self) {
        self.diagnostics += 1;
    }

    pub fn merge(&mut self, other: &Tally) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.memory_errored += other.memory_errored;
        self.total += other.total;
        self.setup_failures += other.setup_failures;
        self.diagnostics += other.diagnostics;
    }

    /// Tests that did not pass.
    pub fn unsuccessful(&self) -> usize {
        self.failed + self.errored + self.memory_errored
    }

    pub fn is_success(&self) -> bool {
        self.unsuccessful() == 0 && self.setup_failures == 0 && self.diagnostics == 0
    }

    /// 0 all clear, 1 test failures, 2 malformed input.
    pub fn exit_code(&self) -> u8 {
        if self.diagnostics > 0 {
            2
        } else if self.unsuccessful() > 0 || self.setup_failures > 0 {
            1
        } else {
            0
        }
    }
}

/// Everything a reporter needs at the end of a run, in discovery order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub reports: Vec<RunReport>,
    pub diagnostics: Vec<Diagnostic>,
    pub tally: Tally,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> u8 {
        self.tally.exit_code()
    }
}

/// Collects worker output; the only writer of the run's results
#[derive(Debug, Default)]
pub struct Aggregator {
    reports: Vec<(usize, RunReport)>,
    diagnostics: Vec<(usize, Diagnostic)>,
    tally: Tally,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a finished report; `index` is the specification's discovery order.
    pub fn add_report(&mut self, index: usize, report: RunReport) {
        self.tally.record(&report);
        self.reports.push((index, report));
    }

    pub fn add_diagnostic(&mut self, index: usize, diagnostic: Diagnostic) {
        self.tally.record_diagnostic();
        self.diagnostics.push((index, diagnostic));
    }

    pub fn finish(mut self, cancelled: bool) -> RunSummary {
        self.reports.sort_by_key(|(index, _)| *index);
        self.diagnostics.sort_by_key(|(index, _)| *index);
        RunSummary {
            reports: self.reports.into_iter().map(|(_, r)| r).collect(),
            diagnostics: self.diagnostics.into_iter().map(|(_, d)| d).collect(),
            tally: self.tally,
            cancelled,
        }
    }
}
