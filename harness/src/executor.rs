//! Runs one specification: setup, then each test in declaration order

use crate::config::HarnessConfig;
use crate::process::{ProcessOutput, ProcessRunner, RunRequest, RunnerError};
use crate::report::{ErrorReason, ExecutionResult, FailReason, Outcome, RunReport, SetupOutcome};
use crate::reporter::{Event, EventSink};
use annotation::{Specification, TestCase};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a specification inside the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecState {
    Pending,
    SettingUp,
    SetupFailed,
    Running,
    Completed,
}

impl SpecState {
    pub fn can_transition_to(self, next: SpecState) -> bool {
        use SpecState::*;
        matches!(
            (self, next),
            (Pending, SettingUp)
                | (Pending, Running)
                | (Pending, SetupFailed)
                | (SettingUp, SetupFailed)
                | (SettingUp, Running)
                | (Running, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SpecState::SetupFailed | SpecState::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub test_timeout: Duration,
    pub setup_timeout: Duration,
    /// When false, memory checking is off regardless of annotations
    pub memory_check: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for ExecutorConfig {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            test_timeout: config.test_timeout(),
            setup_timeout: config.setup_timeout(),
            memory_check: config.memory_check,
        }
    }
}

/// Tracks one specification's state and announces every transition
struct SpecRun<'a> {
    label: String,
    state: SpecState,
    events: &'a EventSink,
}

impl<'a> SpecRun<'a> {
    fn new(spec: &Specification, events: &'a EventSink) -> Self {
        Self {
            label: spec.label(),
            state: SpecState::Pending,
            events,
        }
    }

    fn transition(&mut self, next: SpecState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
        self.events.emit(Event::StateChanged {
            spec: self.label.clone(),
            state: next,
        });
    }
}

pub struct Executor {
    runner: Arc<dyn ProcessRunner>,
    config: ExecutorConfig,
    events: EventSink,
}

impl Executor {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Execute `spec` and return one result per declared test.
    ///
    /// Never fails: setup failures, missing tools and cancellation are all
    /// recorded as `Error` outcomes on the affected tests.
    pub async fn run(&self, spec: Arc<Specification>, cancel: &CancellationToken) -> RunReport {
        let mut run = SpecRun::new(&spec, &self.events);
        self.events.emit(Event::SpecStarted {
            spec: run.label.clone(),
            tests: spec.tests.len(),
        });
        info!("Executing {} ({} tests)", run.label, spec.tests.len());

        let memory_check = self.config.memory_check && spec.configuration.memory_check;
        let early_exit = if cancel.is_cancelled() {
            Some(ErrorReason::Cancelled)
        } else if memory_check {
            match self.runner.memory_check_available() {
                Ok(()) => None,
                Err(RunnerError::ToolUnavailable { tool }) => {
                    warn!("{}: memory checker '{}' is not available", run.label, tool);
                    Some(ErrorReason::ToolUnavailable { tool })
                }
                Err(e) => Some(ErrorReason::Runner {
                    message: e.to_string(),
                }),
            }
        } else {
            None
        };

        if let Some(reason) = early_exit {
            run.transition(SpecState::Running);
            let results = spec
                .tests
                .iter()
                .map(|test| self.finish_test(&run, ExecutionResult::not_run(test, reason.clone())))
                .collect();
            run.transition(SpecState::Completed);
            return self.finish(spec, SetupOutcome::Skipped, results);
        }

        let setup = if spec.configuration.has_setup() {
            run.transition(SpecState::SettingUp);
            match self.run_commands(&spec, &spec.configuration.setup, &[], cancel).await {
                Ok(()) => SetupOutcome::Success,
                Err(reason) => {
                    warn!("{}: setup failed: {}", run.label, reason);
                    run.transition(SpecState::SetupFailed);
                    let error = if cancel.is_cancelled() {
                        ErrorReason::Cancelled
                    } else {
                        ErrorReason::SetupFailed
                    };
                    let setup = SetupOutcome::Failed { reason };
                    self.events.emit(Event::SetupFinished {
                        spec: run.label.clone(),
                        setup: setup.clone(),
                    });
                    let results = spec
                        .tests
                        .iter()
                        .map(|test| self.finish_test(&run, ExecutionResult::not_run(test, error.clone())))
                        .collect();
                    return self.finish(spec, setup, results);
                }
            }
        } else {
            SetupOutcome::Skipped
        };
        self.events.emit(Event::SetupFinished {
            spec: run.label.clone(),
            setup: setup.clone(),
        });

        run.transition(SpecState::Running);
        let mut results = Vec::with_capacity(spec.tests.len());
        for test in &spec.tests {
            let result = if cancel.is_cancelled() {
                ExecutionResult::not_run(test, ErrorReason::Cancelled)
            } else {
                self.events.emit(Event::TestStarted {
                    spec: run.label.clone(),
                    test: test.name.clone(),
                });
                self.run_test(&spec, test, memory_check, cancel).await
            };
            results.push(self.finish_test(&run, result));
        }
        run.transition(SpecState::Completed);

        self.finish(spec, setup, results)
    }

    fn finish_test(&self, run: &SpecRun<'_>, result: ExecutionResult) -> ExecutionResult {
        debug!(
            "{}: {} -> {}",
            run.label,
            result.test.name,
            result.outcome.class().label()
        );
        self.events.emit(Event::TestFinished {
            spec: run.label.clone(),
            result: result.clone(),
        });
        result
    }

    fn finish(
        &self,
        specification: Arc<Specification>,
        setup: SetupOutcome,
        results: Vec<ExecutionResult>,
    ) -> RunReport {
        let report = RunReport {
            specification,
            setup,
            results,
        };
        let tally = report.tally();
        info!(
            "Finished {}: {} passed of {}",
            report.label(),
            tally.passed,
            tally.total
        );
        self.events.emit(Event::SpecFinished {
            spec: report.label(),
            tally,
        });
        report
    }

    async fn run_test(
        &self,
        spec: &Specification,
        test: &TestCase,
        memory_check: bool,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let cwd = working_dir(spec);

        remove_volatile(spec, cwd.as_deref()).await;

        if !test.setup.is_empty() {
            if let Err(reason) = self.run_commands(spec, &test.setup, &test.environment, cancel).await {
                warn!("{}: setup of {} failed: {}", spec.label(), test.name, reason);
                let error = if cancel.is_cancelled() {
                    ErrorReason::Cancelled
                } else {
                    ErrorReason::SetupFailed
                };
                remove_volatile(spec, cwd.as_deref()).await;
                return ExecutionResult {
                    stderr: reason,
                    started_at,
                    duration_ms: clock.elapsed().as_millis() as u64,
                    ..ExecutionResult::not_run(test, error)
                };
            }
        }

        let timeout = test
            .timeout_secs
            .or(spec.configuration.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.config.test_timeout);

        let output = match self.request(spec, &test.run, timeout, &test.environment, cwd.as_deref()) {
            Ok(request) => {
                let request = request
                    .with_stdin(test.input.clone())
                    .with_memory_check(memory_check)
                    .with_label(test.name.clone());
                debug!("{}: running {} as `{}`", spec.label(), test.name, request.display());
                self.runner.run(&request, cancel).await
            }
            Err(e) => Err(e),
        };

        remove_volatile(spec, cwd.as_deref()).await;

        let mut result = ExecutionResult {
            started_at,
            ..ExecutionResult::not_run(test, ErrorReason::Cancelled)
        };
        match output {
            Ok(output) => {
                result.outcome = classify(test, &output, timeout);
                result.actual_output = output.stdout_text();
                result.stderr = output.stderr_text();
                result.exit_code = output.exit_code;
                result.memcheck = output.memcheck;
            }
            Err(RunnerError::ToolUnavailable { tool }) => {
                result.outcome = Outcome::Error(ErrorReason::ToolUnavailable { tool });
            }
            Err(e) => {
                result.outcome = Outcome::Error(ErrorReason::Runner {
                    message: e.to_string(),
                });
            }
        }
        result.duration_ms = clock.elapsed().as_millis() as u64;
        result
    }

    fn request(
        &self,
        spec: &Specification,
        command: &str,
        timeout: Duration,
        extra_env: &[(String, String)],
        cwd: Option<&Path>,
    ) -> Result<RunRequest, RunnerError> {
        let mut request = RunRequest::from_command(command, spec.configuration.shell, timeout)?
            .with_env(spec.configuration.environment.iter().cloned())
            .with_env(extra_env.iter().cloned());
        if let Some(cwd) = cwd {
            request = request.with_cwd(cwd);
        }
        Ok(request)
    }

    /// Run setup commands in order, stopping at the first that does not succeed.
    async fn run_commands(
        &self,
        spec: &Specification,
        commands: &[String],
        extra_env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let cwd = working_dir(spec);
        for command in commands {
            if cancel.is_cancelled() {
                return Err(format!("`{}` cancelled before it started", command));
            }
            let request = self
                .request(spec, command, self.config.setup_timeout, extra_env, cwd.as_deref())
                .map_err(|e| format!("`{}`: {}", command, e))?;
            debug!("{}: setup `{}`", spec.label(), command);
            let output = self
                .runner
                .run(&request, cancel)
                .await
                .map_err(|e| format!("`{}`: {}", command, e))?;
            if let Some(reason) = setup_failure(command, &output, self.config.setup_timeout) {
                return Err(reason);
            }
        }
        Ok(())
    }
}

/// Decide the outcome of a test whose command ran.
pub fn classify(test: &TestCase, output: &ProcessOutput, timeout: Duration) -> Outcome {
    if output.cancelled {
        return Outcome::Error(ErrorReason::Cancelled);
    }
    if output.timed_out {
        return Outcome::Error(ErrorReason::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        });
    }

    let actual = output.stdout_text();
    if !test.output_matches(&actual) {
        return Outcome::Fail(FailReason::Output {
            expected: test.expected_output.clone(),
            actual,
        });
    }

    if output.exit_code != Some(test.expected_exit) {
        return Outcome::Fail(FailReason::ExitCode {
            expected: test.expected_exit,
            actual: output.exit_code,
        });
    }

    match &output.memcheck {
        Some(report) if !report.is_clean() => Outcome::MemoryError(report.clone()),
        _ => Outcome::Pass,
    }
}

fn setup_failure(command: &str, output: &ProcessOutput, timeout: Duration) -> Option<String> {
    if output.cancelled {
        return Some(format!("`{}` was cancelled", command));
    }
    if output.timed_out {
        return Some(format!("`{}` timed out after {}s", command, timeout.as_secs()));
    }
    if output.success() {
        return None;
    }
    let status = match output.exit_code {
        Some(code) => format!("exited with code {}", code),
        None => "was killed by a signal".to_string(),
    };
    let stderr = output.stderr_text();
    match stderr.trim().lines().last() {
        Some(last) => Some(format!("`{}` {}: {}", command, status, last)),
        None => Some(format!("`{}` {}", command, status)),
    }
}

/// Commands run next to the file that declared them.
fn working_dir(spec: &Specification) -> Option<PathBuf> {
    spec.source_path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

async fn remove_volatile(spec: &Specification, cwd: Option<&Path>) {
    for entry in &spec.configuration.volatile {
        let path = match cwd {
            Some(cwd) => cwd.join(entry),
            None => PathBuf::from(entry),
        };
        let removed = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(_) => continue,
        };
        if let Err(e) = removed {
            warn!("Failed to remove volatile path {}: {}", path.display(), e);
        }
    }
}
