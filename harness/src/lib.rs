//! Execution engine for `!theo` annotated source files
//!
//! [`discovery`] finds and parses annotation blocks, the [`scheduler`] hands
//! each specification to an [`executor::Executor`] running on a
//! [`process::ProcessRunner`], and [`reporter`] renders the aggregated
//! [`report::RunSummary`].

pub mod config;
pub mod discovery;
pub mod executor;
pub mod memcheck;
pub mod process;
pub mod report;
pub mod reporter;
pub mod scheduler;

pub use config::{ConfigError, ConfigResult, HarnessConfig, MemcheckConfig, OutputFormat};
pub use discovery::{discover, discover_path, Discovery};
pub use executor::{classify, Executor, ExecutorConfig, SpecState};
pub use memcheck::{parse_valgrind_xml, MemcheckReport, MemcheckRunner, MemoryDefect};
pub use process::{ProcessOutput, ProcessRunner, RunRequest, RunnerError, RunnerResult, SystemRunner};
pub use report::{
    Aggregator, Diagnostic, DiagnosticKind, ErrorReason, ExecutionResult, FailReason, Outcome,
    OutcomeClass, RunReport, RunSummary, SetupOutcome, Tally,
};
pub use reporter::{
    reporter_for, Event, EventSink, EventsReporter, JsonReporter, NiceReporter, Reporter,
};
pub use scheduler::{run_reported, Scheduler};

use std::sync::Arc;

/// The runner used by the CLI: real processes, with memory checking layered on top.
pub fn default_runner(config: &HarnessConfig) -> Arc<dyn ProcessRunner> {
    Arc::new(MemcheckRunner::new(SystemRunner::new(), config.memcheck.clone()))
}
