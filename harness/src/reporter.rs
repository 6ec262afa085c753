//! Lifecycle events and the renderers that turn them into output

use crate::config::OutputFormat;
use crate::executor::SpecState;
use crate::report::{Diagnostic, ExecutionResult, OutcomeClass, RunReport, RunSummary, SetupOutcome, Tally};
use colored::{Color, Colorize};
use serde::Serialize;
use std::io::{self, Write};
use tokio::sync::mpsc;

/// Something that happened during a run, in the order it happened
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Diagnostic {
        diagnostic: Diagnostic,
    },
    SpecStarted {
        spec: String,
        tests: usize,
    },
    StateChanged {
        spec: String,
        state: SpecState,
    },
    SetupFinished {
        spec: String,
        setup: SetupOutcome,
    },
    TestStarted {
        spec: String,
        test: String,
    },
    TestFinished {
        spec: String,
        result: ExecutionResult,
    },
    SpecFinished {
        spec: String,
        tally: Tally,
    },
    RunFinished {
        tally: Tally,
        cancelled: bool,
    },
}

/// Sending half of the event stream; a disabled sink drops everything
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            // The reporter may already be gone during shutdown.
            let _ = tx.send(event);
        }
    }
}

pub trait Reporter: Send {
    /// Called for every event as it arrives.
    fn on_event(&mut self, _event: &Event, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// Called once after the last event with the aggregated results.
    fn finish(&mut self, summary: &RunSummary, out: &mut dyn Write) -> io::Result<()>;
}

pub fn reporter_for(format: OutputFormat, color: bool) -> Box<dyn Reporter> {
    match format {
        OutputFormat::Nice => Box::new(NiceReporter::new(color)),
        OutputFormat::Events => Box::new(EventsReporter),
        OutputFormat::Json => Box::new(JsonReporter),
    }
}

/// Feed every event from `rx` to `reporter` until all senders are dropped.
pub async fn drive<W: Write + Send>(
    mut reporter: Box<dyn Reporter>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    mut out: W,
) -> io::Result<(Box<dyn Reporter>, W)> {
    while let Some(event) = rx.recv().await {
        reporter.on_event(&event, &mut out)?;
    }
    out.flush()?;
    Ok((reporter, out))
}

/// Human readable tree, printed once the run is over
#[derive(Debug, Clone)]
pub struct NiceReporter {
    color: bool,
}

impl NiceReporter {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.color(color).bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn status(&self, class: OutcomeClass) -> String {
        let color = match class {
            OutcomeClass::Pass => Color::Green,
            OutcomeClass::Fail => Color::Red,
            OutcomeClass::Error => Color::Yellow,
            OutcomeClass::MemoryError => Color::Magenta,
        };
        self.paint(class.label(), color)
    }

    fn write_report(&self, report: &RunReport, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "┌ Starting {}", report.label())?;
        if let SetupOutcome::Failed { reason } = &report.setup {
            writeln!(out, "├── {} {}", self.paint("SETUP FAILED", Color::Red), reason)?;
        }

        let memory_column = report.specification.configuration.memory_check
            || report.results.iter().any(|r| r.memcheck.is_some());
        let width = report
            .results
            .iter()
            .map(|r| r.name().chars().count())
            .max()
            .unwrap_or(0);
        for result in &report.results {
            let class = result.outcome.class();
            // Only what the checker actually reported; `----` when it never ran.
            let memory = match &result.memcheck {
                _ if !memory_column => String::new(),
                Some(memcheck) if memcheck.is_clean() => {
                    format!("  memory {}", self.paint("OK", Color::Green))
                }
                Some(_) => format!("  memory {}", self.paint("FAIL", Color::Magenta)),
                None => "  memory ----".to_string(),
            };
            writeln!(
                out,
                "├── {:<width$}  {}{}  ({} ms)",
                result.name(),
                self.status(class),
                memory,
                result.duration_ms,
                width = width
            )?;
        }
        writeln!(out, "└ Ending {}", report.label())?;
        writeln!(out)
    }

    fn write_failures(&self, summary: &RunSummary, out: &mut dyn Write) -> io::Result<()> {
        for report in &summary.reports {
            for result in report.failures() {
                write!(
                    out,
                    "{}:{} {} [{}]: {}",
                    report.specification.source_path().display(),
                    result.test.line,
                    result.name(),
                    self.status(result.outcome.class()),
                    result.outcome.describe()
                )?;
                if let Some(code) = result.exit_code {
                    write!(out, " (exit code {})", code)?;
                }
                writeln!(out)?;
                if let Some(line) = result.stderr.trim().lines().last() {
                    writeln!(out, "    stderr: {}", line)?;
                }
                if let Some(path) = result.memcheck.as_ref().and_then(|m| m.saved_to.as_ref()) {
                    writeln!(out, "    memory report: {}", path.display())?;
                }
            }
        }
        Ok(())
    }
}

impl Reporter for NiceReporter {
    fn finish(&mut self, summary: &RunSummary, out: &mut dyn Write) -> io::Result<()> {
        for diagnostic in &summary.diagnostics {
            writeln!(out, "{} {}", self.paint("✗", Color::Red), diagnostic)?;
        }
        if !summary.diagnostics.is_empty() {
            writeln!(out)?;
        }

        for report in &summary.reports {
            self.write_report(report, out)?;
        }

        let tally = &summary.tally;
        if summary.cancelled {
            writeln!(out, "{}", self.paint("Run cancelled", Color::Yellow))?;
        }
        if tally.setup_failures > 0 {
            writeln!(
                out,
                "{}",
                self.paint(
                    &format!("{} suite setup(s) failed!", tally.setup_failures),
                    Color::Red
                )
            )?;
        }

        if tally.is_success() {
            writeln!(out, "{}", self.paint("All clear!", Color::Green))?;
        } else if tally.total > 0 && tally.unsuccessful() > 0 {
            writeln!(
                out,
                "{}",
                self.paint(
                    &format!("Failed {} tests of {}", tally.unsuccessful(), tally.total),
                    Color::Red
                )
            )?;
        }
        writeln!(
            out,
            "passed: {}, failed: {}, errors: {}, memory errors: {}, total: {}",
            tally.passed, tally.failed, tally.errored, tally.memory_errored, tally.total
        )?;

        if tally.unsuccessful() > 0 {
            writeln!(out)?;
            self.write_failures(summary, out)?;
        }
        Ok(())
    }
}

/// One JSON object per line for every lifecycle event
#[derive(Debug, Clone, Copy, Default)]
pub struct EventsReporter;

impl Reporter for EventsReporter {
    fn on_event(&mut self, event: &Event, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *out, event)?;
        writeln!(out)
    }

    fn finish(&mut self, summary: &RunSummary, out: &mut dyn Write) -> io::Result<()> {
        self.on_event(
            &Event::RunFinished {
                tally: summary.tally,
                cancelled: summary.cancelled,
            },
            out,
        )
    }
}

/// The whole [`RunSummary`] as a single JSON document
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn finish(&mut self, summary: &RunSummary, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *out, summary)?;
        writeln!(out)
    }
}
