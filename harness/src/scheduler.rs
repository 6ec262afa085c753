//! Bounded-parallel execution of discovered specifications

use crate::config::HarnessConfig;
use crate::discovery::Discovery;
use crate::executor::{Executor, ExecutorConfig};
use crate::process::ProcessRunner;
use crate::report::{Aggregator, RunReport, RunSummary};
use crate::reporter::{drive, Event, EventSink, Reporter};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Scheduler {
    runner: Arc<dyn ProcessRunner>,
    config: HarnessConfig,
    events: EventSink,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: HarnessConfig) -> Self {
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

    /// Run every specification in `discovery`, at most `parallelism` at once.
    ///
    /// Tests inside one specification stay sequential. Results are handed to
    /// a single aggregator and come back in discovery order.
    pub async fn run(&self, discovery: Discovery, cancel: &CancellationToken) -> RunSummary {
        let mut aggregator = Aggregator::new();
        for (index, diagnostic) in discovery.diagnostics {
            self.events.emit(Event::Diagnostic {
                diagnostic: diagnostic.clone(),
            });
            aggregator.add_diagnostic(index, diagnostic);
        }

        let parallelism = self.config.parallelism.max(1);
        info!(
            "Running {} specifications with parallelism {}",
            discovery.specifications.len(),
            parallelism
        );

        let executor = Arc::new(
            Executor::new(self.runner.clone(), ExecutorConfig::from(&self.config))
                .with_events(self.events.clone()),
        );
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let (tx, mut rx) = mpsc::channel::<(usize, RunReport)>(parallelism);
        let mut workers = JoinSet::new();

        for (index, specification) in discovery.specifications {
            let executor = executor.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let report = executor.run(specification, &cancel).await;
                if tx.send((index, report)).await.is_err() {
                    debug!("Aggregator closed before report {} arrived", index);
                }
            });
        }
        drop(tx);

        while let Some((index, report)) = rx.recv().await {
            aggregator.add_report(index, report);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        let summary = aggregator.finish(cancel.is_cancelled());
        info!(
            "Run finished: {} passed, {} failed, {} errors, {} memory errors",
            summary.tally.passed,
            summary.tally.failed,
            summary.tally.errored,
            summary.tally.memory_errored
        );
        summary
    }
}

/// Run `discovery` with `reporter` receiving live events, then render the summary.
pub async fn run_reported<W>(
    runner: Arc<dyn ProcessRunner>,
    config: HarnessConfig,
    discovery: Discovery,
    reporter: Box<dyn Reporter>,
    out: W,
    cancel: &CancellationToken,
) -> io::Result<RunSummary>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let reporting = tokio::spawn(drive(reporter, rx, out));

    let scheduler = Scheduler::new(runner, config).with_events(EventSink::new(tx));
    let summary = scheduler.run(discovery, cancel).await;
    // Dropping the last sender ends the reporter's event loop.
    drop(scheduler);

    let (mut reporter, mut out) = reporting.await.map_err(io::Error::other)??;
    reporter.finish(&summary, &mut out)?;
    out.flush()?;
    Ok(summary)
}
