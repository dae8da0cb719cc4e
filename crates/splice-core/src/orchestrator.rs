//! Drives an outcome stream into the results ledger and progress display.

use crate::engine::{EngineError, PatchOutcome};
use crate::ledger::ResultsLedger;
use crate::progress::{ProgressSink, ProgressState, ProgressView};
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative cancellation flag shared between the run and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How the outcome stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every resolved patch was attempted.
    Completed,
    /// Cancelled before the stream was exhausted.
    Interrupted,
    /// Ended before any patch was resolved, e.g. no device to install to.
    NotStarted,
}

/// Owns the ledger for one run.
///
/// The resolver writes its exclusions through [`Orchestrator::ledger_mut`]
/// before [`Orchestrator::run`] folds in the engine's outcomes.
#[derive(Debug, Default)]
pub struct Orchestrator {
    ledger: ResultsLedger,
}

impl Orchestrator {
    /// Start a run with an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResultsLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut ResultsLedger {
        &mut self.ledger
    }

    /// Fold `outcomes` into the ledger, one at a time and in order.
    ///
    /// Each outcome is fully recorded before the next is pulled, and nothing
    /// already pulled is dropped on cancellation. An engine error ends the run
    /// and is returned as is.
    pub fn run<I>(
        &mut self,
        total: usize,
        outcomes: I,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunStatus, EngineError>
    where
        I: IntoIterator<Item = Result<PatchOutcome, EngineError>>,
    {
        let mut progress = ProgressState::new(total);
        sink.render(view(&progress, None));

        let mut outcomes = outcomes.into_iter();
        let status = loop {
            if cancel.is_cancelled() {
                break RunStatus::Interrupted;
            }
            let Some(outcome) = outcomes.next() else {
                // engines end the stream early when cancelled
                break if cancel.is_cancelled() {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Completed
                };
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "patch engine failed");
                    sink.finish();
                    return Err(e);
                }
            };

            progress.advance();
            progress.record(outcome.elapsed);
            self.record(&outcome);
            sink.render(view(&progress, Some(&outcome.name)));
        };

        sink.finish();
        if status == RunStatus::Interrupted {
            tracing::warn!(
                attempted = progress.current(),
                total,
                "run interrupted before all patches were attempted"
            );
        }
        Ok(status)
    }

    fn record(&mut self, outcome: &PatchOutcome) {
        match &outcome.error {
            None => {
                tracing::debug!(patch = %outcome.name, "patch succeeded");
                self.ledger.add_success(&outcome.name, outcome.elapsed);
            }
            Some(error) => {
                tracing::warn!(patch = %outcome.name, error = %error, "patch failed");
                self.ledger.add_failure(
                    &outcome.name,
                    outcome.elapsed,
                    error.to_string(),
                    error_trace(error.as_ref()),
                );
            }
        }
    }

    /// Close the run and hand the ledger over.
    pub fn finish(mut self, total_elapsed: Duration) -> ResultsLedger {
        self.ledger.set_total_elapsed(total_elapsed);
        self.ledger
    }
}

fn view<'a>(progress: &ProgressState, item: Option<&'a str>) -> ProgressView<'a> {
    ProgressView {
        current: progress.current(),
        total: progress.total(),
        item,
        eta: progress.eta(),
    }
}

/// The error followed by its chain of causes, one per line.
pub fn error_trace(error: &(dyn Error + 'static)) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}
