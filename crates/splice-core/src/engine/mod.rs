//! The patch engine boundary and the bundled archive engine.
//!
//! An engine receives the resolved patches and produces one [`PatchOutcome`]
//! per patch it attempts, lazily and in execution order. A failing patch is
//! an outcome carrying an error; only faults that make the whole run
//! meaningless are yielded as [`EngineError`].

mod archive;
mod error;

use crate::catalog::Patch;
use crate::options::OptionValues;
use crate::orchestrator::CancelToken;
use std::time::Duration;

pub use archive::{ArchiveEngine, PatchedArtifact, PACKAGE_METADATA_ENTRY};
pub use error::{EngineError, PatchError};

/// Any per-patch error an engine can report.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of attempting one patch.
#[derive(Debug)]
pub struct PatchOutcome {
    pub name: String,
    pub error: Option<BoxError>,
    pub elapsed: Duration,
}

impl PatchOutcome {
    pub fn success(name: impl Into<String>, elapsed: Duration) -> Self {
        PatchOutcome {
            name: name.into(),
            error: None,
            elapsed,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<BoxError>, elapsed: Duration) -> Self {
        PatchOutcome {
            name: name.into(),
            error: Some(error.into()),
            elapsed,
        }
    }
}

/// Single-pass stream of outcomes.
pub type OutcomeStream<'a> = Box<dyn Iterator<Item = Result<PatchOutcome, EngineError>> + 'a>;

pub trait PatchEngine {
    /// Start executing `patches` in order.
    ///
    /// The stream is lazy: a patch runs when its outcome is pulled. Engines
    /// stop starting new patches once `cancel` is set.
    fn execute<'a>(
        &'a mut self,
        patches: &'a [&'a Patch],
        options: &'a OptionValues,
        cancel: &'a CancelToken,
    ) -> OutcomeStream<'a>;
}
