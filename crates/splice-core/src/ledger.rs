//! Append-only record of everything that happened to each patch in a run.

use std::fmt;
use std::time::Duration;

/// Why a patch was left out of the run without a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A disable rule matched the patch.
    Disabled,
    /// The patch declares compatibility but not with this package.
    PackageNotListed,
    /// Neither default enablement nor an enable rule selected it.
    NotEnabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::PackageNotListed => write!(f, "package not listed"),
            SkipReason::NotEnabled => write!(f, "not enabled"),
        }
    }
}

/// Category of a warning entry.
///
/// `IncompatiblePackage` and `VersionMismatch` both exclude the patch today
/// but are kept apart so callers can treat them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    IncompatiblePackage,
    VersionMismatch,
    Installation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Succeeded {
    pub name: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub name: String,
    pub elapsed: Duration,
    pub message: String,
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Patch name, or a pipeline stage such as `Installation`.
    pub subject: String,
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub name: String,
    pub reason: SkipReason,
}

/// Overall verdict of a run: failed iff at least one patch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overall {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsLedger {
    succeeded: Vec<Succeeded>,
    failed: Vec<Failed>,
    warnings: Vec<Warning>,
    skipped: Vec<Skipped>,
    total_elapsed: Duration,
}

impl ResultsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_success(&mut self, name: impl Into<String>, elapsed: Duration) {
        self.succeeded.push(Succeeded {
            name: name.into(),
            elapsed,
        });
    }

    pub fn add_failure(
        &mut self,
        name: impl Into<String>,
        elapsed: Duration,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) {
        self.failed.push(Failed {
            name: name.into(),
            elapsed,
            message: message.into(),
            trace: trace.into(),
        });
    }

    pub fn add_warning(
        &mut self,
        subject: impl Into<String>,
        kind: WarningKind,
        message: impl Into<String>,
    ) {
        self.warnings.push(Warning {
            subject: subject.into(),
            kind,
            message: message.into(),
        });
    }

    pub fn add_skipped(&mut self, name: impl Into<String>, reason: SkipReason) {
        self.skipped.push(Skipped {
            name: name.into(),
            reason,
        });
    }

    pub fn set_total_elapsed(&mut self, elapsed: Duration) {
        self.total_elapsed = elapsed;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn succeeded(&self) -> &[Succeeded] {
        &self.succeeded
    }

    pub fn failed(&self) -> &[Failed] {
        &self.failed
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn skipped(&self) -> &[Skipped] {
        &self.skipped
    }

    pub fn total_elapsed(&self) -> Duration {
        self.total_elapsed
    }

    /// Number of engine outcomes folded into the ledger.
    pub fn outcomes(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_failed(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn overall(&self) -> Overall {
        if self.is_failed() {
            Overall::Failed
        } else {
            Overall::Succeeded
        }
    }
}
