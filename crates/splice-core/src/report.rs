//! Plain-text summary of a finished run.

use crate::ledger::{Overall, ResultsLedger, WarningKind};
use crate::progress::format_duration;
use std::io::{self, Write};

/// Skipped patches listed by name before the rest are counted.
const SKIPPED_SHOWN: usize = 5;
/// Trace lines shown under each failure.
const TRACE_LINES: usize = 2;

fn warning_label(kind: &WarningKind) -> &'static str {
    match kind {
        WarningKind::IncompatiblePackage => "incompatible",
        WarningKind::VersionMismatch => "version mismatch",
        WarningKind::Installation => "installation",
    }
}

/// Write the summary of `ledger` to `out`.
pub fn write_summary(ledger: &ResultsLedger, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out)?;
    writeln!(
        out,
        "Patched in {}: {} succeeded, {} failed, {} warnings, {} skipped",
        format_duration(ledger.total_elapsed()),
        ledger.succeeded().len(),
        ledger.failed().len(),
        ledger.warnings().len(),
        ledger.skipped().len(),
    )?;

    if !ledger.succeeded().is_empty() {
        writeln!(out, "\nSucceeded:")?;
        for entry in ledger.succeeded() {
            writeln!(out, "  + {} ({})", entry.name, format_duration(entry.elapsed))?;
        }
    }

    if !ledger.failed().is_empty() {
        writeln!(out, "\nFailed:")?;
        for entry in ledger.failed() {
            writeln!(out, "  x {}: {}", entry.name, entry.message)?;
            // the first trace line repeats the message
            for line in entry.trace.lines().skip(1).take(TRACE_LINES) {
                writeln!(out, "      {}", line)?;
            }
        }
    }

    if !ledger.warnings().is_empty() {
        writeln!(out, "\nWarnings:")?;
        for warning in ledger.warnings() {
            writeln!(
                out,
                "  ! {} [{}]: {}",
                warning.subject,
                warning_label(&warning.kind),
                warning.message
            )?;
        }
    }

    if !ledger.skipped().is_empty() {
        writeln!(out, "\nSkipped:")?;
        for entry in ledger.skipped().iter().take(SKIPPED_SHOWN) {
            writeln!(out, "  - {} ({})", entry.name, entry.reason)?;
        }
        let hidden = ledger.skipped().len().saturating_sub(SKIPPED_SHOWN);
        if hidden > 0 {
            writeln!(out, "  ... and {} more", hidden)?;
        }
    }

    writeln!(out)?;
    match ledger.overall() {
        Overall::Succeeded if ledger.outcomes() == 0 => writeln!(out, "No patches were applied"),
        Overall::Succeeded => writeln!(out, "All selected patches applied"),
        Overall::Failed => writeln!(
            out,
            "{} of {} patches failed",
            ledger.failed().len(),
            ledger.outcomes()
        ),
    }
}
