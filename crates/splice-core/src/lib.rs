//! Patch selection and execution orchestration.
//!
//! The pipeline is: load a [`catalog::Catalog`] from patch bundles, resolve
//! the patches to run with [`selection::resolve`], bind their options, drive a
//! [`engine::PatchEngine`] through the [`orchestrator::Orchestrator`] and read
//! the resulting [`ledger::ResultsLedger`].

pub mod catalog;
pub mod engine;
pub mod finalize;
pub mod install;
pub mod ledger;
pub mod options;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod selection;
pub mod sign;
pub mod utils;

#[cfg(test)]
mod fixtures;
