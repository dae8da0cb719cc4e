use super::rule::{OptionOverrides, SelectionRule};
use crate::catalog::{Catalog, Compatibility, Patch};
use crate::ledger::{ResultsLedger, SkipReason, WarningKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Package name and installed version of the artifact being patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIdentity {
    pub name: String,
    pub version: String,
}

impl PackageIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PackageIdentity {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    /// Ignore default enablement; only explicitly enabled patches run.
    pub exclusive: bool,
    /// Skip the installed-version check.
    pub force: bool,
}

/// The patches to run, in catalog order, plus per-patch option overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    indices: Vec<usize>,
    overrides: BTreeMap<String, OptionOverrides>,
}

impl Selection {
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn patches<'c>(&self, catalog: &'c Catalog) -> Vec<&'c Patch> {
        self.indices.iter().filter_map(|&i| catalog.get(i)).collect()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Overrides keyed by patch name. Empty when no enable rule carried any.
    pub fn overrides(&self) -> &BTreeMap<String, OptionOverrides> {
        &self.overrides
    }
}

struct RuleIndex<'r> {
    enabled_names: HashSet<&'r str>,
    enabled_indices: HashSet<usize>,
    disabled_names: HashSet<&'r str>,
    disabled_indices: HashSet<usize>,
}

impl<'r> RuleIndex<'r> {
    fn new(rules: &'r [SelectionRule]) -> Self {
        let mut index = RuleIndex {
            enabled_names: HashSet::new(),
            enabled_indices: HashSet::new(),
            disabled_names: HashSet::new(),
            disabled_indices: HashSet::new(),
        };
        for rule in rules {
            match rule {
                SelectionRule::EnableByName { name, .. } => {
                    index.enabled_names.insert(name.as_str());
                }
                SelectionRule::EnableByIndex { index: i, .. } => {
                    index.enabled_indices.insert(*i);
                }
                SelectionRule::DisableByName { name } => {
                    index.disabled_names.insert(name.as_str());
                }
                SelectionRule::DisableByIndex { index: i } => {
                    index.disabled_indices.insert(*i);
                }
            }
        }
        index
    }

    fn disables(&self, patch: &Patch) -> bool {
        self.disabled_names.contains(patch.name()) || self.disabled_indices.contains(&patch.index())
    }

    fn enables(&self, patch: &Patch) -> bool {
        self.enabled_names.contains(patch.name()) || self.enabled_indices.contains(&patch.index())
    }
}

/// Compute the patches to run.
///
/// Every excluded patch is recorded in `ledger`, either as skipped or as a
/// warning. Disable rules are checked before anything else, so a disabled
/// patch is never reported as incompatible.
pub fn resolve(
    catalog: &Catalog,
    rules: &[SelectionRule],
    package: &PackageIdentity,
    flags: ResolveFlags,
    ledger: &mut ResultsLedger,
) -> Selection {
    let index = RuleIndex::new(rules);
    let mut selection = Selection::default();

    for patch in catalog.patches() {
        let name = patch.name();

        if index.disables(patch) {
            tracing::debug!(patch = name, "skipped by disable rule");
            ledger.add_skipped(name, SkipReason::Disabled);
            continue;
        }

        match patch.compatibility_with(&package.name) {
            Compatibility::Unrestricted | Compatibility::AnyVersion => {}
            Compatibility::Unlisted => {
                tracing::debug!(patch = name, package = %package.name, "package not listed");
                ledger.add_skipped(name, SkipReason::PackageNotListed);
                continue;
            }
            Compatibility::NoVersions => {
                ledger.add_warning(
                    name,
                    WarningKind::IncompatiblePackage,
                    format!("Incompatible with {}", package.name),
                );
                continue;
            }
            Compatibility::Versions(versions) => {
                if !flags.force && !versions.contains(&package.version) {
                    let required = versions.iter().cloned().collect::<Vec<_>>().join(", ");
                    ledger.add_warning(
                        name,
                        WarningKind::VersionMismatch,
                        format!("Version mismatch: requires {}", required),
                    );
                    continue;
                }
            }
        }

        let enabled = (!flags.exclusive && patch.uses()) || index.enables(patch);
        if !enabled {
            ledger.add_skipped(name, SkipReason::NotEnabled);
            continue;
        }

        selection.indices.push(patch.index());
    }

    for rule in rules {
        let Some(options) = rule.options().filter(|o| !o.is_empty()) else {
            continue;
        };
        let target = match rule {
            SelectionRule::EnableByName { name, .. } => catalog.find(name),
            SelectionRule::EnableByIndex { index, .. } => catalog.get(*index),
            _ => None,
        };
        let Some(patch) = target else {
            continue;
        };
        selection
            .overrides
            .entry(patch.name().to_string())
            .or_default()
            .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    tracing::info!(
        selected = selection.len(),
        catalog = catalog.len(),
        package = %package.name,
        version = %package.version,
        "resolved patch selection"
    );
    selection
}
