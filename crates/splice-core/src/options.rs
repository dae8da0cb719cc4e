//! Binding option values to the selected patches.
//!
//! Overrides from enable rules take priority. Without any, values come from a
//! persisted options store; when the store is empty, the catalog's defaults
//! are written to it so the user has a file to edit for the next run.

use crate::catalog::{Catalog, Patch};
use crate::selection::Selection;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Patch name to option key to value.
pub type OptionValues = BTreeMap<String, BTreeMap<String, Value>>;

/// Where the bound values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSource {
    Overrides,
    Stored,
    GeneratedDefaults,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundOptions {
    /// Effective values for every selected patch that declares options.
    pub values: OptionValues,
    pub source: OptionSource,
}

#[derive(Debug)]
pub enum OptionsError {
    UnknownOption { patch: String, key: String },
    Read { path: PathBuf, source: io::Error },
    Write { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, reason: String },
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsError::UnknownOption { patch, key } => {
                write!(f, "patch '{}' has no option '{}'", patch, key)
            }
            OptionsError::Read { path, source } => {
                write!(f, "failed to read options file {}: {}", path.display(), source)
            }
            OptionsError::Write { path, source } => {
                write!(f, "failed to write options file {}: {}", path.display(), source)
            }
            OptionsError::Parse { path, reason } => {
                write!(f, "invalid options file {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for OptionsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OptionsError::Read { source, .. } | OptionsError::Write { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Persisted option values.
pub trait OptionStore {
    /// Stored values, or `None` when nothing (or an empty file) is stored.
    fn load(&self) -> Result<Option<OptionValues>, OptionsError>;

    fn save(&self, values: &OptionValues) -> Result<(), OptionsError>;
}

/// Options stored as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct FileOptionStore {
    path: PathBuf,
}

impl FileOptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileOptionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OptionStore for FileOptionStore {
    fn load(&self) -> Result<Option<OptionValues>, OptionsError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| OptionsError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let values: OptionValues =
            serde_json::from_str(&content).map_err(|e| OptionsError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(values).filter(|v| !v.is_empty()))
    }

    fn save(&self, values: &OptionValues) -> Result<(), OptionsError> {
        let content = serde_json::to_string_pretty(values).map_err(|e| OptionsError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| OptionsError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        }
        fs::write(&self.path, content).map_err(|e| OptionsError::Write {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryOptionStore {
    values: RefCell<Option<OptionValues>>,
    saves: Cell<usize>,
}

impl MemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: OptionValues) -> Self {
        MemoryOptionStore {
            values: RefCell::new(Some(values)),
            saves: Cell::new(0),
        }
    }

    pub fn values(&self) -> Option<OptionValues> {
        self.values.borrow().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.get()
    }
}

impl OptionStore for MemoryOptionStore {
    fn load(&self) -> Result<Option<OptionValues>, OptionsError> {
        Ok(self.values.borrow().clone().filter(|v| !v.is_empty()))
    }

    fn save(&self, values: &OptionValues) -> Result<(), OptionsError> {
        *self.values.borrow_mut() = Some(values.clone());
        self.saves.set(self.saves.get() + 1);
        Ok(())
    }
}

/// Default values of every patch that declares options.
pub fn default_values<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> OptionValues {
    patches
        .into_iter()
        .filter(|p| !p.options().is_empty())
        .map(|p| {
            let defaults = p
                .options()
                .iter()
                .map(|o| (o.key.clone(), o.default.clone()))
                .collect();
            (p.name().to_string(), defaults)
        })
        .collect()
}

/// Work out the option values the engine should run the selection with.
pub fn bind_options(
    catalog: &Catalog,
    selection: &Selection,
    store: &dyn OptionStore,
) -> Result<BoundOptions, OptionsError> {
    let selected = selection.patches(catalog);
    let mut values = default_values(selected.iter().copied());

    if !selection.overrides().is_empty() {
        for (name, overrides) in selection.overrides() {
            let Some(patch) = catalog.find(name) else {
                continue;
            };
            for key in overrides.keys() {
                if patch.option(key).is_none() {
                    return Err(OptionsError::UnknownOption {
                        patch: name.clone(),
                        key: key.clone(),
                    });
                }
            }
            if !selection.contains(patch.index()) {
                tracing::debug!(patch = %name, "ignoring options for unselected patch");
                continue;
            }
            values
                .entry(name.clone())
                .or_default()
                .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        return Ok(BoundOptions {
            values,
            source: OptionSource::Overrides,
        });
    }

    if let Some(stored) = store.load()? {
        for (name, stored_values) in stored {
            let Some(patch) = catalog.find(&name) else {
                tracing::warn!(patch = %name, "options file names an unknown patch");
                continue;
            };
            let Some(effective) = values.get_mut(&name) else {
                continue;
            };
            for (key, value) in stored_values {
                if patch.option(&key).is_none() {
                    tracing::warn!(patch = %name, key = %key, "options file sets an unknown option");
                    continue;
                }
                effective.insert(key, value);
            }
        }
        return Ok(BoundOptions {
            values,
            source: OptionSource::Stored,
        });
    }

    store.save(&default_values(catalog.patches()))?;
    Ok(BoundOptions {
        values,
        source: OptionSource::GeneratedDefaults,
    })
}
