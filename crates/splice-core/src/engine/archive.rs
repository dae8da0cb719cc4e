use super::{EngineError, OutcomeStream, PatchEngine, PatchError, PatchOutcome};
use crate::catalog::{Operation, Patch};
use crate::options::OptionValues;
use crate::orchestrator::CancelToken;
use crate::selection::PackageIdentity;
use crate::utils::diff::apply_diff;
use crate::utils::hash::hash_bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use zip::ZipArchive;

/// Archive entry holding `{"name": ..., "version": ...}` for the package.
pub const PACKAGE_METADATA_ENTRY: &str = "package.json";

/// The artifact's entries after every successful patch was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedArtifact {
    pub package: PackageIdentity,
    pub entries: BTreeMap<String, Vec<u8>>,
}

/// Applies bundle operations to a ZIP artifact held in memory.
pub struct ArchiveEngine {
    path: PathBuf,
    package: PackageIdentity,
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveEngine {
    /// Read the whole artifact. Any failure here is fatal to the run.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let archive_error = |reason: String| EngineError::Archive {
            path: path.to_path_buf(),
            reason,
        };
        let mut archive = ZipArchive::new(file).map_err(|e| archive_error(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(|e| archive_error(e.to_string()))?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| archive_error(format!("{}: {}", file.name(), e)))?;
            entries.insert(file.name().to_string(), data);
        }

        let metadata = entries
            .get(PACKAGE_METADATA_ENTRY)
            .ok_or_else(|| EngineError::Metadata {
                reason: format!("{} not found in artifact", PACKAGE_METADATA_ENTRY),
            })?;
        let package: PackageIdentity =
            serde_json::from_slice(metadata).map_err(|e| EngineError::Metadata {
                reason: e.to_string(),
            })?;

        tracing::debug!(
            artifact = %path.display(),
            entries = entries.len(),
            package = %package.name,
            "opened artifact"
        );
        Ok(ArchiveEngine {
            path: path.to_path_buf(),
            package,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package(&self) -> &PackageIdentity {
        &self.package
    }

    pub fn into_patched(self) -> PatchedArtifact {
        PatchedArtifact {
            package: self.package,
            entries: self.entries,
        }
    }
}

impl PatchEngine for ArchiveEngine {
    fn execute<'a>(
        &'a mut self,
        patches: &'a [&'a Patch],
        options: &'a OptionValues,
        cancel: &'a CancelToken,
    ) -> OutcomeStream<'a> {
        Box::new(Outcomes {
            entries: &mut self.entries,
            patches: patches.iter(),
            options,
            cancel,
        })
    }
}

struct Outcomes<'a> {
    entries: &'a mut BTreeMap<String, Vec<u8>>,
    patches: std::slice::Iter<'a, &'a Patch>,
    options: &'a OptionValues,
    cancel: &'a CancelToken,
}

impl Iterator for Outcomes<'_> {
    type Item = Result<PatchOutcome, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            tracing::info!("cancelled; not starting further patches");
            return None;
        }
        let patch = self.patches.next()?;
        let start = Instant::now();
        let options = effective_options(patch, self.options.get(patch.name()));

        let outcome = match stage_patch(&*self.entries, patch, &options) {
            Ok(staged) => {
                for (entry, data) in staged {
                    match data {
                        Some(data) => self.entries.insert(entry, data),
                        None => self.entries.remove(&entry),
                    };
                }
                PatchOutcome::success(patch.name(), start.elapsed())
            }
            Err(e) => PatchOutcome::failure(patch.name(), e, start.elapsed()),
        };
        Some(Ok(outcome))
    }
}

/// Declared defaults overlaid with the bound values.
fn effective_options(
    patch: &Patch,
    bound: Option<&BTreeMap<String, Value>>,
) -> BTreeMap<String, Value> {
    let mut options: BTreeMap<String, Value> = patch
        .options()
        .iter()
        .map(|o| (o.key.clone(), o.default.clone()))
        .collect();
    if let Some(bound) = bound {
        options.extend(bound.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    options
}

/// Entry name to new content; `None` marks a deletion.
type Staged = BTreeMap<String, Option<Vec<u8>>>;

/// Run every operation of `patch` against a staged view of `entries`.
///
/// Nothing is written to `entries` here, so a failed patch leaves the
/// artifact exactly as the previous patch left it.
fn stage_patch(
    entries: &BTreeMap<String, Vec<u8>>,
    patch: &Patch,
    options: &BTreeMap<String, Value>,
) -> Result<Staged, PatchError> {
    for spec in patch.options() {
        if spec.required && options.get(&spec.key).is_none_or(Value::is_null) {
            return Err(PatchError::MissingOption {
                key: spec.key.clone(),
            });
        }
    }

    let mut staged = Staged::new();
    for (index, operation) in patch.operations().iter().enumerate() {
        apply_operation(entries, &mut staged, patch.bundle_root(), operation, options).map_err(
            |e| PatchError::Operation {
                index,
                entry: operation.entry().to_string(),
                source: Box::new(e),
            },
        )?;
    }
    Ok(staged)
}

fn current<'e>(
    entries: &'e BTreeMap<String, Vec<u8>>,
    staged: &'e Staged,
    entry: &str,
) -> Option<&'e [u8]> {
    match staged.get(entry) {
        Some(data) => data.as_deref(),
        None => entries.get(entry).map(Vec::as_slice),
    }
}

fn apply_operation(
    entries: &BTreeMap<String, Vec<u8>>,
    staged: &mut Staged,
    bundle_root: &Path,
    operation: &Operation,
    options: &BTreeMap<String, Value>,
) -> Result<(), PatchError> {
    match operation {
        Operation::Diff {
            entry,
            diff,
            original_hash,
            final_hash,
        } => {
            let original =
                current(entries, staged, entry).ok_or_else(|| PatchError::EntryNotFound {
                    entry: entry.clone(),
                })?;
            let actual = hash_bytes(original);
            if &actual != original_hash {
                return Err(PatchError::OriginalMismatch {
                    entry: entry.clone(),
                    expected: original_hash.clone(),
                    actual,
                });
            }

            let diff_data = read_bundle_file(bundle_root, diff)?;
            let patched = apply_diff(original, &diff_data).map_err(|e| PatchError::DiffFailed {
                entry: entry.clone(),
                source: e,
            })?;

            let actual = hash_bytes(&patched);
            if &actual != final_hash {
                return Err(PatchError::VerificationFailed {
                    entry: entry.clone(),
                    expected: final_hash.clone(),
                    actual,
                });
            }
            staged.insert(entry.clone(), Some(patched));
        }
        Operation::Write {
            entry,
            source,
            template,
        } => {
            let mut data = read_bundle_file(bundle_root, source)?;
            if *template {
                let text = String::from_utf8(data).map_err(|_| PatchError::TemplateEncoding {
                    entry: entry.clone(),
                })?;
                data = render_template(&text, options).into_bytes();
            }
            staged.insert(entry.clone(), Some(data));
        }
        Operation::Delete { entry } => {
            if current(entries, staged, entry).is_some() {
                staged.insert(entry.clone(), None);
            }
        }
    }
    Ok(())
}

fn read_bundle_file(bundle_root: &Path, relative: &str) -> Result<Vec<u8>, PatchError> {
    let path = bundle_root.join(relative);
    fs::read(&path).map_err(|e| PatchError::BundleFile { path, source: e })
}

/// Replace `{{key}}` with the option's value in a single pass. Inserted
/// values are never rescanned, and unknown keys are left as written.
fn render_template(text: &str, options: &BTreeMap<String, Value>) -> String {
    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rest = &rest[start..];
            break;
        };
        match options.get(&after[..end]) {
            Some(value) => {
                match value {
                    Value::String(s) => rendered.push_str(s),
                    Value::Null => {}
                    other => rendered.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                rendered.push_str("{{");
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}
