//! Patch bundles and the combined, read-only patch catalog.
//!
//! A bundle is either a directory holding `bundle.json` (plus the diff and
//! source files its operations reference) or a gzip-compressed tar archive of
//! such a directory. Loading several bundles concatenates their patches in
//! the order given; a patch's position in that concatenation is its catalog
//! index.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tempfile::TempDir;

/// Filename of the manifest inside a bundle.
pub const BUNDLE_MANIFEST: &str = "bundle.json";
/// Bundle format understood by this version.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Package name mapped to its accepted versions (`None` accepts any version).
pub type CompatiblePackages = BTreeMap<String, Option<BTreeSet<String>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub patches: Vec<PatchDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the patch runs when no rule mentions it.
    #[serde(rename = "use", default = "default_use")]
    pub use_by_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatible_packages: Option<CompatiblePackages>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
}

fn default_use() -> bool {
    true
}

impl PatchDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        PatchDefinition {
            name: name.into(),
            description: None,
            use_by_default: true,
            compatible_packages: None,
            options: Vec::new(),
            operations: Vec::new(),
        }
    }
}

/// A configurable value a patch reads at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub key: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A required option must not resolve to `null`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// A single change a patch makes to an artifact entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Operation {
    /// Apply a bsdiff patch from the bundle to an existing entry.
    Diff {
        entry: String,
        diff: String,
        original_hash: String,
        final_hash: String,
    },
    /// Create or replace an entry with a file from the bundle.
    Write {
        entry: String,
        source: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        template: bool,
    },
    /// Remove an entry. Already absent is not an error.
    Delete { entry: String },
}

impl Operation {
    pub fn entry(&self) -> &str {
        match self {
            Operation::Diff { entry, .. } => entry,
            Operation::Write { entry, .. } => entry,
            Operation::Delete { entry } => entry,
        }
    }

    fn bundle_path(&self) -> Option<&str> {
        match self {
            Operation::Diff { diff, .. } => Some(diff),
            Operation::Write { source, .. } => Some(source),
            Operation::Delete { .. } => None,
        }
    }
}

/// How a patch relates to one package identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility<'a> {
    /// The patch declares no compatibility at all.
    Unrestricted,
    /// The patch declares compatibility but does not list the package.
    Unlisted,
    /// The package is listed without a version constraint.
    AnyVersion,
    /// The package is listed with an empty version set.
    NoVersions,
    /// The package is listed with these accepted versions.
    Versions(&'a BTreeSet<String>),
}

/// A catalog entry: a patch definition plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    index: usize,
    definition: PatchDefinition,
    bundle_root: PathBuf,
}

impl Patch {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> Option<&str> {
        self.definition.description.as_deref()
    }

    pub fn uses(&self) -> bool {
        self.definition.use_by_default
    }

    pub fn compatible_packages(&self) -> Option<&CompatiblePackages> {
        self.definition.compatible_packages.as_ref()
    }

    pub fn options(&self) -> &[OptionSpec] {
        &self.definition.options
    }

    pub fn option(&self, key: &str) -> Option<&OptionSpec> {
        self.definition.options.iter().find(|o| o.key == key)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.definition.operations
    }

    /// Directory that operation paths are relative to.
    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    pub fn compatibility_with(&self, package: &str) -> Compatibility<'_> {
        let Some(packages) = &self.definition.compatible_packages else {
            return Compatibility::Unrestricted;
        };
        match packages.get(package) {
            None => Compatibility::Unlisted,
            Some(None) => Compatibility::AnyVersion,
            Some(Some(versions)) if versions.is_empty() => Compatibility::NoVersions,
            Some(Some(versions)) => Compatibility::Versions(versions),
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while loading bundles. All of them are user-input errors.
#[derive(Debug)]
pub enum CatalogError {
    BundleNotFound(PathBuf),
    BundleRead { path: PathBuf, source: io::Error },
    Extraction { path: PathBuf, source: io::Error },
    Manifest { path: PathBuf, reason: String },
    UnsupportedVersion { path: PathBuf, version: u32 },
    DuplicatePatch(String),
    UnsafePath { patch: String, path: String },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::BundleNotFound(path) => {
                write!(f, "patch bundle {} can't be found", path.display())
            }
            CatalogError::BundleRead { path, source } => {
                write!(f, "failed to read patch bundle {}: {}", path.display(), source)
            }
            CatalogError::Extraction { path, source } => {
                write!(f, "failed to extract patch bundle {}: {}", path.display(), source)
            }
            CatalogError::Manifest { path, reason } => {
                write!(f, "invalid bundle manifest in {}: {}", path.display(), reason)
            }
            CatalogError::UnsupportedVersion { path, version } => write!(
                f,
                "patch bundle {} has format version {}, expected {}",
                path.display(),
                version,
                BUNDLE_FORMAT_VERSION
            ),
            CatalogError::DuplicatePatch(name) => {
                write!(f, "patch '{}' is defined more than once", name)
            }
            CatalogError::UnsafePath { patch, path } => {
                write!(f, "patch '{}' references a path outside its bundle: {}", patch, path)
            }
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CatalogError::BundleRead { source, .. } => Some(source),
            CatalogError::Extraction { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The ordered collection of every patch in the supplied bundles.
#[derive(Debug, Default)]
pub struct Catalog {
    patches: Vec<Patch>,
    // Extracted archive bundles must outlive the patches that point into them.
    _extracted: Vec<TempDir>,
}

impl Catalog {
    /// Load and concatenate bundles in the order given.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CatalogError> {
        let mut catalog = Catalog::default();
        let mut seen = HashSet::new();

        for path in paths {
            let path = path.as_ref();
            let (root, extracted) = open_bundle(path)?;
            let manifest = load_manifest(&root, path)?;
            tracing::debug!(
                bundle = %path.display(),
                patches = manifest.patches.len(),
                "loaded patch bundle"
            );
            for definition in manifest.patches {
                check_bundle_paths(&definition)?;
                if !seen.insert(definition.name.clone()) {
                    return Err(CatalogError::DuplicatePatch(definition.name));
                }
                catalog.patches.push(Patch {
                    index: catalog.patches.len(),
                    definition,
                    bundle_root: root.clone(),
                });
            }
            catalog._extracted.extend(extracted);
        }

        Ok(catalog)
    }

    /// Build a catalog from in-memory definitions rooted at `bundle_root`.
    pub fn from_definitions(
        definitions: Vec<PatchDefinition>,
        bundle_root: &Path,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Catalog::default();
        let mut seen = HashSet::new();
        for definition in definitions {
            check_bundle_paths(&definition)?;
            if !seen.insert(definition.name.clone()) {
                return Err(CatalogError::DuplicatePatch(definition.name));
            }
            catalog.patches.push(Patch {
                index: catalog.patches.len(),
                definition,
                bundle_root: bundle_root.to_path_buf(),
            });
        }
        Ok(catalog)
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn get(&self, index: usize) -> Option<&Patch> {
        self.patches.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Patch> {
        self.patches.iter().find(|p| p.name() == name)
    }

    /// Catalog index of the patch called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.find(name).map(Patch::index)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Resolve a bundle path to a directory, extracting archives to a temp dir.
fn open_bundle(path: &Path) -> Result<(PathBuf, Option<TempDir>), CatalogError> {
    if !path.exists() {
        return Err(CatalogError::BundleNotFound(path.to_path_buf()));
    }
    if path.is_dir() {
        return Ok((path.to_path_buf(), None));
    }

    let file = File::open(path).map_err(|e| CatalogError::BundleRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let temp_dir = tempfile::tempdir().map_err(|e| CatalogError::Extraction {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(temp_dir.path())
        .map_err(|e| CatalogError::Extraction {
            path: path.to_path_buf(),
            source: e,
        })?;

    Ok((temp_dir.path().to_path_buf(), Some(temp_dir)))
}

fn load_manifest(root: &Path, bundle: &Path) -> Result<BundleManifest, CatalogError> {
    let manifest_path = root.join(BUNDLE_MANIFEST);
    let content = fs::read_to_string(&manifest_path).map_err(|e| CatalogError::BundleRead {
        path: manifest_path.clone(),
        source: e,
    })?;
    let manifest: BundleManifest =
        serde_json::from_str(&content).map_err(|e| CatalogError::Manifest {
            path: bundle.to_path_buf(),
            reason: e.to_string(),
        })?;
    if manifest.version != BUNDLE_FORMAT_VERSION {
        return Err(CatalogError::UnsupportedVersion {
            path: bundle.to_path_buf(),
            version: manifest.version,
        });
    }
    Ok(manifest)
}

fn check_bundle_paths(definition: &PatchDefinition) -> Result<(), CatalogError> {
    for operation in &definition.operations {
        let Some(path) = operation.bundle_path() else {
            continue;
        };
        let escapes = Path::new(path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(CatalogError::UnsafePath {
                patch: definition.name.clone(),
                path: path.to_string(),
            });
        }
    }
    Ok(())
}
