use std::fmt;
use std::io;
use std::path::PathBuf;

/// Why a single patch failed. Never fatal to the run.
#[derive(Debug)]
pub enum PatchError {
    /// The entry an operation needs is not in the artifact.
    EntryNotFound { entry: String },
    /// The entry does not have the content the diff was made against.
    OriginalMismatch { entry: String, expected: String, actual: String },
    /// The diff applied but produced unexpected content.
    VerificationFailed { entry: String, expected: String, actual: String },
    /// A diff or source file could not be read from the bundle.
    BundleFile { path: PathBuf, source: io::Error },
    /// The diff could not be applied.
    DiffFailed { entry: String, source: io::Error },
    /// A template source is not UTF-8.
    TemplateEncoding { entry: String },
    /// A required option resolved to null.
    MissingOption { key: String },
    /// Wraps the failure of the n-th operation of a patch.
    Operation { index: usize, entry: String, source: Box<PatchError> },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::EntryNotFound { entry } => {
                write!(f, "entry '{}' not found in artifact", entry)
            }
            PatchError::OriginalMismatch { entry, expected, actual } => write!(
                f,
                "entry '{}' has unexpected content: expected hash {}, got {}",
                entry, expected, actual
            ),
            PatchError::VerificationFailed { entry, expected, actual } => write!(
                f,
                "verification failed for '{}': expected hash {}, got {}",
                entry, expected, actual
            ),
            PatchError::BundleFile { path, .. } => {
                write!(f, "failed to read bundle file {}", path.display())
            }
            PatchError::DiffFailed { entry, .. } => {
                write!(f, "failed to apply diff to '{}'", entry)
            }
            PatchError::TemplateEncoding { entry } => {
                write!(f, "template for '{}' is not valid UTF-8", entry)
            }
            PatchError::MissingOption { key } => {
                write!(f, "required option '{}' has no value", key)
            }
            PatchError::Operation { index, entry, .. } => {
                write!(f, "operation {} on '{}' failed", index + 1, entry)
            }
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::BundleFile { source, .. } => Some(source),
            PatchError::DiffFailed { source, .. } => Some(source),
            PatchError::Operation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// A fault that makes the whole run meaningless.
#[derive(Debug)]
pub enum EngineError {
    /// The artifact file could not be opened.
    Open { path: PathBuf, source: io::Error },
    /// The artifact is not a readable archive.
    Archive { path: PathBuf, reason: String },
    /// The artifact has no usable package metadata.
    Metadata { reason: String },
    /// The engine gave up mid-run.
    Aborted { reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Open { path, source } => {
                write!(f, "failed to open artifact {}: {}", path.display(), source)
            }
            EngineError::Archive { path, reason } => {
                write!(f, "failed to read artifact {}: {}", path.display(), reason)
            }
            EngineError::Metadata { reason } => write!(f, "invalid package metadata: {}", reason),
            EngineError::Aborted { reason } => write!(f, "patch engine aborted: {}", reason),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Open { source, .. } => Some(source),
            _ => None,
        }
    }
}
