//! Writing the patched artifact back out as a ZIP.

use crate::engine::PatchedArtifact;
use crate::utils::hash::hash_bytes;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug)]
pub enum FinalizeError {
    ReadOriginal { path: PathBuf, reason: String },
    Write { path: PathBuf, reason: String },
    Io(io::Error),
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeError::ReadOriginal { path, reason } => {
                write!(f, "failed to read original artifact {}: {}", path.display(), reason)
            }
            FinalizeError::Write { path, reason } => {
                write!(f, "failed to write artifact {}: {}", path.display(), reason)
            }
            FinalizeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FinalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FinalizeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FinalizeError {
    fn from(e: io::Error) -> Self {
        FinalizeError::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub entries: usize,
    pub ripped: usize,
    /// SHA-256 of the written file.
    pub sha256: String,
}

/// Whether `entry` is a native library of one of the `rip_libs` ABIs.
pub fn is_ripped(entry: &str, rip_libs: &[String]) -> bool {
    let Some(rest) = entry.strip_prefix("lib/") else {
        return false;
    };
    rest.split_once('/')
        .is_some_and(|(abi, _)| rip_libs.iter().any(|r| r == abi))
}

/// Write `patched` to `output`, keeping the original's entry order and
/// compression where possible.
///
/// Entries the patches deleted are dropped, new entries are appended in name
/// order, and native libraries for the `rip_libs` ABIs are left out.
pub fn finalize_artifact(
    original: &Path,
    patched: &PatchedArtifact,
    rip_libs: &[String],
    output: &Path,
) -> Result<FinalizeSummary, FinalizeError> {
    let read_error = |reason: String| FinalizeError::ReadOriginal {
        path: original.to_path_buf(),
        reason,
    };
    let write_error = |e: zip::result::ZipError| FinalizeError::Write {
        path: output.to_path_buf(),
        reason: e.to_string(),
    };

    let mut archive =
        ZipArchive::new(File::open(original)?).map_err(|e| read_error(e.to_string()))?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = ZipWriter::new(File::create(output)?);

    let mut written = HashSet::new();
    let mut ripped = 0;
    for i in 0..archive.len() {
        let file = archive.by_index(i).map_err(|e| read_error(e.to_string()))?;
        let name = file.name().to_string();
        if is_ripped(&name, rip_libs) {
            ripped += 1;
            continue;
        }
        if file.is_dir() {
            writer
                .add_directory(name.as_str(), SimpleFileOptions::default())
                .map_err(write_error)?;
            continue;
        }
        let Some(data) = patched.entries.get(&name) else {
            tracing::debug!(entry = %name, "dropping deleted entry");
            continue;
        };
        let method = match file.compression() {
            CompressionMethod::Stored => CompressionMethod::Stored,
            _ => CompressionMethod::Deflated,
        };
        drop(file);
        writer
            .start_file(name.as_str(), SimpleFileOptions::default().compression_method(method))
            .map_err(write_error)?;
        writer.write_all(data)?;
        written.insert(name);
    }

    for (name, data) in &patched.entries {
        if written.contains(name) {
            continue;
        }
        if is_ripped(name, rip_libs) {
            ripped += 1;
            continue;
        }
        writer
            .start_file(
                name.as_str(),
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .map_err(write_error)?;
        writer.write_all(data)?;
        written.insert(name.clone());
    }
    writer.finish().map_err(write_error)?;

    let mut bytes = Vec::new();
    File::open(output)?.read_to_end(&mut bytes)?;
    let summary = FinalizeSummary {
        entries: written.len(),
        ripped,
        sha256: hash_bytes(&bytes),
    };
    tracing::info!(
        output = %output.display(),
        entries = summary.entries,
        ripped = summary.ripped,
        sha256 = %summary.sha256,
        "wrote patched artifact"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{read_artifact, write_artifact};
    use crate::selection::PackageIdentity;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn patched(entries: &[(&str, &[u8])]) -> PatchedArtifact {
        PatchedArtifact {
            package: PackageIdentity::new("com.example", "1.0"),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn matches_native_library_paths() {
        let rip = vec!["x86".to_string(), "armeabi-v7a".to_string()];
        assert!(is_ripped("lib/x86/libfoo.so", &rip));
        assert!(is_ripped("lib/armeabi-v7a/libbar.so", &rip));
        assert!(!is_ripped("lib/arm64-v8a/libfoo.so", &rip));
        assert!(!is_ripped("assets/lib/x86/libfoo.so", &rip));
        assert!(!is_ripped("lib/x86", &rip));
    }

    #[test]
    fn keeps_order_replaces_drops_and_appends() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("app.zip");
        let output = dir.path().join("out").join("app-patched.zip");
        write_artifact(
            &original,
            &[
                ("z-first.txt", b"first"),
                ("deleted.txt", b"gone"),
                ("a-last.txt", b"old"),
            ],
        );
        let patched = patched(&[
            ("z-first.txt", b"first"),
            ("a-last.txt", b"new"),
            ("added.txt", b"added"),
        ]);

        let summary = finalize_artifact(&original, &patched, &[], &output).unwrap();

        let entries = read_artifact(&output);
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["z-first.txt", "a-last.txt", "added.txt"]);
        assert_eq!(entries[1].1, b"new");
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.sha256, hash_bytes(&fs::read(&output).unwrap()));
    }

    #[test]
    fn rips_listed_abis() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("app.zip");
        let output = dir.path().join("app-patched.zip");
        write_artifact(
            &original,
            &[
                ("lib/x86/libfoo.so", b"x86"),
                ("lib/arm64-v8a/libfoo.so", b"arm64"),
            ],
        );
        let patched = patched(&[
            ("lib/x86/libfoo.so", b"x86"),
            ("lib/arm64-v8a/libfoo.so", b"arm64"),
            ("lib/x86/libnew.so", b"new"),
        ]);

        let summary =
            finalize_artifact(&original, &patched, &["x86".to_string()], &output).unwrap();

        let names: Vec<_> = read_artifact(&output).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["lib/arm64-v8a/libfoo.so"]);
        assert_eq!(summary.ripped, 2);
    }

    #[test]
    fn unreadable_original_is_an_error() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("app.zip");
        fs::write(&original, b"not a zip").unwrap();

        let result = finalize_artifact(&original, &patched(&[]), &[], &dir.path().join("o.zip"));

        assert!(matches!(result, Err(FinalizeError::ReadOriginal { .. })));
    }
}
