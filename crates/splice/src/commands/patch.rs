use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use splice_core::catalog::{Catalog, CatalogError};
use splice_core::engine::{ArchiveEngine, EngineError, PatchEngine};
use splice_core::finalize::{finalize_artifact, FinalizeError};
use splice_core::install::{AdbInstaller, InstallError, InstallMode, InstallOutcome, Installer};
use splice_core::ledger::{ResultsLedger, WarningKind};
use splice_core::options::{bind_options, FileOptionStore, OptionsError};
use splice_core::orchestrator::{CancelToken, Orchestrator, RunStatus};
use splice_core::progress::ProgressSink;
use splice_core::report::write_summary;
use splice_core::selection::{
    resolve, validate_rules, PackageIdentity, ResolveFlags, SelectionError, SelectionRule,
};
use splice_core::sign::{copy_unsigned, ApkSigner, KeystoreDetails, SignError, Signer};

use crate::args::PatchArgs;

/// Warning subject for device problems.
const INSTALLATION: &str = "Installation";

#[derive(Debug)]
pub enum PatchCommandError {
    ArtifactNotFound(PathBuf),
    Catalog(CatalogError),
    Selection(SelectionError),
    Options(OptionsError),
    Engine(EngineError),
    Finalize(FinalizeError),
    Sign(SignError),
    Report(io::Error),
}

impl fmt::Display for PatchCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchCommandError::ArtifactNotFound(path) => {
                write!(f, "artifact not found: {}", path.display())
            }
            PatchCommandError::Catalog(e) => write!(f, "{}", e),
            PatchCommandError::Selection(e) => write!(f, "{}", e),
            PatchCommandError::Options(e) => write!(f, "{}", e),
            PatchCommandError::Engine(e) => write!(f, "{}", e),
            PatchCommandError::Finalize(e) => write!(f, "{}", e),
            PatchCommandError::Sign(e) => write!(f, "signing failed: {}", e),
            PatchCommandError::Report(e) => write!(f, "failed to write summary: {}", e),
        }
    }
}

impl Error for PatchCommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PatchCommandError::ArtifactNotFound(_) => None,
            PatchCommandError::Catalog(e) => e.source(),
            PatchCommandError::Selection(e) => e.source(),
            PatchCommandError::Options(e) => e.source(),
            PatchCommandError::Engine(e) => e.source(),
            PatchCommandError::Finalize(e) => e.source(),
            PatchCommandError::Sign(e) => Some(e),
            PatchCommandError::Report(e) => Some(e),
        }
    }
}

impl From<CatalogError> for PatchCommandError {
    fn from(e: CatalogError) -> Self {
        PatchCommandError::Catalog(e)
    }
}

impl From<SelectionError> for PatchCommandError {
    fn from(e: SelectionError) -> Self {
        PatchCommandError::Selection(e)
    }
}

impl From<OptionsError> for PatchCommandError {
    fn from(e: OptionsError) -> Self {
        PatchCommandError::Options(e)
    }
}

impl From<EngineError> for PatchCommandError {
    fn from(e: EngineError) -> Self {
        PatchCommandError::Engine(e)
    }
}

impl From<FinalizeError> for PatchCommandError {
    fn from(e: FinalizeError) -> Self {
        PatchCommandError::Finalize(e)
    }
}

impl From<SignError> for PatchCommandError {
    fn from(e: SignError) -> Self {
        PatchCommandError::Sign(e)
    }
}

/// Files a run reads and writes besides the artifact and bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub output: PathBuf,
    pub temporary_files: PathBuf,
    pub options_file: PathBuf,
    pub keystore: PathBuf,
}

impl OutputPaths {
    /// Fill in every path the user did not give, next to the output.
    pub fn resolve(args: &PatchArgs, cwd: &Path) -> Self {
        let output = args.out.clone().unwrap_or_else(|| {
            let stem = args
                .artifact
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string());
            let name = match args.artifact.extension() {
                Some(ext) => format!("{}-patched.{}", stem, ext.to_string_lossy()),
                None => format!("{}-patched", stem),
            };
            cwd.join(name)
        });

        let out_dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
        let out_stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "patched".to_string());

        OutputPaths {
            temporary_files: args
                .temporary_files_path
                .clone()
                .unwrap_or_else(|| out_dir.join(format!("{}-temporary-files", out_stem))),
            options_file: args
                .options_file
                .clone()
                .unwrap_or_else(|| out_dir.join(format!("{}-options.json", out_stem))),
            keystore: args
                .keystore
                .clone()
                .unwrap_or_else(|| out_dir.join(format!("{}.keystore", out_stem))),
            output,
        }
    }
}

/// What a finished (or interrupted) run produced.
#[derive(Debug)]
pub struct PatchRun {
    pub ledger: ResultsLedger,
    pub status: RunStatus,
    /// Where the patched artifact was written, if the run got that far.
    pub output: Option<PathBuf>,
}

impl PatchRun {
    /// 0 when no patch failed, 1 when one did, 130 when interrupted.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Interrupted => 130,
            _ if self.ledger.is_failed() => 1,
            _ => 0,
        }
    }
}

/// Patch an artifact end to end, installing through adb when `-i` is given.
pub fn run(
    args: &PatchArgs,
    rules: &[SelectionRule],
    cancel: &CancelToken,
    sink: &mut dyn ProgressSink,
    out: &mut dyn Write,
) -> Result<PatchRun, PatchCommandError> {
    if !args.artifact.is_file() {
        return Err(PatchCommandError::ArtifactNotFound(args.artifact.clone()));
    }
    let installer = match &args.install {
        Some(serial) => {
            let mode = if args.mount {
                InstallMode::Mount
            } else {
                InstallMode::Normal
            };
            let connected = AdbInstaller::connect(serial.clone(), mode);
            Some(connected.map(|i| Box::new(i) as Box<dyn Installer>))
        }
        None => None,
    };
    run_with(args, rules, installer.transpose(), cancel, sink, out)
}

/// Patch an artifact end to end with an already connected installer.
///
/// Workflow:
/// 1. Check the inputs; a failed device lookup ends the run with a warning
/// 2. Load the catalog and validate the selection rules
/// 3. Open the artifact and resolve the patches to run
/// 4. Bind options and execute the patches with live progress
/// 5. Write, sign and install the patched artifact (skipped when interrupted)
/// 6. Purge temporary files and write the summary to `out`
pub fn run_with(
    args: &PatchArgs,
    rules: &[SelectionRule],
    installer: Result<Option<Box<dyn Installer>>, InstallError>,
    cancel: &CancelToken,
    sink: &mut dyn ProgressSink,
    out: &mut dyn Write,
) -> Result<PatchRun, PatchCommandError> {
    let started = Instant::now();
    let cwd = std::env::current_dir().unwrap_or_default();
    let paths = OutputPaths::resolve(args, &cwd);

    if !args.artifact.is_file() {
        return Err(PatchCommandError::ArtifactNotFound(args.artifact.clone()));
    }

    let mut orchestrator = Orchestrator::new();

    let installer = match installer {
        Ok(installer) => installer,
        Err(e) => {
            tracing::warn!(error = %e, "no device to install to");
            orchestrator.ledger_mut().add_warning(
                INSTALLATION,
                WarningKind::Installation,
                e.to_string(),
            );
            let ledger = orchestrator.finish(started.elapsed());
            write_summary(&ledger, out).map_err(PatchCommandError::Report)?;
            return Ok(PatchRun {
                ledger,
                status: RunStatus::NotStarted,
                output: None,
            });
        }
    };

    let catalog = Catalog::load(&args.bundles)?;
    validate_rules(&catalog, rules)?;
    tracing::info!(patches = catalog.len(), "loaded catalog");

    let mut engine = ArchiveEngine::open(&args.artifact)?;
    let package = engine.package().clone();
    let flags = ResolveFlags {
        exclusive: args.exclusive,
        force: args.force,
    };
    let selection = resolve(&catalog, rules, &package, flags, orchestrator.ledger_mut());

    let store = FileOptionStore::new(&paths.options_file);
    let bound = bind_options(&catalog, &selection, &store)?;
    tracing::info!(
        source = ?bound.source,
        options_file = %paths.options_file.display(),
        "bound patch options"
    );

    let patches = selection.patches(&catalog);
    let status = {
        let outcomes = engine.execute(&patches, &bound.values, cancel);
        orchestrator.run(patches.len(), outcomes, sink, cancel)?
    };

    let output = match status {
        RunStatus::Interrupted | RunStatus::NotStarted => None,
        RunStatus::Completed => {
            let patched = engine.into_patched();
            let file_name = paths
                .output
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "patched".into());
            let finalized = paths.temporary_files.join(file_name);
            finalize_artifact(&args.artifact, &patched, &args.rip_lib, &finalized)?;

            if args.unsigned || args.mount {
                copy_unsigned(&finalized, &paths.output)?;
            } else {
                let keystore = KeystoreDetails {
                    path: paths.keystore.clone(),
                    password: args.keystore_password.clone(),
                    alias: args.keystore_entry_alias.clone(),
                    entry_password: args.keystore_entry_password.clone(),
                };
                ApkSigner::new(keystore, &args.signer).sign(&finalized, &paths.output)?;
            }
            writeln!(out, "Saved patched artifact to {}", paths.output.display())
                .map_err(PatchCommandError::Report)?;

            if let Some(installer) = &installer {
                install(installer.as_ref(), &paths.output, &package, orchestrator.ledger_mut());
            }
            Some(paths.output.clone())
        }
    };

    if args.purge {
        purge(&paths.temporary_files);
    }

    let ledger = orchestrator.finish(started.elapsed());
    write_summary(&ledger, out).map_err(PatchCommandError::Report)?;
    Ok(PatchRun {
        ledger,
        status,
        output,
    })
}

fn install(
    installer: &dyn Installer,
    artifact: &Path,
    package: &PackageIdentity,
    ledger: &mut ResultsLedger,
) {
    let message = match installer.install(artifact, package) {
        Ok(InstallOutcome::Installed) => {
            tracing::info!(device = installer.target(), "installed patched artifact");
            return;
        }
        Ok(InstallOutcome::MountFailed) => {
            format!("failed to mount on {}", installer.target())
        }
        Ok(InstallOutcome::InstallFailed { detail }) => {
            format!("failed to install on {}: {}", installer.target(), detail)
        }
        Err(e) => e.to_string(),
    };
    ledger.add_warning(INSTALLATION, WarningKind::Installation, message);
}

fn purge(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => tracing::info!(path = %dir.display(), "purged temporary files"),
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "failed to purge temporary files"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{Args, Command, FromArgMatches};
    use splice_core::progress::NoProgress;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::fs::File;
    use std::io::Read;
    use tempfile::{tempdir, TempDir};
    use zip::write::SimpleFileOptions;
    use zip::{ZipArchive, ZipWriter};

    const BUNDLE: &str = r#"{"version": 1, "patches": [
        {"name": "Greeting",
         "options": [{"key": "name", "default": "world"}],
         "operations": [{"operation": "write", "entry": "res/greeting.txt",
                         "source": "files/greeting.txt", "template": true}]},
        {"name": "Broken",
         "use": false,
         "operations": [{"operation": "delete", "entry": "assets/gone.bin"},
                        {"operation": "write", "entry": "x", "source": "files/missing.txt"}]},
        {"name": "Strip",
         "compatible_packages": {"com.example": ["2.0"]},
         "operations": [{"operation": "delete", "entry": "assets/gone.bin"}]}
    ]}"#;

    struct Fixture {
        dir: TempDir,
        artifact: PathBuf,
        bundle: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir_all(bundle.join("files")).unwrap();
        fs::write(bundle.join("bundle.json"), BUNDLE).unwrap();
        fs::write(bundle.join("files/greeting.txt"), "hello {{name}}").unwrap();

        let artifact = dir.path().join("app.apk");
        let mut zip = ZipWriter::new(File::create(&artifact).unwrap());
        for (name, data) in [
            ("package.json", &br#"{"name": "com.example", "version": "1.0"}"#[..]),
            ("classes.dex", &b"dex"[..]),
            ("assets/gone.bin", &b"bin"[..]),
        ] {
            zip.start_file(name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();

        Fixture {
            dir,
            artifact,
            bundle,
        }
    }

    fn args(fixture: &Fixture, extra: &[&str]) -> (PatchArgs, Vec<SelectionRule>) {
        let out = fixture.dir.path().join("out").join("app-patched.apk");
        let mut argv = vec![
            "patch".to_string(),
            fixture.artifact.display().to_string(),
            "-p".to_string(),
            fixture.bundle.display().to_string(),
            "-o".to_string(),
            out.display().to_string(),
            "--unsigned".to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        let matches = PatchArgs::augment_args(Command::new("patch"))
            .try_get_matches_from(argv)
            .unwrap();
        let rules = crate::args::selection_rules(&matches).unwrap();
        (PatchArgs::from_arg_matches(&matches).unwrap(), rules)
    }

    fn entry(path: &Path, name: &str) -> Option<String> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut file = archive.by_name(name).ok()?;
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        Some(text)
    }

    fn run_patch(args: &PatchArgs, rules: &[SelectionRule]) -> (PatchRun, String) {
        let mut out = Vec::new();
        let run = run(args, rules, &CancelToken::new(), &mut NoProgress, &mut out).unwrap();
        (run, String::from_utf8(out).unwrap())
    }

    #[test]
    fn patches_with_defaults_and_generates_options_file() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &[]);

        let (run, summary) = run_patch(&args, &rules);

        assert_eq!(run.exit_code(), 0);
        let output = run.output.unwrap();
        assert_eq!(entry(&output, "res/greeting.txt").unwrap(), "hello world");
        assert!(entry(&output, "assets/gone.bin").is_some());
        assert_eq!(run.ledger.warnings().len(), 1);
        assert_eq!(run.ledger.skipped().len(), 1);

        let options = fs::read_to_string(output.with_file_name("app-patched-options.json")).unwrap();
        let options: serde_json::Value = serde_json::from_str(&options).unwrap();
        assert_eq!(options["Greeting"]["name"], "world");
        assert!(summary.contains("Saved patched artifact to"));
        assert!(summary.contains("All selected patches applied"));
    }

    #[test]
    fn option_overrides_reach_the_template() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &["-e", "Greeting", "-O", "name=Splice"]);

        let (run, _) = run_patch(&args, &rules);

        let output = run.output.unwrap();
        assert_eq!(entry(&output, "res/greeting.txt").unwrap(), "hello Splice");
    }

    #[test]
    fn failed_patch_fails_the_run_but_keeps_the_artifact() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &["-e", "Broken", "-f", "--purge"]);

        let (run, summary) = run_patch(&args, &rules);

        assert_eq!(run.exit_code(), 1);
        assert_eq!(run.ledger.failed()[0].name, "Broken");
        let output = run.output.unwrap();
        // Strip ran under --force; Broken's staged delete was discarded
        assert!(entry(&output, "assets/gone.bin").is_none());
        assert_eq!(run.ledger.succeeded().len(), 2);
        assert!(!fixture.dir.path().join("out/app-patched-temporary-files").exists());
        assert!(summary.contains("Failed:"));
    }

    #[test]
    fn failed_patch_changes_are_not_committed() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &["--exclusive", "-e", "Broken"]);

        let (run, _) = run_patch(&args, &rules);

        assert_eq!(run.exit_code(), 1);
        assert!(entry(&run.output.unwrap(), "assets/gone.bin").is_some());
    }

    #[test]
    fn interrupted_run_writes_no_artifact() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &[]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();

        let run = run(&args, &rules, &cancel, &mut NoProgress, &mut out).unwrap();

        assert_eq!(run.exit_code(), 130);
        assert!(run.output.is_none());
        assert!(!fixture.dir.path().join("out/app-patched.apk").exists());
    }

    #[test]
    fn unknown_patch_is_rejected_before_running() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &["-e", "Nope"]);
        let mut out = Vec::new();

        let result = run(&args, &rules, &CancelToken::new(), &mut NoProgress, &mut out);

        assert!(matches!(
            result,
            Err(PatchCommandError::Selection(SelectionError::UnknownPatch(_)))
        ));
        assert!(!fixture.dir.path().join("out").exists());
    }

    #[test]
    fn unknown_option_is_rejected() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &["-e", "Greeting", "-O", "colour=red"]);
        let mut out = Vec::new();

        let result = run(&args, &rules, &CancelToken::new(), &mut NoProgress, &mut out);

        assert!(matches!(
            result,
            Err(PatchCommandError::Options(OptionsError::UnknownOption { .. }))
        ));
    }

    #[test]
    fn missing_artifact_is_rejected() {
        let fixture = fixture();
        let (mut args, rules) = args(&fixture, &[]);
        args.artifact = fixture.dir.path().join("missing.apk");
        let mut out = Vec::new();

        let result = run(&args, &rules, &CancelToken::new(), &mut NoProgress, &mut out);

        assert!(matches!(result, Err(PatchCommandError::ArtifactNotFound(_))));
    }

    #[test]
    fn unreadable_artifact_is_an_engine_error() {
        let fixture = fixture();
        fs::write(&fixture.artifact, b"not a zip").unwrap();
        let (args, rules) = args(&fixture, &[]);
        let mut out = Vec::new();

        let result = run(&args, &rules, &CancelToken::new(), &mut NoProgress, &mut out);

        assert!(matches!(result, Err(PatchCommandError::Engine(_))));
    }

    struct FakeInstaller {
        outcome: InstallOutcome,
        installed: Rc<RefCell<Vec<(PathBuf, String)>>>,
    }

    impl Installer for FakeInstaller {
        fn target(&self) -> &str {
            "emulator-5554"
        }

        fn install(
            &self,
            artifact: &Path,
            package: &PackageIdentity,
        ) -> Result<InstallOutcome, InstallError> {
            self.installed
                .borrow_mut()
                .push((artifact.to_path_buf(), package.name.clone()));
            Ok(self.outcome.clone())
        }
    }

    fn run_installing(
        args: &PatchArgs,
        rules: &[SelectionRule],
        installer: Result<Option<Box<dyn Installer>>, InstallError>,
    ) -> (PatchRun, String) {
        let mut out = Vec::new();
        let run = run_with(args, rules, installer, &CancelToken::new(), &mut NoProgress, &mut out)
            .unwrap();
        (run, String::from_utf8(out).unwrap())
    }

    #[test]
    fn installs_the_saved_artifact() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &[]);
        let installed = Rc::new(RefCell::new(Vec::new()));
        let installer = FakeInstaller {
            outcome: InstallOutcome::Installed,
            installed: Rc::clone(&installed),
        };

        let (run, _) = run_installing(&args, &rules, Ok(Some(Box::new(installer))));

        assert_eq!(run.exit_code(), 0);
        assert!(run.ledger.warnings().iter().all(|w| w.kind != WarningKind::Installation));
        assert_eq!(
            *installed.borrow(),
            [(run.output.unwrap(), "com.example".to_string())]
        );
    }

    #[test]
    fn failed_install_is_a_warning_and_keeps_the_artifact() {
        for outcome in [
            InstallOutcome::MountFailed,
            InstallOutcome::InstallFailed {
                detail: "INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string(),
            },
        ] {
            let fixture = fixture();
            let (args, rules) = args(&fixture, &[]);
            let installer = FakeInstaller {
                outcome,
                installed: Rc::default(),
            };

            let (run, summary) = run_installing(&args, &rules, Ok(Some(Box::new(installer))));

            assert_eq!(run.exit_code(), 0);
            let output = run.output.unwrap();
            assert!(output.is_file());
            assert_eq!(entry(&output, "res/greeting.txt").unwrap(), "hello world");
            let warning = run
                .ledger
                .warnings()
                .iter()
                .find(|w| w.kind == WarningKind::Installation)
                .unwrap();
            assert_eq!(warning.subject, "Installation");
            assert!(warning.message.contains("emulator-5554"));
            assert!(summary.contains("! Installation [installation]: failed to"));
            assert!(summary.contains("All selected patches applied"));
        }
    }

    #[test]
    fn missing_device_ends_the_run_without_patching() {
        let fixture = fixture();
        let (args, rules) = args(&fixture, &[]);

        let (run, summary) = run_installing(
            &args,
            &rules,
            Err(InstallError::DeviceNotFound { serial: None }),
        );

        assert_eq!(run.status, RunStatus::NotStarted);
        assert_eq!(run.exit_code(), 0);
        assert!(run.output.is_none());
        assert_eq!(run.ledger.outcomes(), 0);
        assert!(!fixture.dir.path().join("out").exists());
        assert!(summary.contains("! Installation [installation]: no device connected"));
        assert!(!summary.contains("All selected patches applied"));
        assert!(summary.trim_end().ends_with("No patches were applied"));
    }

    #[test]
    fn default_paths_sit_next_to_the_output() {
        let fixture = fixture();
        let (mut args, _) = args(&fixture, &[]);
        args.out = None;

        let paths = OutputPaths::resolve(&args, Path::new("/work"));

        assert_eq!(paths.output, Path::new("/work/app-patched.apk"));
        assert_eq!(paths.temporary_files, Path::new("/work/app-patched-temporary-files"));
        assert_eq!(paths.options_file, Path::new("/work/app-patched-options.json"));
        assert_eq!(paths.keystore, Path::new("/work/app-patched.keystore"));
    }

    #[test]
    fn explicit_paths_win() {
        let fixture = fixture();
        let (mut args, _) = args(&fixture, &["-t", "/tmp/splice", "--options-file", "/cfg/o.json"]);
        args.keystore = Some(PathBuf::from("/keys/k.keystore"));

        let paths = OutputPaths::resolve(&args, Path::new("/work"));

        assert_eq!(paths.temporary_files, Path::new("/tmp/splice"));
        assert_eq!(paths.options_file, Path::new("/cfg/o.json"));
        assert_eq!(paths.keystore, Path::new("/keys/k.keystore"));
    }
}
