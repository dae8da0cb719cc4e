//! Installing the finalized artifact on a device through `adb`.

use crate::selection::PackageIdentity;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Directory on the device that mounted artifacts are pushed to.
const MOUNT_STAGING_DIR: &str = "/data/local/tmp/splice";

#[derive(Debug)]
pub enum InstallError {
    /// `adb` could not be started.
    ToolNotFound { program: PathBuf, source: io::Error },
    /// No device is attached, or not the one asked for.
    DeviceNotFound { serial: Option<String> },
    /// `adb devices` itself failed.
    ListDevices { stderr: String },
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::ToolNotFound { program, .. } => {
                write!(f, "could not run {}", program.display())
            }
            InstallError::DeviceNotFound { serial: Some(serial) } => {
                write!(f, "device '{}' not found", serial)
            }
            InstallError::DeviceNotFound { serial: None } => write!(f, "no device connected"),
            InstallError::ListDevices { stderr } => {
                write!(f, "failed to list devices: {}", stderr)
            }
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstallError::ToolNotFound { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Regular package install.
    #[default]
    Normal,
    /// Bind-mount over the installed package's base artifact (requires root).
    Mount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    MountFailed,
    InstallFailed { detail: String },
}

pub trait Installer {
    /// Serial of the device being installed to.
    fn target(&self) -> &str;

    fn install(
        &self,
        artifact: &Path,
        package: &PackageIdentity,
    ) -> Result<InstallOutcome, InstallError>;
}

/// Parse `adb devices` output into the serials of ready devices.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

fn parse_package_path(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("package:"))
        .filter(|path| !path.is_empty())
}

#[derive(Debug, Clone)]
pub struct AdbInstaller {
    program: PathBuf,
    serial: String,
    mode: InstallMode,
}

impl AdbInstaller {
    /// Find the device to install to: `serial` if given, otherwise the first
    /// ready device.
    pub fn connect(serial: Option<String>, mode: InstallMode) -> Result<Self, InstallError> {
        Self::connect_with("adb", serial, mode)
    }

    pub fn connect_with(
        program: impl Into<PathBuf>,
        serial: Option<String>,
        mode: InstallMode,
    ) -> Result<Self, InstallError> {
        let program = program.into();
        let output = run(&program, &["devices"])?;
        if !output.status.success() {
            return Err(InstallError::ListDevices {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let devices = parse_devices(&String::from_utf8_lossy(&output.stdout));
        let serial = match serial {
            Some(serial) if devices.contains(&serial) => serial,
            Some(serial) => return Err(InstallError::DeviceNotFound { serial: Some(serial) }),
            None => devices
                .into_iter()
                .next()
                .ok_or(InstallError::DeviceNotFound { serial: None })?,
        };
        tracing::info!(device = %serial, ?mode, "connected to device");
        Ok(Self { program, serial, mode })
    }

    pub fn mode(&self) -> InstallMode {
        self.mode
    }

    fn adb(&self, args: &[&str]) -> Result<Output, InstallError> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        run(&self.program, &full)
    }

    fn install_normal(&self, artifact: &Path) -> Result<InstallOutcome, InstallError> {
        let artifact = artifact.to_string_lossy();
        let output = self.adb(&["install", "-r", &artifact])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && stdout.contains("Success") {
            return Ok(InstallOutcome::Installed);
        }
        Ok(InstallOutcome::InstallFailed {
            detail: failure_detail(&output),
        })
    }

    fn install_mount(
        &self,
        artifact: &Path,
        package: &PackageIdentity,
    ) -> Result<InstallOutcome, InstallError> {
        let output = self.adb(&["shell", "pm", "path", &package.name])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(base) = parse_package_path(&stdout) else {
            tracing::warn!(package = %package.name, "package is not installed on the device");
            return Ok(InstallOutcome::MountFailed);
        };

        let staged = format!("{}/{}.apk", MOUNT_STAGING_DIR, package.name);
        let artifact = artifact.to_string_lossy();
        let mount = mount_command(&staged, base);
        let steps: [Vec<&str>; 3] = [
            vec!["shell", "mkdir", "-p", MOUNT_STAGING_DIR],
            vec!["push", &*artifact, staged.as_str()],
            vec!["shell", "su", "-c", mount.as_str()],
        ];
        for step in &steps {
            let output = self.adb(step)?;
            if !output.status.success() {
                tracing::warn!(step = ?step, detail = %failure_detail(&output), "mount step failed");
                return Ok(InstallOutcome::MountFailed);
            }
        }
        Ok(InstallOutcome::Installed)
    }
}

impl Installer for AdbInstaller {
    fn target(&self) -> &str {
        &self.serial
    }

    fn install(
        &self,
        artifact: &Path,
        package: &PackageIdentity,
    ) -> Result<InstallOutcome, InstallError> {
        let outcome = match self.mode {
            InstallMode::Normal => self.install_normal(artifact)?,
            InstallMode::Mount => self.install_mount(artifact, package)?,
        };
        tracing::info!(device = %self.serial, ?outcome, "install finished");
        Ok(outcome)
    }
}

/// `adb shell` joins its arguments into one device command line, so the
/// command handed to `su -c` has to arrive as a single quoted word.
fn mount_command(staged: &str, base: &str) -> String {
    format!("'mount -o bind {} {}'", staged, base)
}

fn run(program: &Path, args: &[&str]) -> Result<Output, InstallError> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| InstallError::ToolNotFound {
            program: program.to_path_buf(),
            source,
        })
}

fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    detail.trim().to_string()
}
