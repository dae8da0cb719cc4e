//! Signing the finalized artifact with external tools.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Store password used when none is given, both when generating a keystore
/// and when signing with it.
pub const DEFAULT_KEYSTORE_PASSWORD: &str = "splice-keystore";

#[derive(Debug)]
pub enum SignError {
    /// The signing tool could not be started.
    ToolNotFound { program: PathBuf, source: io::Error },
    /// The tool ran but exited unsuccessfully.
    ToolFailed { program: PathBuf, exit_code: Option<i32>, stderr: String },
    Io(io::Error),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::ToolNotFound { program, .. } => {
                write!(f, "could not run {}", program.display())
            }
            SignError::ToolFailed { program, exit_code, stderr } => {
                match exit_code {
                    Some(code) => write!(f, "{} exited with code {}", program.display(), code)?,
                    None => write!(f, "{} was terminated", program.display())?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            SignError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignError::ToolNotFound { source, .. } => Some(source),
            SignError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SignError {
    fn from(e: io::Error) -> Self {
        SignError::Io(e)
    }
}

/// Where the signing key lives and how to unlock it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreDetails {
    pub path: PathBuf,
    pub password: Option<String>,
    pub alias: String,
    pub entry_password: Option<String>,
}

impl KeystoreDetails {
    fn store_password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_KEYSTORE_PASSWORD)
    }

    fn key_password(&self) -> &str {
        self.entry_password
            .as_deref()
            .unwrap_or_else(|| self.store_password())
    }
}

pub trait Signer {
    /// Sign `input`, writing the signed artifact to `output`.
    fn sign(&self, input: &Path, output: &Path) -> Result<(), SignError>;
}

/// Signs with `apksigner`, generating the keystore with `keytool` when it
/// does not exist yet.
#[derive(Debug, Clone)]
pub struct ApkSigner {
    keystore: KeystoreDetails,
    signer_name: String,
    apksigner: PathBuf,
    keytool: PathBuf,
}

impl ApkSigner {
    pub fn new(keystore: KeystoreDetails, signer_name: impl Into<String>) -> Self {
        Self {
            keystore,
            signer_name: signer_name.into(),
            apksigner: PathBuf::from("apksigner"),
            keytool: PathBuf::from("keytool"),
        }
    }

    /// Use other executables than the ones on `PATH`.
    pub fn with_programs(
        mut self,
        apksigner: impl Into<PathBuf>,
        keytool: impl Into<PathBuf>,
    ) -> Self {
        self.apksigner = apksigner.into();
        self.keytool = keytool.into();
        self
    }

    pub fn keystore(&self) -> &KeystoreDetails {
        &self.keystore
    }

    fn keytool_args(&self) -> Vec<OsString> {
        let ks = &self.keystore;
        let mut args: Vec<OsString> = vec!["-genkeypair".into(), "-keystore".into()];
        args.push(ks.path.clone().into());
        for arg in [
            "-storetype",
            "PKCS12",
            "-storepass",
            ks.store_password(),
            "-alias",
            ks.alias.as_str(),
            "-keypass",
            ks.key_password(),
            "-keyalg",
            "RSA",
            "-keysize",
            "2048",
            "-validity",
            "10000",
            "-dname",
        ] {
            args.push(arg.into());
        }
        args.push(format!("CN={}", self.signer_name).into());
        args
    }

    fn apksigner_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let ks = &self.keystore;
        let mut args: Vec<OsString> = vec!["sign".into(), "--ks".into()];
        args.push(ks.path.clone().into());
        args.push("--ks-pass".into());
        args.push(format!("pass:{}", ks.store_password()).into());
        args.push("--ks-key-alias".into());
        args.push(ks.alias.clone().into());
        args.push("--key-pass".into());
        args.push(format!("pass:{}", ks.key_password()).into());
        args.push("--v1-signer-name".into());
        args.push(self.signer_name.clone().into());
        args.push("--out".into());
        args.push(output.into());
        args.push(input.into());
        args
    }

    fn ensure_keystore(&self) -> Result<(), SignError> {
        if self.keystore.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.keystore.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        tracing::info!(keystore = %self.keystore.path.display(), "generating keystore");
        run_tool(&self.keytool, self.keytool_args())
    }
}

impl Signer for ApkSigner {
    fn sign(&self, input: &Path, output: &Path) -> Result<(), SignError> {
        self.ensure_keystore()?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        run_tool(&self.apksigner, self.apksigner_args(input, output))?;
        tracing::info!(output = %output.display(), signer = %self.signer_name, "signed artifact");
        Ok(())
    }
}

fn run_tool(program: &Path, args: Vec<OsString>) -> Result<(), SignError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| SignError::ToolNotFound {
            program: program.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(SignError::ToolFailed {
            program: program.to_path_buf(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Copy the unsigned artifact to `output` byte for byte.
pub fn copy_unsigned(input: &Path, output: &Path) -> Result<(), SignError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(input, output)?;
    tracing::info!(output = %output.display(), "copied unsigned artifact");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn details(path: PathBuf) -> KeystoreDetails {
        KeystoreDetails {
            path,
            password: None,
            alias: "Splice Key".to_string(),
            entry_password: None,
        }
    }

    #[test]
    fn apksigner_receives_keystore_coordinates() {
        let signer = ApkSigner::new(
            KeystoreDetails {
                entry_password: Some("entry".to_string()),
                ..details(PathBuf::from("/keys/app.keystore"))
            },
            "Splice",
        );

        let args = signer.apksigner_args(Path::new("in.apk"), Path::new("out.apk"));

        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "sign",
                "--ks",
                "/keys/app.keystore",
                "--ks-pass",
                "pass:splice-keystore",
                "--ks-key-alias",
                "Splice Key",
                "--key-pass",
                "pass:entry",
                "--v1-signer-name",
                "Splice",
                "--out",
                "out.apk",
                "in.apk",
            ]
        );
    }

    #[test]
    fn keytool_uses_signer_name_as_subject() {
        let signer = ApkSigner::new(details(PathBuf::from("k.keystore")), "Splice");

        let args = signer.keytool_args();

        assert_eq!(args.last().unwrap(), "CN=Splice");
        assert!(args.iter().any(|a| a == "splice-keystore"));
    }

    #[test]
    fn missing_tool_is_reported() {
        let dir = tempdir().unwrap();
        let keystore = dir.path().join("app.keystore");
        fs::write(&keystore, b"existing").unwrap();
        let signer = ApkSigner::new(details(keystore), "Splice")
            .with_programs(dir.path().join("no-apksigner"), dir.path().join("no-keytool"));

        let result = signer.sign(&dir.path().join("in.apk"), &dir.path().join("out.apk"));

        assert!(matches!(result, Err(SignError::ToolNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_exit_code() {
        let dir = tempdir().unwrap();
        let keystore = dir.path().join("app.keystore");
        fs::write(&keystore, b"existing").unwrap();
        let signer = ApkSigner::new(details(keystore), "Splice").with_programs("false", "false");

        let result = signer.sign(&dir.path().join("in.apk"), &dir.path().join("out.apk"));

        match result {
            Err(SignError::ToolFailed { exit_code, .. }) => assert_eq!(exit_code, Some(1)),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[test]
    fn copy_unsigned_is_verbatim() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("patched.apk");
        let output = dir.path().join("out").join("app-patched.apk");
        fs::write(&input, b"artifact bytes").unwrap();

        copy_unsigned(&input, &output).unwrap();

        assert_eq!(fs::read(&output).unwrap(), b"artifact bytes");
    }
}
