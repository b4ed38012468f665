//! Registering the root certificate with the host trust store.
//!
//! Registration runs at user scope so it never needs elevated privileges.
//! It can pop up a confirmation dialog, so a sentinel file records that it
//! was attempted successfully and later startups skip it.

use crate::ca::CA_CERT_FILE;
use crate::error::TrustError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

pub const TRUST_FLAG_FILE: &str = "cert_installed.flag";

/// Something that can add a root certificate to a trust store.
pub trait TrustInstaller: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    fn install(&self, cert: &Path) -> Result<(), TrustError>;
}

/// What `ensure_trusted` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    AlreadyTrusted,
    Installed,
}

/// Register `<dir>/ca.crt` unless the trust flag says it already was.
///
/// The flag is written only after the installer reports success; on failure
/// it stays absent so the next startup tries again.
pub fn ensure_trusted(
    dir: &Path,
    installer: &dyn TrustInstaller,
) -> Result<TrustOutcome, TrustError> {
    let flag = dir.join(TRUST_FLAG_FILE);
    if flag.exists() {
        return Ok(TrustOutcome::AlreadyTrusted);
    }

    let cert = dir.join(CA_CERT_FILE);
    if !cert.is_file() {
        return Err(TrustError::MissingCertificate(cert));
    }
    let cert = std::path::absolute(&cert).unwrap_or(cert);

    info!(
        "Installing {} into the user trust store via {}",
        cert.display(),
        installer.name()
    );
    info!("The system may ask for confirmation; accept it to trust the bridge");

    if let Err(e) = installer.install(&cert) {
        warn!("Root certificate installation failed: {}", e);
        return Err(e);
    }

    fs::write(&flag, "installed").map_err(|source| TrustError::Flag {
        path: flag.clone(),
        source,
    })?;
    info!("Root certificate installed (confirm you accepted any system prompt)");

    Ok(TrustOutcome::Installed)
}

/// Runs an external trust utility and treats exit status 0 as success.
pub struct CommandInstaller {
    program: &'static str,
    args: fn(&Path) -> Result<Vec<String>, TrustError>,
}

impl CommandInstaller {
    pub fn new(
        program: &'static str,
        args: fn(&Path) -> Result<Vec<String>, TrustError>,
    ) -> Self {
        Self { program, args }
    }

    /// `certutil -addstore -user Root` (current-user Trusted Root store).
    pub fn windows() -> Self {
        Self::new("certutil", |cert| {
            Ok(vec![
                "-addstore".into(),
                "-user".into(),
                "Root".into(),
                cert.display().to_string(),
            ])
        })
    }

    /// `security add-trusted-cert` into the login keychain.
    pub fn macos() -> Self {
        Self::new("security", |cert| keychain_args(cert, dirs::home_dir()))
    }

    /// NSS `certutil` against the per-user database browsers read on Linux.
    pub fn nss() -> Self {
        Self::new("certutil", |cert| nssdb_args(cert, dirs::home_dir()))
    }

    fn command_line(&self, cert: &Path) -> Result<Vec<String>, TrustError> {
        (self.args)(cert)
    }
}

impl TrustInstaller for CommandInstaller {
    fn name(&self) -> &'static str {
        self.program
    }

    fn install(&self, cert: &Path) -> Result<(), TrustError> {
        let output = Command::new(self.program)
            .args(self.command_line(cert)?)
            .output()
            .map_err(|source| TrustError::Spawn {
                program: self.program,
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TrustError::Rejected {
                program: self.program,
                status: output.status,
                output: format!(
                    "{} {}",
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

/// The installer for the platform this binary was built for.
pub fn platform_installer() -> Arc<dyn TrustInstaller> {
    if cfg!(windows) {
        Arc::new(CommandInstaller::windows())
    } else if cfg!(target_os = "macos") {
        Arc::new(CommandInstaller::macos())
    } else {
        Arc::new(CommandInstaller::nss())
    }
}

fn keychain_args(cert: &Path, home: Option<PathBuf>) -> Result<Vec<String>, TrustError> {
    let keychain = home
        .ok_or(TrustError::NoHomeDirectory)?
        .join("Library/Keychains/login.keychain-db");
    Ok(vec![
        "add-trusted-cert".into(),
        "-r".into(),
        "trustRoot".into(),
        "-k".into(),
        keychain.display().to_string(),
        cert.display().to_string(),
    ])
}

fn nssdb_args(cert: &Path, home: Option<PathBuf>) -> Result<Vec<String>, TrustError> {
    let db = home.ok_or(TrustError::NoHomeDirectory)?.join(".pki/nssdb");
    Ok(vec![
        "-d".into(),
        format!("sql:{}", db.display()),
        "-A".into(),
        "-t".into(),
        "C,,".into(),
        "-n".into(),
        "ukey-bridge root".into(),
        "-i".into(),
        cert.display().to_string(),
    ])
}
