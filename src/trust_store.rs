//! Platform trust-store integration for the root certificate.
//!
//! Installation shells out to the tools each platform ships (`trust`,
//! `update-ca-certificates`, `security`). When none of them work the caller
//! gets manual instructions instead of an error, since installing a root is
//! something the user may well prefer to do by hand.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::Context;

/// Where `update-ca-certificates` picks up local roots
const LINUX_SYSTEM_CERT_INSTALL_PATH: &str = "/usr/local/share/ca-certificates/ethlink-root.crt";

/// Where p11-kit based distributions keep anchors added with `trust anchor`
const LINUX_ANCHOR_DIR: &str = "/etc/pki/ca-trust/source/anchors";

/// Result of an installation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { method: &'static str, details: String },
    Manual { details: String },
}

impl InstallOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, InstallOutcome::Installed { .. })
    }
}

/// Platform collaborator that trusts a root certificate system-wide
pub trait TrustStore: Send + Sync {
    /// Install the PEM certificate at `cert_path`
    fn install(&self, cert_path: &Path) -> anyhow::Result<InstallOutcome>;

    /// Whether the certificate at `cert_path` is already trusted
    fn is_trusted(&self, cert_path: &Path) -> bool;

    /// Human-readable steps for installing `cert_path` by hand
    fn manual_install_instructions(&self, cert_path: &Path) -> String;
}

/// Trust store of the machine the gateway runs on
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTrustStore;

impl TrustStore for SystemTrustStore {
    fn install(&self, cert_path: &Path) -> anyhow::Result<InstallOutcome> {
        if !cert_path.exists() {
            anyhow::bail!(
                "root certificate not found at {}; start the gateway once to create it",
                cert_path.display()
            );
        }

        #[cfg(target_os = "macos")]
        {
            install_macos(cert_path)
        }

        #[cfg(target_os = "linux")]
        {
            install_linux(cert_path)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Ok(InstallOutcome::Manual {
                details: self.manual_install_instructions(cert_path),
            })
        }
    }

    fn is_trusted(&self, cert_path: &Path) -> bool {
        let Ok(ours) = fs::read(cert_path) else {
            return false;
        };

        #[cfg(target_os = "macos")]
        {
            let _ = ours;
            Command::new("security")
                .arg("verify-cert")
                .arg("-c")
                .arg(cert_path)
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false)
        }

        #[cfg(not(target_os = "macos"))]
        {
            if fs::read(LINUX_SYSTEM_CERT_INSTALL_PATH).is_ok_and(|installed| installed == ours) {
                return true;
            }
            fs::read_dir(LINUX_ANCHOR_DIR)
                .map(|entries| {
                    entries
                        .flatten()
                        .any(|entry| fs::read(entry.path()).is_ok_and(|anchor| anchor == ours))
                })
                .unwrap_or(false)
        }
    }

    fn manual_install_instructions(&self, cert_path: &Path) -> String {
        manual_instructions(env::consts::OS, cert_path)
    }
}

fn manual_instructions(os: &str, cert_path: &Path) -> String {
    match os {
        "macos" => format!(
            "Manual install:\n- sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {}",
            cert_path.display()
        ),
        "linux" => format!(
            "Manual install options:\n- Debian/Ubuntu: sudo cp {} {} && sudo update-ca-certificates\n- Fedora/RHEL/Arch: sudo trust anchor {}",
            cert_path.display(),
            LINUX_SYSTEM_CERT_INSTALL_PATH,
            cert_path.display()
        ),
        "windows" => format!(
            "Manual install:\n- certutil -addstore -f ROOT {}",
            cert_path.display()
        ),
        other => format!(
            "Automatic install is not available on {}. Import {} into your browser or system trust store as a root authority.",
            other,
            cert_path.display()
        ),
    }
}

#[cfg(target_os = "macos")]
fn install_macos(cert_path: &Path) -> anyhow::Result<InstallOutcome> {
    if !command_exists("security") {
        return Ok(InstallOutcome::Manual {
            details: format!(
                "`security` command not found.\n{}",
                manual_instructions("macos", cert_path)
            ),
        });
    }

    let Some(home) = env::var_os("HOME") else {
        return Ok(InstallOutcome::Manual {
            details: format!("HOME is not set.\n{}", manual_instructions("macos", cert_path)),
        });
    };
    let keychain = Path::new(&home).join("Library/Keychains/login.keychain-db");

    let output = Command::new("security")
        .arg("add-trusted-cert")
        .arg("-d")
        .arg("-r")
        .arg("trustRoot")
        .arg("-k")
        .arg(&keychain)
        .arg(cert_path)
        .output()
        .context("run `security add-trusted-cert`")?;

    if output.status.success() {
        return Ok(InstallOutcome::Installed {
            method: "security",
            details: format!("added {} to the login keychain", cert_path.display()),
        });
    }

    Ok(InstallOutcome::Manual {
        details: format!(
            "`security add-trusted-cert` failed ({}).\n{}",
            failure_summary(&output),
            manual_instructions("macos", cert_path)
        ),
    })
}

#[cfg(target_os = "linux")]
fn install_linux(cert_path: &Path) -> anyhow::Result<InstallOutcome> {
    let mut failures = Vec::new();

    if command_exists("trust") {
        let output = Command::new("trust")
            .arg("anchor")
            .arg(cert_path)
            .output()
            .context("run `trust anchor`")?;
        if output.status.success() {
            return Ok(InstallOutcome::Installed {
                method: "trust",
                details: format!("added {} with `trust anchor`", cert_path.display()),
            });
        }
        failures.push(format!("`trust anchor` failed ({})", failure_summary(&output)));
    } else {
        failures.push("`trust` command not found".to_string());
    }

    if command_exists("update-ca-certificates") {
        let target = Path::new(LINUX_SYSTEM_CERT_INSTALL_PATH);
        match fs::copy(cert_path, target) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                failures.push(format!("permission denied writing {}", target.display()));
                return Ok(InstallOutcome::Manual {
                    details: format!(
                        "installing requires elevated permissions: {}.\n{}",
                        failures.join("; "),
                        manual_instructions("linux", cert_path)
                    ),
                });
            }
            Err(e) => failures.push(format!("copy to {} failed: {}", target.display(), e)),
        }

        let output = Command::new("update-ca-certificates")
            .output()
            .context("run `update-ca-certificates`")?;
        if output.status.success() {
            return Ok(InstallOutcome::Installed {
                method: "update-ca-certificates",
                details: format!("copied root to {} and refreshed the store", target.display()),
            });
        }
        failures.push(format!(
            "`update-ca-certificates` failed ({})",
            failure_summary(&output)
        ));
    } else {
        failures.push("`update-ca-certificates` command not found".to_string());
    }

    Ok(InstallOutcome::Manual {
        details: format!(
            "automatic install was not successful: {}.\n{}",
            failures.join("; "),
            manual_instructions("linux", cert_path)
        ),
    })
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn command_exists(name: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn failure_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    match output.status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Trust store that records installs instead of touching the system
    #[derive(Debug, Default)]
    pub struct RecordingTrustStore {
        pub installs: AtomicUsize,
    }

    impl TrustStore for RecordingTrustStore {
        fn install(&self, _cert_path: &Path) -> anyhow::Result<InstallOutcome> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(InstallOutcome::Installed {
                method: "recording",
                details: String::new(),
            })
        }

        fn is_trusted(&self, _cert_path: &Path) -> bool {
            self.installs.load(Ordering::SeqCst) > 0
        }

        fn manual_install_instructions(&self, cert_path: &Path) -> String {
            manual_instructions("linux", cert_path)
        }
    }
}
