//! Rust toolchain bootstrap through rustup.
//!
//! The service is built on the host, so the host needs `cargo`. A missing
//! rustup installation is bootstrapped from the official installer script;
//! an existing one only gets the pinned channel and components added when
//! they are missing.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, failure_message};
use crate::fetch::ArchiveDownloader;
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

/// Where rustup's installer script is published.
pub const DEFAULT_INSTALLER_URL: &str = "https://sh.rustup.rs";

/// The pinned toolchain and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RustToolchain {
    channel: String,
    components: Vec<String>,
    cargo_home: Utf8PathBuf,
    installer_url: String,
}

/// Status describing what a convergence run installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ToolchainInstallStatus {
    /// rustup itself was bootstrapped.
    pub bootstrapped: bool,
    /// The channel was installed into an existing rustup.
    pub installed_channel: bool,
    /// Components were added.
    pub added_components: bool,
}

impl ToolchainInstallStatus {
    /// Whether anything was installed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.bootstrapped || self.installed_channel || self.added_components
    }
}

/// Everything the bootstrap needs from the outside world.
#[derive(Clone, Copy)]
pub struct ToolchainContext<'a> {
    /// Runs rustup and the installer script.
    pub executor: &'a dyn CommandExecutor,
    /// Fetches the installer script.
    pub downloader: &'a dyn ArchiveDownloader,
    /// Directory the installer script is downloaded to.
    pub scratch_dir: &'a Utf8Path,
    /// Limit for the installer and for `rustup toolchain install`.
    pub timeout: Duration,
}

impl RustToolchain {
    /// Describe a toolchain.
    #[must_use]
    pub fn new(
        channel: &str,
        components: Vec<String>,
        cargo_home: Utf8PathBuf,
        installer_url: &str,
    ) -> Self {
        Self {
            channel: channel.to_owned(),
            components,
            cargo_home,
            installer_url: installer_url.to_owned(),
        }
    }

    /// The pinned channel, e.g. `stable` or `1.88.0`.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Path of the `cargo` proxy used for service builds.
    #[must_use]
    pub fn cargo(&self) -> Utf8PathBuf {
        self.cargo_home.join("bin/cargo")
    }

    fn rustup(&self) -> Utf8PathBuf {
        self.cargo_home.join("bin/rustup")
    }

    /// Whether a rustup installation exists under the cargo home.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.cargo().is_file()
    }

    /// Install whatever part of the toolchain is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NetworkFailure`] if the installer script
    /// cannot be fetched and [`ProvisionError::ToolchainInstall`] if rustup
    /// fails.
    pub fn ensure_installed(&self, context: &ToolchainContext<'_>) -> Result<ToolchainInstallStatus> {
        let mut status = ToolchainInstallStatus::default();

        if self.is_installed() {
            log::debug!("rustup found at {}", self.cargo_home);
        } else {
            self.bootstrap(context)?;
            status.bootstrapped = true;
        }

        if !status.bootstrapped && !self.channel_installed(context)? {
            self.install_channel(context)?;
            status.installed_channel = true;
        }

        status.added_components = self.install_missing_components(context)?;
        Ok(status)
    }

    fn bootstrap(&self, context: &ToolchainContext<'_>) -> Result<()> {
        log::info!("bootstrapping rustup into {}", self.cargo_home);
        std::fs::create_dir_all(context.scratch_dir)?;
        let scratch = tempfile::tempdir_in(context.scratch_dir)?;
        let script = scratch.path().join("rustup-init.sh");
        context
            .downloader
            .download(&self.installer_url, &script)
            .map_err(|e| ProvisionError::NetworkFailure {
                url: self.installer_url.clone(),
                reason: e.to_string(),
            })?;

        let script = script.to_string_lossy();
        let cargo_home = format!("CARGO_HOME={}", self.cargo_home);
        let args = [
            cargo_home.as_str(),
            "sh",
            script.as_ref(),
            "-y",
            "--no-modify-path",
            "--profile",
            "minimal",
            "--default-toolchain",
            self.channel.as_str(),
        ];
        let output = context
            .executor
            .run_with_timeout("env", &args, context.timeout)?;
        if !output.status.success() {
            return Err(self.install_error(failure_message(&output)));
        }
        if !self.is_installed() {
            return Err(self.install_error(format!("installer finished but {} is missing", self.cargo())));
        }
        Ok(())
    }

    fn channel_installed(&self, context: &ToolchainContext<'_>) -> Result<bool> {
        let rustup = self.rustup();
        let output = context.executor.run_with_timeout(
            rustup.as_str(),
            &["run", self.channel.as_str(), "rustc", "--version"],
            context.timeout,
        )?;
        Ok(output.status.success())
    }

    fn install_channel(&self, context: &ToolchainContext<'_>) -> Result<()> {
        log::info!("installing toolchain {}", self.channel);
        let rustup = self.rustup();
        let output = context.executor.run_with_timeout(
            rustup.as_str(),
            &["toolchain", "install", self.channel.as_str(), "--profile", "minimal"],
            context.timeout,
        )?;
        if output.status.success() {
            return Ok(());
        }
        Err(self.install_error(failure_message(&output)))
    }

    fn install_missing_components(&self, context: &ToolchainContext<'_>) -> Result<bool> {
        if self.components.is_empty() {
            return Ok(false);
        }

        let rustup = self.rustup();
        let output = context.executor.run_with_timeout(
            rustup.as_str(),
            &["component", "list", "--installed", "--toolchain", self.channel.as_str()],
            context.timeout,
        )?;
        if !output.status.success() {
            return Err(self.install_error(failure_message(&output)));
        }
        let installed = String::from_utf8_lossy(&output.stdout);
        let missing = missing_components(&self.components, &installed);
        if missing.is_empty() {
            return Ok(false);
        }

        log::info!("adding components {}", missing.join(", "));
        let mut args = vec!["component", "add", "--toolchain", self.channel.as_str()];
        args.extend(missing.iter().map(String::as_str));
        let output = context
            .executor
            .run_with_timeout(rustup.as_str(), &args, context.timeout)?;
        if output.status.success() {
            return Ok(true);
        }
        Err(self.install_error(failure_message(&output)))
    }

    fn install_error(&self, message: String) -> ProvisionError {
        ProvisionError::ToolchainInstall {
            toolchain: self.channel.clone(),
            message,
        }
    }
}

/// Components not listed by `rustup component list --installed`.
///
/// Target-specific components are listed with a triple suffix (`clippy` as
/// `clippy-aarch64-unknown-linux-gnu`), target-independent ones bare.
fn missing_components(wanted: &[String], installed: &str) -> Vec<String> {
    wanted
        .iter()
        .filter(|component| {
            !installed.lines().map(str::trim).any(|line| {
                line == component.as_str()
                    || line
                        .strip_prefix(component.as_str())
                        .and_then(|rest| rest.strip_prefix('-'))
                        .is_some_and(|target| target.contains('-'))
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{DownloadError, MockArchiveDownloader};
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, success_output};
    use std::fs;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn cargo_home() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("temp dir");
        let home = Utf8PathBuf::try_from(temp.path().join("cargo")).expect("UTF-8 path");
        (temp, home)
    }

    fn seed_rustup(home: &Utf8Path) {
        fs::create_dir_all(home.join("bin")).expect("bin dir");
        fs::write(home.join("bin/cargo"), b"").expect("cargo");
        fs::write(home.join("bin/rustup"), b"").expect("rustup");
    }

    fn rustup_path(home: &Utf8Path) -> &'static str {
        Box::leak(home.join("bin/rustup").into_string().into_boxed_str())
    }

    fn unused_downloader() -> MockArchiveDownloader {
        let mut downloader = MockArchiveDownloader::new();
        downloader.expect_download().times(0);
        downloader
    }

    #[test]
    fn existing_channel_needs_no_changes() {
        let (temp, home) = cargo_home();
        seed_rustup(&home);
        let toolchain = RustToolchain::new("stable", Vec::new(), home.clone(), DEFAULT_INSTALLER_URL);
        let rustup = rustup_path(&home);
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: rustup,
            args: vec!["run", "stable", "rustc", "--version"],
            result: Ok(success_output()),
        }]);
        let downloader = unused_downloader();
        let scratch = Utf8PathBuf::try_from(temp.path().join("scratch")).expect("UTF-8");
        let context = ToolchainContext {
            executor: &executor,
            downloader: &downloader,
            scratch_dir: &scratch,
            timeout: TIMEOUT,
        };

        let status = toolchain.ensure_installed(&context).expect("ensure");
        assert!(!status.changed());
        executor.assert_finished();
    }

    #[test]
    fn missing_channel_is_installed() {
        let (temp, home) = cargo_home();
        seed_rustup(&home);
        let toolchain = RustToolchain::new("1.88.0", Vec::new(), home.clone(), DEFAULT_INSTALLER_URL);
        let rustup = rustup_path(&home);
        let executor = StubExecutor::new(vec![
            ExpectedCall {
                cmd: rustup,
                args: vec!["run", "1.88.0", "rustc", "--version"],
                result: Ok(failure_output("error: toolchain '1.88.0' is not installed")),
            },
            ExpectedCall {
                cmd: rustup,
                args: vec!["toolchain", "install", "1.88.0", "--profile", "minimal"],
                result: Ok(success_output()),
            },
        ]);
        let downloader = unused_downloader();
        let scratch = Utf8PathBuf::try_from(temp.path().join("scratch")).expect("UTF-8");
        let context = ToolchainContext {
            executor: &executor,
            downloader: &downloader,
            scratch_dir: &scratch,
            timeout: TIMEOUT,
        };

        let status = toolchain.ensure_installed(&context).expect("ensure");
        assert!(status.installed_channel);
        assert!(!status.bootstrapped);
    }

    #[test]
    fn unreachable_installer_is_a_network_failure() {
        let (temp, home) = cargo_home();
        let toolchain = RustToolchain::new("stable", Vec::new(), home, DEFAULT_INSTALLER_URL);
        let executor = StubExecutor::new(Vec::new());
        let mut downloader = MockArchiveDownloader::new();
        downloader.expect_download().times(1).returning(|url, _| {
            Err(DownloadError::HttpError {
                url: url.to_owned(),
                reason: "dns error".to_owned(),
            })
        });
        let scratch = Utf8PathBuf::try_from(temp.path().join("scratch")).expect("UTF-8");
        let context = ToolchainContext {
            executor: &executor,
            downloader: &downloader,
            scratch_dir: &scratch,
            timeout: TIMEOUT,
        };

        let err = toolchain.ensure_installed(&context).expect_err("must fail");
        assert!(matches!(err, ProvisionError::NetworkFailure { .. }));
        executor.assert_finished();
    }

    #[test]
    fn components_with_target_suffix_count_as_installed() {
        let installed = "cargo-aarch64-unknown-linux-gnu\nclippy-aarch64-unknown-linux-gnu\nrust-src\n";
        let wanted = vec![
            "clippy".to_owned(),
            "rust-src".to_owned(),
            "rustfmt".to_owned(),
            "rust".to_owned(),
        ];
        assert_eq!(missing_components(&wanted, installed), vec!["rustfmt", "rust"]);
    }
}
