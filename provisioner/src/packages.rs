//! OS package convergence through apt.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, failure_message};
use std::time::Duration;

/// The OS package manager.
#[cfg_attr(test, mockall::automock)]
pub trait PackageManager {
    /// Whether `name` is currently installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the package database cannot be queried.
    fn is_installed(&self, name: &str) -> Result<bool>;

    /// Install every package in `names` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::PackageInstall`] if the transaction fails.
    fn install(&self, names: &[String]) -> Result<()>;

    /// Remove every package in `names` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::PackageInstall`] if the transaction fails.
    fn remove(&self, names: &[String]) -> Result<()>;
}

/// [`PackageManager`] backed by `dpkg-query` and `apt-get`.
pub struct AptPackageManager<'a> {
    executor: &'a dyn CommandExecutor,
    timeout: Duration,
}

impl<'a> AptPackageManager<'a> {
    /// Create a package manager that runs apt through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn transaction(&self, verb: &str, extra: &[&str], names: &[String]) -> Result<()> {
        let mut args = vec![verb, "-y"];
        args.extend_from_slice(extra);
        args.extend(names.iter().map(String::as_str));

        let output = self
            .executor
            .run_with_timeout("apt-get", &args, self.timeout)?;
        if output.status.success() {
            return Ok(());
        }
        Err(ProvisionError::PackageInstall {
            packages: names.join(" "),
            message: failure_message(&output),
        })
    }
}

impl PackageManager for AptPackageManager<'_> {
    fn is_installed(&self, name: &str) -> Result<bool> {
        let output = self.executor.run_with_timeout(
            "dpkg-query",
            &["-W", "-f=${Status}", name],
            self.timeout,
        )?;
        // dpkg-query exits non-zero for packages it has never heard of.
        if !output.status.success() {
            return Ok(false);
        }
        let status = String::from_utf8_lossy(&output.stdout);
        Ok(status.trim_end().ends_with(" installed"))
    }

    fn install(&self, names: &[String]) -> Result<()> {
        self.transaction("install", &["--no-install-recommends"], names)
    }

    fn remove(&self, names: &[String]) -> Result<()> {
        self.transaction("remove", &[], names)
    }
}

/// Desired package state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSet {
    /// Packages that must be installed.
    pub present: Vec<String>,
    /// Packages that must not be installed.
    pub absent: Vec<String>,
}

/// Packages a convergence run installed or removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PackageChanges {
    /// Packages that were missing and got installed.
    pub installed: Vec<String>,
    /// Packages that were present and got removed.
    pub removed: Vec<String>,
}

impl PackageChanges {
    /// Whether anything was installed or removed.
    #[must_use]
    pub fn changed(&self) -> bool {
        !(self.installed.is_empty() && self.removed.is_empty())
    }
}

/// Bring the installed packages in line with `desired`.
///
/// Queries every package first and then issues at most one install and one
/// removal transaction.
///
/// # Errors
///
/// Returns the first query or transaction failure.
pub fn ensure_packages(
    manager: &dyn PackageManager,
    desired: &PackageSet,
) -> Result<PackageChanges> {
    let mut changes = PackageChanges::default();
    for name in &desired.present {
        if !manager.is_installed(name)? {
            changes.installed.push(name.clone());
        }
    }
    for name in &desired.absent {
        if manager.is_installed(name)? {
            changes.removed.push(name.clone());
        }
    }

    if changes.installed.is_empty() {
        log::debug!("all {} required packages present", desired.present.len());
    } else {
        log::info!("installing {}", changes.installed.join(" "));
        manager.install(&changes.installed)?;
    }
    if !changes.removed.is_empty() {
        log::info!("removing {}", changes.removed.join(" "));
        manager.remove(&changes.removed)?;
    }
    Ok(changes)
}
