//! Converging one host: the ordered sequence of provisioning steps.
//!
//! `apply` takes the host lock, then runs the selected steps in a fixed
//! order. Each step depends on the ones before it (the module build needs
//! `dkms`, the service build needs the toolchain), so the first failure
//! stops the run. Re-running is the repair procedure.

use crate::config::ProvisionConfig;
use crate::detector::{SourceState, detect};
use crate::dkms::{ModuleRegistry, RegistrationState};
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::extraction::SourceExtractor;
use crate::fetch::ArchiveDownloader;
use crate::files::FileChange;
use crate::lock::HostLock;
use crate::orchestrator::{Collaborators, InstallPlan, InstallReport, install_source};
use crate::packages::{PackageChanges, PackageManager, ensure_packages};
use crate::release::sha256_digest::Sha256Digest;
use crate::service::{ServiceDeployment, ServiceManager, build_service, deploy_service};
use crate::toolchain::{ToolchainContext, ToolchainInstallStatus};
use crate::udev::{JS_EVDEV_RULES, ensure_rules};
use camino::Utf8PathBuf;
use serde::Serialize;
use std::fmt;
use std::fs;

/// One provisioning step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    /// OS packages.
    Packages,
    /// The Rust toolchain.
    Toolchain,
    /// The out-of-tree kernel module.
    Module,
    /// The gamepad udev rule.
    Udev,
    /// The long-running service.
    Service,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Self; 5] = [
        Self::Packages,
        Self::Toolchain,
        Self::Module,
        Self::Udev,
        Self::Service,
    ];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Packages => "packages",
            Self::Toolchain => "toolchain",
            Self::Module => "module",
            Self::Udev => "udev",
            Self::Service => "service",
        };
        f.write_str(name)
    }
}

/// The production systems a run converges.
#[derive(Clone, Copy)]
pub struct HostSystems<'a> {
    /// Runs udevadm, rustup and cargo.
    pub executor: &'a dyn CommandExecutor,
    /// Fetches the module archive and the rustup installer.
    pub downloader: &'a dyn ArchiveDownloader,
    /// Unpacks the module archive.
    pub extractor: &'a dyn SourceExtractor,
    /// DKMS.
    pub registry: &'a dyn ModuleRegistry,
    /// apt.
    pub packages: &'a dyn PackageManager,
    /// systemd.
    pub services: &'a dyn ServiceManager,
}

/// What an `apply` run did, per step. Skipped steps are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Package changes.
    pub packages: Option<PackageChanges>,
    /// Toolchain changes.
    pub toolchain: Option<ToolchainInstallStatus>,
    /// The module install run.
    pub module: Option<InstallReport>,
    /// The udev rule file.
    pub udev: Option<FileChange>,
    /// The service deployment.
    pub service: Option<ServiceDeployment>,
}

impl ApplyReport {
    /// Whether any step changed the host.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.packages.as_ref().is_some_and(PackageChanges::changed)
            || self.toolchain.is_some_and(|status| status.changed())
            || self
                .module
                .as_ref()
                .is_some_and(|report| report.outcome.changed())
            || self.udev.is_some_and(FileChange::changed)
            || self.service.is_some_and(|deployment| deployment.changed())
    }
}

/// Converge the local host to `config`, running only `steps`.
///
/// # Errors
///
/// Returns [`crate::error::ProvisionError::ConcurrentRun`] if another run
/// holds the host lock, otherwise the first step failure.
pub fn apply(
    config: &ProvisionConfig,
    systems: &HostSystems<'_>,
    steps: &[Step],
) -> Result<ApplyReport> {
    let _lock = HostLock::acquire(&config.staging_dir)?;
    let mut report = ApplyReport::default();

    for step in Step::ALL.into_iter().filter(|step| steps.contains(step)) {
        log::info!("step {step}");
        match step {
            Step::Packages => {
                report.packages = Some(ensure_packages(systems.packages, &config.packages)?);
            }
            Step::Toolchain => {
                report.toolchain = Some(config.toolchain.ensure_installed(&ToolchainContext {
                    executor: systems.executor,
                    downloader: systems.downloader,
                    scratch_dir: &config.staging_dir,
                    timeout: config.timeouts.build,
                })?);
            }
            Step::Module => {
                report.module = Some(install_source(
                    &install_plan(config),
                    &Collaborators {
                        downloader: systems.downloader,
                        extractor: systems.extractor,
                        registry: systems.registry,
                    },
                )?);
            }
            Step::Udev => {
                report.udev = Some(ensure_rules(
                    systems.executor,
                    &config.udev_rules_path,
                    config.timeouts.command,
                )?);
            }
            Step::Service => {
                let built = build_service(
                    systems.executor,
                    &config.toolchain.cargo(),
                    config.toolchain.channel(),
                    &config.service,
                    config.timeouts.build,
                )?;
                report.service = Some(deploy_service(systems.services, &config.service, &built)?);
            }
        }
    }

    if report.changed() {
        log::info!("host converged with changes");
    } else {
        log::info!("host already converged");
    }
    Ok(report)
}

fn install_plan(config: &ProvisionConfig) -> InstallPlan<'_> {
    InstallPlan {
        release: &config.release,
        layout: &config.layout,
        descriptor: &config.descriptor,
        source_root: &config.source_root,
        staging_dir: &config.staging_dir,
    }
}

/// Read-only view of the module and udev state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    /// `<module>/<version>` of the pinned release.
    pub release: String,
    /// The installed tree directory.
    pub tree: Utf8PathBuf,
    /// The pinned tree digest.
    pub pinned: Sha256Digest,
    /// The computed tree digest, if the tree could be read.
    pub actual: Option<Sha256Digest>,
    /// Whether the tree matches its pin.
    pub matches: bool,
    /// Whether DKMS has the pinned version installed for the running kernel.
    pub registered: bool,
    /// Whether the udev rule file holds the bundled rule.
    pub udev_rules_current: bool,
}

impl HostStatus {
    /// Whether `apply` would leave the module and udev rule untouched.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.matches && self.registered && self.udev_rules_current
    }
}

/// Inspect the host without changing it.
///
/// # Errors
///
/// Returns the registry's error if the registration query fails.
pub fn status(config: &ProvisionConfig, registry: &dyn ModuleRegistry) -> Result<HostStatus> {
    let release = &config.release;
    let tree = release.installed_tree(&config.source_root);
    let (matches, actual) = match detect(&tree, release.tree_checksum()) {
        SourceState::Match => (true, Some(release.tree_checksum().clone())),
        SourceState::Mismatch { actual } => (false, actual),
    };
    let registered = registry.status(release.module(), release.version())?
        == RegistrationState::Registered;
    let udev_rules_current = fs::read(&config.udev_rules_path)
        .is_ok_and(|contents| contents == JS_EVDEV_RULES.as_bytes());

    Ok(HostStatus {
        release: release.registration_key(),
        tree,
        pinned: release.tree_checksum().clone(),
        actual,
        matches,
        registered,
        udev_rules_current,
    })
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
