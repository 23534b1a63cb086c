//! Building and deploying the long-running service.
//!
//! The service is compiled on the host with the pinned toolchain, its
//! binary and unit file are installed only when their content changed, and
//! systemd is asked to restart it only when one of them did.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, describe, failure_message};
use crate::files::{FileChange, StagedFile, stage_copy, stage_file};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const BINARY_MODE: u32 = 0o755;
const UNIT_MODE: u32 = 0o644;

/// systemd's `Restart=` setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart whenever the process exits.
    #[default]
    Always,
    /// Restart only after a failure.
    OnFailure,
    /// Never restart.
    No,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::OnFailure => f.write_str("on-failure"),
            Self::No => f.write_str("no"),
        }
    }
}

/// The content of the generated unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescription {
    /// `Description=`.
    pub description: String,
    /// Units listed in `After=`.
    pub after: Vec<String>,
    /// The binary `ExecStart=` runs.
    pub exec_start: Utf8PathBuf,
    /// Optional `User=`.
    pub user: Option<String>,
    /// `Restart=`.
    pub restart: RestartPolicy,
    /// `RestartSec=`, in seconds.
    pub restart_sec: u64,
}

impl UnitDescription {
    /// Render the unit file.
    ///
    /// # Examples
    ///
    /// ```
    /// use roestbak_provisioner::service::{RestartPolicy, UnitDescription};
    ///
    /// let unit = UnitDescription {
    ///     description: "roestbak".to_owned(),
    ///     after: vec!["bluetooth.target".to_owned()],
    ///     exec_start: "/usr/local/bin/roestbak".into(),
    ///     user: None,
    ///     restart: RestartPolicy::Always,
    ///     restart_sec: 2,
    /// };
    /// assert!(unit.render().contains("ExecStart=/usr/local/bin/roestbak\n"));
    /// ```
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = vec![
            "[Unit]".to_owned(),
            format!("Description={}", self.description),
        ];
        if !self.after.is_empty() {
            lines.push(format!("After={}", self.after.join(" ")));
        }
        lines.extend([
            String::new(),
            "[Service]".to_owned(),
            format!("ExecStart={}", self.exec_start),
        ]);
        if let Some(user) = &self.user {
            lines.push(format!("User={user}"));
        }
        lines.extend([
            format!("Restart={}", self.restart),
            format!("RestartSec={}", self.restart_sec),
            String::new(),
            "[Install]".to_owned(),
            "WantedBy=multi-user.target".to_owned(),
            String::new(),
        ]);
        lines.join("\n")
    }
}

/// The service manager.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceManager {
    /// Re-read unit files.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn daemon_reload(&self) -> Result<()>;

    /// Whether `unit` starts at boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager cannot be queried.
    fn is_enabled(&self, unit: &str) -> Result<bool>;

    /// Make `unit` start at boot.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn enable(&self, unit: &str) -> Result<()>;

    /// Stop `unit` from starting at boot.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn disable(&self, unit: &str) -> Result<()>;

    /// Whether `unit` is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager cannot be queried.
    fn is_active(&self, unit: &str) -> Result<bool>;

    /// Start `unit` if it is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn start(&self, unit: &str) -> Result<()>;

    /// Stop `unit`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn stop(&self, unit: &str) -> Result<()>;

    /// Restart `unit`, starting it if it is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ServiceManager`] on failure.
    fn restart(&self, unit: &str) -> Result<()>;
}

/// [`ServiceManager`] backed by `systemctl`.
pub struct SystemctlManager<'a> {
    executor: &'a dyn CommandExecutor,
    timeout: Duration,
}

impl<'a> SystemctlManager<'a> {
    /// Create a manager that runs `systemctl` through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn act(&self, operation: &'static str, unit: &str) -> Result<()> {
        let args: Vec<&str> = if unit.is_empty() {
            vec![operation]
        } else {
            vec![operation, unit]
        };
        let output = self
            .executor
            .run_with_timeout("systemctl", &args, self.timeout)?;
        if output.status.success() {
            log::info!("{}", describe("systemctl", &args));
            return Ok(());
        }
        Err(ProvisionError::ServiceManager {
            operation,
            unit: unit.to_owned(),
            message: failure_message(&output),
        })
    }

    /// `systemctl is-enabled`/`is-active` print the state and exit non-zero
    /// for anything but the positive answer.
    fn query(&self, verb: &str, unit: &str, positive: &str) -> Result<bool> {
        let output = self
            .executor
            .run_with_timeout("systemctl", &[verb, unit], self.timeout)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == positive)
    }
}

impl ServiceManager for SystemctlManager<'_> {
    fn daemon_reload(&self) -> Result<()> {
        self.act("daemon-reload", "")
    }

    fn is_enabled(&self, unit: &str) -> Result<bool> {
        self.query("is-enabled", unit, "enabled")
    }

    fn enable(&self, unit: &str) -> Result<()> {
        self.act("enable", unit)
    }

    fn disable(&self, unit: &str) -> Result<()> {
        self.act("disable", unit)
    }

    fn is_active(&self, unit: &str) -> Result<bool> {
        self.query("is-active", unit, "active")
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.act("start", unit)
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.act("stop", unit)
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.act("restart", unit)
    }
}

/// Everything needed to build and deploy the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service and unit name (`roestbak` → `roestbak.service`).
    pub name: String,
    /// Cargo project holding the service source.
    pub source_dir: Utf8PathBuf,
    /// Name of the binary target.
    pub binary: String,
    /// Where the binary is installed.
    pub install_path: Utf8PathBuf,
    /// Directory the unit file is written to.
    pub unit_dir: Utf8PathBuf,
    /// Whether the service should run.
    pub enabled: bool,
    /// Unit file content.
    pub unit: UnitDescription,
}

impl ServiceSpec {
    /// `<name>.service`.
    #[must_use]
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Where the unit file is installed.
    #[must_use]
    pub fn unit_path(&self) -> Utf8PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    /// Where cargo leaves the release binary.
    #[must_use]
    pub fn built_binary(&self) -> Utf8PathBuf {
        self.source_dir.join("target/release").join(&self.binary)
    }
}

/// What happened to the running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    /// The service was already in the desired state.
    None,
    /// The service was stopped and has been started.
    Started,
    /// The service was restarted to pick up a new binary or unit.
    Restarted,
    /// The service was disabled and stopped.
    Stopped,
}

/// Result of [`deploy_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceDeployment {
    /// Whether the installed binary changed.
    pub binary: FileChange,
    /// Whether the unit file changed.
    pub unit: FileChange,
    /// Whether boot-time enablement changed.
    pub enablement_changed: bool,
    /// What was done to the running service.
    pub action: ServiceAction,
}

impl ServiceDeployment {
    /// Whether anything on the host changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.binary.changed()
            || self.unit.changed()
            || self.enablement_changed
            || self.action != ServiceAction::None
    }
}

/// Compile the service with `cargo +<channel> build --release --locked`.
///
/// Returns the path of the built binary.
///
/// # Errors
///
/// Returns [`ProvisionError::ServiceBuild`] if cargo fails and
/// [`ProvisionError::Timeout`] if it exceeds `timeout`.
pub fn build_service(
    executor: &dyn CommandExecutor,
    cargo: &Utf8Path,
    channel: &str,
    spec: &ServiceSpec,
    timeout: Duration,
) -> Result<Utf8PathBuf> {
    let toolchain = format!("+{channel}");
    let manifest = spec.source_dir.join("Cargo.toml");
    let args = [
        toolchain.as_str(),
        "build",
        "--release",
        "--locked",
        "--bin",
        spec.binary.as_str(),
        "--manifest-path",
        manifest.as_str(),
    ];
    log::info!("building {}", spec.name);
    let output = executor.run_with_timeout(cargo.as_str(), &args, timeout)?;
    if !output.status.success() {
        return Err(ProvisionError::ServiceBuild {
            service: spec.name.clone(),
            message: failure_message(&output),
        });
    }
    Ok(spec.built_binary())
}

/// Install `built_binary` and the unit file, then converge systemd.
///
/// The new binary and unit are kept only once systemd has reloaded and
/// restarted the service. If either request fails the previous files are
/// restored, so the next run sees them as changed and restarts again.
///
/// # Errors
///
/// Returns [`ProvisionError::Io`] if a file cannot be installed and
/// [`ProvisionError::ServiceManager`] if systemd rejects a request.
pub fn deploy_service(
    manager: &dyn ServiceManager,
    spec: &ServiceSpec,
    built_binary: &Utf8Path,
) -> Result<ServiceDeployment> {
    let unit_name = spec.unit_name();
    let binary = stage_copy(built_binary, &spec.install_path, BINARY_MODE)?;
    let unit = stage_file(&spec.unit_path(), spec.unit.render().as_bytes(), UNIT_MODE)?;

    if unit.change().changed() {
        manager.daemon_reload()?;
    }

    if !spec.enabled {
        return disable_service(manager, &unit_name, binary, unit);
    }

    let enablement_changed = !manager.is_enabled(&unit_name)?;
    if enablement_changed {
        manager.enable(&unit_name)?;
    }

    let action = if binary.change().changed() || unit.change().changed() {
        manager.restart(&unit_name)?;
        ServiceAction::Restarted
    } else if manager.is_active(&unit_name)? {
        log::debug!("{unit_name} is running and up to date");
        ServiceAction::None
    } else {
        manager.start(&unit_name)?;
        ServiceAction::Started
    };

    Ok(ServiceDeployment {
        binary: binary.commit(),
        unit: unit.commit(),
        enablement_changed,
        action,
    })
}

fn disable_service(
    manager: &dyn ServiceManager,
    unit_name: &str,
    binary: StagedFile,
    unit: StagedFile,
) -> Result<ServiceDeployment> {
    let enablement_changed = manager.is_enabled(unit_name)?;
    if enablement_changed {
        manager.disable(unit_name)?;
    }
    let action = if manager.is_active(unit_name)? {
        manager.stop(unit_name)?;
        ServiceAction::Stopped
    } else {
        ServiceAction::None
    };
    Ok(ServiceDeployment {
        binary: binary.commit(),
        unit: unit.commit(),
        enablement_changed,
        action,
    })
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
