//! Mirroring the provisioning inputs to a remote host.
//!
//! Hosts are provisioned by copying an allow-list of local paths (the
//! configuration and the service source) to a staging directory on the
//! host and running the provisioner there.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, failure_message};
use camino::Utf8PathBuf;
use std::time::Duration;

/// What to mirror and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    /// Local paths to mirror, relative to the working directory.
    ///
    /// Their relative structure is preserved below `remote_dir`.
    pub paths: Vec<Utf8PathBuf>,
    /// Staging directory on the remote host.
    pub remote_dir: String,
}

impl SyncPlan {
    /// Arguments for `rsync`.
    ///
    /// `--delete` gives mirror semantics: remote files absent locally are
    /// removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use roestbak_provisioner::sync::SyncPlan;
    ///
    /// let plan = SyncPlan {
    ///     paths: vec!["provision.toml".into()],
    ///     remote_dir: "/opt/roestbak-provision".to_owned(),
    /// };
    /// assert_eq!(
    ///     plan.rsync_args("robot"),
    ///     ["-a", "--delete", "--relative", "provision.toml", "robot:/opt/roestbak-provision/"],
    /// );
    /// ```
    #[must_use]
    pub fn rsync_args(&self, host: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-a", "--delete", "--relative"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        args.extend(self.paths.iter().map(ToString::to_string));
        args.push(format!("{host}:{}/", self.remote_dir.trim_end_matches('/')));
        args
    }
}

/// Mirror `plan` to `host`.
///
/// # Errors
///
/// Returns [`ProvisionError::Sync`] if rsync fails.
pub fn sync_to_host(
    executor: &dyn CommandExecutor,
    plan: &SyncPlan,
    host: &str,
    timeout: Duration,
) -> Result<()> {
    let args = plan.rsync_args(host);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = executor.run_with_timeout("rsync", &args, timeout)?;
    if output.status.success() {
        log::info!("{host}: synced {} paths", plan.paths.len());
        return Ok(());
    }
    Err(ProvisionError::Sync {
        host: host.to_owned(),
        message: failure_message(&output),
    })
}

/// Run `command` on `host` over ssh and return its stdout.
///
/// Batch mode makes ssh fail instead of prompting for a password.
///
/// # Errors
///
/// Returns [`ProvisionError::Remote`] if ssh or the command fails.
pub fn run_remote(
    executor: &dyn CommandExecutor,
    host: &str,
    command: &[String],
    timeout: Duration,
) -> Result<String> {
    let mut args = vec!["-o", "BatchMode=yes", host, "--"];
    args.extend(command.iter().map(String::as_str));
    let output = executor.run_with_timeout("ssh", &args, timeout)?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(ProvisionError::Remote {
        host: host.to_owned(),
        message: failure_message(&output),
    })
}
