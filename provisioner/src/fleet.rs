//! Provisioning several hosts at once.
//!
//! Hosts share no state, so each runs on its own scoped thread. A failure,
//! or even a panic, on one host is recorded in its report and never stops
//! the others.

use crate::error::{ProvisionError, Result};
use crate::exec::CommandExecutor;
use crate::sync::{SyncPlan, run_remote, sync_to_host};
use std::thread;
use std::time::Duration;

/// The outcome for one host.
#[derive(Debug)]
pub struct HostReport {
    /// The host name as configured.
    pub host: String,
    /// What the per-host task returned.
    pub result: Result<()>,
}

impl HostReport {
    /// Whether the host converged.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `task` for every host concurrently, returning one report per host in
/// the order given.
pub fn run_on_hosts<F>(hosts: &[String], task: F) -> Vec<HostReport>
where
    F: Fn(&str) -> Result<()> + Sync,
{
    let task = &task;
    thread::scope(|scope| {
        let handles: Vec<_> = hosts
            .iter()
            .map(|host| (host, scope.spawn(move || task(host.as_str()))))
            .collect();

        handles
            .into_iter()
            .map(|(host, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(ProvisionError::Remote {
                        host: host.clone(),
                        message: "provisioning thread panicked".to_owned(),
                    })
                });
                if let Err(error) = &result {
                    log::warn!("{host}: {error}");
                }
                HostReport {
                    host: host.clone(),
                    result,
                }
            })
            .collect()
    })
}

/// How to provision a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPlan {
    /// What to mirror to the host.
    pub sync: SyncPlan,
    /// Command run on the host after the mirror.
    pub remote_command: Vec<String>,
    /// Limit for the rsync mirror.
    pub sync_timeout: Duration,
    /// Limit for the remote command, which runs a whole `apply`.
    pub apply_timeout: Duration,
}

/// Mirror the inputs to `host`, then run the provisioner there.
///
/// # Errors
///
/// Returns [`ProvisionError::Sync`] or [`ProvisionError::Remote`] naming the
/// host.
pub fn deploy_host(executor: &dyn CommandExecutor, plan: &DeployPlan, host: &str) -> Result<()> {
    sync_to_host(executor, &plan.sync, host, plan.sync_timeout)?;
    let stdout = run_remote(executor, host, &plan.remote_command, plan.apply_timeout)?;
    for line in stdout.lines() {
        log::debug!("{host}: {line}");
    }
    log::info!("{host}: provisioned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, output_with_stdout, success_output};

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn reports_keep_host_order() {
        let reports = run_on_hosts(&hosts(&["a", "b", "c"]), |_| Ok(()));
        let names: Vec<_> = reports.iter().map(|report| report.host.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(reports.iter().all(HostReport::succeeded));
    }

    #[test]
    fn failing_host_does_not_affect_siblings() {
        let reports = run_on_hosts(&hosts(&["ok-1", "broken", "ok-2"]), |host| {
            if host == "broken" {
                Err(ProvisionError::NetworkFailure {
                    url: "https://github.com".to_owned(),
                    reason: "timed out".to_owned(),
                })
            } else {
                Ok(())
            }
        });
        let succeeded: Vec<_> = reports.iter().map(HostReport::succeeded).collect();
        assert_eq!(succeeded, [true, false, true]);
    }

    #[test]
    fn panicking_host_is_reported_as_failure() {
        let reports = run_on_hosts(&hosts(&["fine", "panics"]), |host| {
            assert_ne!(host, "panics", "simulated crash");
            Ok(())
        });
        assert!(reports[0].succeeded());
        assert!(matches!(
            reports[1].result,
            Err(ProvisionError::Remote { ref message, .. }) if message.contains("panicked")
        ));
    }

    #[test]
    fn deploy_syncs_before_remote_apply() {
        let executor = StubExecutor::new(vec![
            ExpectedCall {
                cmd: "rsync",
                args: vec![
                    "-a",
                    "--delete",
                    "--relative",
                    "provision.toml",
                    "robot:/opt/roestbak-provision/",
                ],
                result: Ok(success_output()),
            },
            ExpectedCall {
                cmd: "ssh",
                args: vec!["-o", "BatchMode=yes", "robot", "--", "roestbak-provision", "apply"],
                result: Ok(output_with_stdout("module: current\n")),
            },
        ]);
        let plan = DeployPlan {
            sync: SyncPlan {
                paths: vec!["provision.toml".into()],
                remote_dir: "/opt/roestbak-provision".to_owned(),
            },
            remote_command: vec!["roestbak-provision".to_owned(), "apply".to_owned()],
            sync_timeout: Duration::from_secs(5),
            apply_timeout: Duration::from_secs(60),
        };

        deploy_host(&executor, &plan, "robot").expect("deploy");
        executor.assert_finished();
    }
}
