//! Module build subsystem: DKMS registrations.
//!
//! A registration is DKMS's record that `<module>/<version>` is built and
//! installed for a kernel. The orchestrator removes it before replacing a
//! tree and only asks for a new build once the tree is proven valid.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, describe, failure_message};
use crate::release::module_id::{ModuleName, ModuleVersion};
use std::time::Duration;

/// Phrases DKMS prints when asked to remove something it never had.
const NOT_FOUND_MARKERS: &[&str] = &["no instances", "not located", "not added", "does not exist"];

/// Whether a module version is built and installed for the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Built and installed.
    Registered,
    /// Unknown to DKMS, or only added/built but not installed.
    Absent,
}

/// Outcome of a removal request. Both outcomes are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    /// An existing registration was removed.
    Removed,
    /// There was nothing to remove.
    NotFound,
}

/// The kernel module build and registration subsystem.
#[cfg_attr(test, mockall::automock)]
pub trait ModuleRegistry {
    /// Query, without side effects, whether `module/version` is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the subsystem cannot be queried.
    fn status(&self, module: &ModuleName, version: &ModuleVersion) -> Result<RegistrationState>;

    /// Remove every registration of `module/version`.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than "not found".
    fn remove(&self, module: &ModuleName, version: &ModuleVersion) -> Result<Deregistration>;

    /// Build and install `module/version` from its source tree.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::BuildFailure`] if the build is rejected.
    fn install(&self, module: &ModuleName, version: &ModuleVersion) -> Result<()>;
}

/// [`ModuleRegistry`] backed by the `dkms` command.
pub struct DkmsRegistry<'a> {
    executor: &'a dyn CommandExecutor,
    command_timeout: Duration,
    build_timeout: Duration,
}

impl<'a> DkmsRegistry<'a> {
    /// Create a registry that runs `dkms` through `executor`.
    ///
    /// `build_timeout` bounds `dkms install`; every other call is bounded by
    /// `command_timeout`.
    #[must_use]
    pub fn new(
        executor: &'a dyn CommandExecutor,
        command_timeout: Duration,
        build_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            command_timeout,
            build_timeout,
        }
    }

    fn running_kernel(&self) -> Result<String> {
        let output = self
            .executor
            .run_with_timeout("uname", &["-r"], self.command_timeout)?;
        let release = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !output.status.success() || release.is_empty() {
            return Err(ProvisionError::ModuleRegistry {
                operation: "status",
                message: format!("cannot determine running kernel: {}", failure_message(&output)),
            });
        }
        Ok(release)
    }
}

impl ModuleRegistry for DkmsRegistry<'_> {
    fn status(&self, module: &ModuleName, version: &ModuleVersion) -> Result<RegistrationState> {
        let kernel = self.running_kernel()?;
        let args = [
            "status",
            "-m",
            module.as_str(),
            "-v",
            version.as_str(),
            "-k",
            kernel.as_str(),
        ];
        let output = self
            .executor
            .run_with_timeout("dkms", &args, self.command_timeout)?;
        if !output.status.success() {
            return Err(ProvisionError::ModuleRegistry {
                operation: "status",
                message: failure_message(&output),
            });
        }
        Ok(parse_status(&String::from_utf8_lossy(&output.stdout)))
    }

    fn remove(&self, module: &ModuleName, version: &ModuleVersion) -> Result<Deregistration> {
        let args = ["remove", "-m", module.as_str(), "-v", version.as_str(), "--all"];
        let output = self
            .executor
            .run_with_timeout("dkms", &args, self.command_timeout)?;
        if output.status.success() {
            return Ok(Deregistration::Removed);
        }

        let message = failure_message(&output);
        if is_not_found(&message) {
            return Ok(Deregistration::NotFound);
        }
        Err(ProvisionError::ModuleRegistry {
            operation: "remove",
            message,
        })
    }

    fn install(&self, module: &ModuleName, version: &ModuleVersion) -> Result<()> {
        let args = ["install", "-m", module.as_str(), "-v", version.as_str()];
        log::info!("running {}", describe("dkms", &args));
        let output = self
            .executor
            .run_with_timeout("dkms", &args, self.build_timeout)?;
        if output.status.success() {
            return Ok(());
        }
        Err(ProvisionError::BuildFailure {
            module: module.to_string(),
            version: version.to_string(),
            message: failure_message(&output),
        })
    }
}

/// A module is registered when some status line reports it `installed`.
fn parse_status(stdout: &str) -> RegistrationState {
    let installed = stdout
        .lines()
        .any(|line| line.rsplit(':').next().is_some_and(|state| state.trim().starts_with("installed")));
    if installed {
        RegistrationState::Registered
    } else {
        RegistrationState::Absent
    }
}

fn is_not_found(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, output_with_stdout};
    use rstest::rstest;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn ids() -> (ModuleName, ModuleVersion) {
        (
            ModuleName::try_from("hid-xpadneo").expect("name"),
            ModuleVersion::try_from("abc123").expect("version"),
        )
    }

    #[rstest]
    #[case::modern("hid-xpadneo/abc123, 6.1.21-v8+, aarch64: installed\n", RegistrationState::Registered)]
    #[case::legacy("hid-xpadneo, abc123, 6.1.21-v8+, aarch64: installed (original_module exists)\n", RegistrationState::Registered)]
    #[case::built_only("hid-xpadneo/abc123, 6.1.21-v8+, aarch64: built\n", RegistrationState::Absent)]
    #[case::added_only("hid-xpadneo/abc123: added\n", RegistrationState::Absent)]
    #[case::empty("", RegistrationState::Absent)]
    fn parses_status_lines(#[case] stdout: &str, #[case] expected: RegistrationState) {
        assert_eq!(parse_status(stdout), expected);
    }

    #[test]
    fn status_queries_the_running_kernel() {
        let executor = StubExecutor::new(vec![
            ExpectedCall {
                cmd: "uname",
                args: vec!["-r"],
                result: Ok(output_with_stdout("6.1.21-v8+\n")),
            },
            ExpectedCall {
                cmd: "dkms",
                args: vec!["status", "-m", "hid-xpadneo", "-v", "abc123", "-k", "6.1.21-v8+"],
                result: Ok(output_with_stdout(
                    "hid-xpadneo/abc123, 6.1.21-v8+, aarch64: installed\n",
                )),
            },
        ]);
        let registry = DkmsRegistry::new(&executor, TIMEOUT, TIMEOUT);
        let (module, version) = ids();

        let state = registry.status(&module, &version).expect("status");
        assert_eq!(state, RegistrationState::Registered);
        executor.assert_finished();
    }

    #[rstest]
    #[case::no_instances("Error! There are no instances of module: hid-xpadneo\nabc123 located in the DKMS tree.")]
    #[case::not_located("Error! The module/version combo: hid-xpadneo-abc123 is not located in the DKMS tree.")]
    #[case::not_added("Error! The module hid-xpadneo/abc123 is not added.")]
    fn remove_treats_absence_as_success(#[case] stderr: &'static str) {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "dkms",
            args: vec!["remove", "-m", "hid-xpadneo", "-v", "abc123", "--all"],
            result: Ok(failure_output(stderr)),
        }]);
        let registry = DkmsRegistry::new(&executor, TIMEOUT, TIMEOUT);
        let (module, version) = ids();

        let outcome = registry.remove(&module, &version).expect("remove");
        assert_eq!(outcome, Deregistration::NotFound);
    }

    #[test]
    fn remove_surfaces_other_failures() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "dkms",
            args: vec!["remove", "-m", "hid-xpadneo", "-v", "abc123", "--all"],
            result: Ok(failure_output("dkms: permission denied")),
        }]);
        let registry = DkmsRegistry::new(&executor, TIMEOUT, TIMEOUT);
        let (module, version) = ids();

        let result = registry.remove(&module, &version);
        assert!(matches!(
            result,
            Err(ProvisionError::ModuleRegistry { operation: "remove", .. })
        ));
    }

    #[test]
    fn failed_install_is_build_failure_with_output() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "dkms",
            args: vec!["install", "-m", "hid-xpadneo", "-v", "abc123"],
            result: Ok(failure_output("Error! Bad return status for module build on kernel")),
        }]);
        let registry = DkmsRegistry::new(&executor, TIMEOUT, TIMEOUT);
        let (module, version) = ids();

        match registry.install(&module, &version) {
            Err(ProvisionError::BuildFailure { message, .. }) => {
                assert_eq!(message, "Error! Bad return status for module build on kernel");
            }
            other => panic!("expected BuildFailure, got {other:?}"),
        }
    }
}
