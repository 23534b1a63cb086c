//! Stable device symlinks for gamepads.

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandExecutor, failure_message};
use crate::files::{FileChange, stage_file};
use camino::Utf8Path;
use std::time::Duration;

/// The bundled rule creating `/dev/input/js-evdev<N>`.
pub const JS_EVDEV_RULES: &str = include_str!("../assets/99-js-evdev.rules");

/// Default install location of [`JS_EVDEV_RULES`].
pub const DEFAULT_RULES_PATH: &str = "/etc/udev/rules.d/99-js-evdev.rules";

const RULES_MODE: u32 = 0o644;

/// Install the rule file and, if it changed, make udev apply it to devices
/// that are already plugged in.
///
/// If `udevadm` fails the previous rule file is restored, so a re-run sees
/// the rule as changed and reloads again.
///
/// # Errors
///
/// Returns [`ProvisionError::Io`] if the rule cannot be written and
/// [`ProvisionError::Udev`] if `udevadm` fails.
pub fn ensure_rules(
    executor: &dyn CommandExecutor,
    rules_path: &Utf8Path,
    timeout: Duration,
) -> Result<FileChange> {
    let staged = stage_file(rules_path, JS_EVDEV_RULES.as_bytes(), RULES_MODE)?;
    if !staged.change().changed() {
        return Ok(staged.commit());
    }

    udevadm(executor, "control", &["control", "--reload-rules"], timeout)?;
    udevadm(
        executor,
        "trigger",
        &["trigger", "--subsystem-match=input"],
        timeout,
    )?;
    log::info!("reloaded udev rules");
    Ok(staged.commit())
}

fn udevadm(
    executor: &dyn CommandExecutor,
    operation: &'static str,
    args: &[&str],
    timeout: Duration,
) -> Result<()> {
    let output = executor.run_with_timeout("udevadm", args, timeout)?;
    if output.status.success() {
        return Ok(());
    }
    Err(ProvisionError::Udev {
        operation,
        message: failure_message(&output),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, success_output};
    use camino::Utf8PathBuf;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn rules_path(temp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(temp.path().join("rules.d/99-js-evdev.rules")).expect("UTF-8 path")
    }

    fn reload_calls() -> Vec<ExpectedCall> {
        vec![
            ExpectedCall {
                cmd: "udevadm",
                args: vec!["control", "--reload-rules"],
                result: Ok(success_output()),
            },
            ExpectedCall {
                cmd: "udevadm",
                args: vec!["trigger", "--subsystem-match=input"],
                result: Ok(success_output()),
            },
        ]
    }

    #[test]
    fn rule_matches_joystick_event_nodes() {
        assert!(JS_EVDEV_RULES.contains(r#"SUBSYSTEM=="input""#));
        assert!(JS_EVDEV_RULES.contains(r#"ENV{ID_INPUT_JOYSTICK}=="1""#));
        assert!(JS_EVDEV_RULES.contains(r#"SYMLINK+="input/js-evdev%n""#));
        assert!(!JS_EVDEV_RULES.contains("ID_BUS"), "rule must not depend on transport");
    }

    #[test]
    fn new_rule_is_written_and_applied() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = rules_path(&temp);
        let executor = StubExecutor::new(reload_calls());

        let change = ensure_rules(&executor, &path, TIMEOUT).expect("ensure");
        assert_eq!(change, FileChange::Written);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), JS_EVDEV_RULES);
        executor.assert_finished();
    }

    #[test]
    fn unchanged_rule_does_not_touch_udev() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = rules_path(&temp);
        ensure_rules(&StubExecutor::new(reload_calls()), &path, TIMEOUT).expect("first");

        let executor = StubExecutor::new(Vec::new());
        let change = ensure_rules(&executor, &path, TIMEOUT).expect("second");
        assert_eq!(change, FileChange::Unchanged);
    }

    #[test]
    fn reload_failure_is_reported() {
        let temp = tempfile::tempdir().expect("temp dir");
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "udevadm",
            args: vec!["control", "--reload-rules"],
            result: Ok(failure_output("Failed to send reload request: No such file or directory")),
        }]);

        let err = ensure_rules(&executor, &rules_path(&temp), TIMEOUT).expect_err("must fail");
        assert!(matches!(err, ProvisionError::Udev { operation: "control", .. }));
    }

    #[test]
    fn failed_reload_is_retried_on_the_next_run() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = rules_path(&temp);
        let failing = StubExecutor::new(vec![ExpectedCall {
            cmd: "udevadm",
            args: vec!["control", "--reload-rules"],
            result: Ok(failure_output("Failed to send reload request: Connection refused")),
        }]);
        ensure_rules(&failing, &path, TIMEOUT).expect_err("first run fails");
        assert!(!path.exists(), "unapplied rule must not look installed");

        let executor = StubExecutor::new(reload_calls());
        let change = ensure_rules(&executor, &path, TIMEOUT).expect("re-run");
        assert_eq!(change, FileChange::Written);
        executor.assert_finished();
    }

    #[test]
    fn failed_trigger_restores_the_previous_rule() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = rules_path(&temp);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("rules.d");
        std::fs::write(&path, "# stale\n").expect("stale rule");
        let executor = StubExecutor::new(vec![
            ExpectedCall {
                cmd: "udevadm",
                args: vec!["control", "--reload-rules"],
                result: Ok(success_output()),
            },
            ExpectedCall {
                cmd: "udevadm",
                args: vec!["trigger", "--subsystem-match=input"],
                result: Ok(failure_output("Failed to scan devices")),
            },
        ]);

        let err = ensure_rules(&executor, &path, TIMEOUT).expect_err("trigger fails");
        assert!(matches!(err, ProvisionError::Udev { operation: "trigger", .. }));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "# stale\n");
    }
}
