//! External command execution.
//!
//! Every collaborator that shells out (apt, dkms, rustup, udevadm,
//! systemctl, rsync, ssh) goes through [`CommandExecutor`], so tests can
//! script the exact invocations a workflow performs.

use crate::error::{ProvisionError, Result};
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Abstraction for running external commands.
pub trait CommandExecutor {
    /// Runs a command with arguments and returns the captured output.
    ///
    /// # Errors
    ///
    /// Returns any I/O errors encountered while spawning or running the command.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use roestbak_provisioner::exec::{CommandExecutor, SystemCommandExecutor};
    ///
    /// let executor = SystemCommandExecutor;
    /// let output = executor.run("dkms", &["--version"])?;
    /// assert!(output.status.success());
    /// # Ok::<(), roestbak_provisioner::error::ProvisionError>(())
    /// ```
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output>;

    /// Runs a command, killing it if it outlives `timeout`.
    ///
    /// Every executor must honour the limit; a run never blocks forever.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Timeout`] when the limit is exceeded, or any
    /// I/O error from spawning the command.
    fn run_with_timeout(&self, cmd: &str, args: &[&str], timeout: Duration) -> Result<Output>;
}

/// Executes commands on the local system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        log::trace!("running {}", describe(cmd, args));
        Command::new(cmd)
            .args(args)
            .output()
            .map_err(ProvisionError::from)
    }

    fn run_with_timeout(&self, cmd: &str, args: &[&str], timeout: Duration) -> Result<Output> {
        log::trace!(
            "running {} (timeout {}s)",
            describe(cmd, args),
            timeout.as_secs()
        );
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting; a chatty build would otherwise
        // fill the pipe buffer and never exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match child.wait_timeout(timeout)? {
            Some(status) => Ok(Output {
                status,
                stdout: join_drain(stdout)?,
                stderr: join_drain(stderr)?,
            }),
            None => {
                kill_and_reap(&mut child);
                // Grandchildren may still hold the pipes; leave the readers
                // detached rather than block on them.
                drop((stdout, stderr));
                Err(ProvisionError::Timeout {
                    operation: describe(cmd, args),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

type Drain = Option<JoinHandle<std::io::Result<Vec<u8>>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer)?;
            Ok(buffer)
        })
    })
}

fn join_drain(handle: Drain) -> Result<Vec<u8>> {
    let Some(handle) = handle else {
        return Ok(Vec::new());
    };
    handle
        .join()
        .map_err(|_| ProvisionError::Io(std::io::Error::other("output reader panicked")))?
        .map_err(ProvisionError::from)
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Render a command line for logs and error messages.
#[must_use]
pub fn describe(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_owned()
    } else {
        format!("{cmd} {}", args.join(" "))
    }
}

/// Trimmed stderr of a failed command, falling back to stdout and then to
/// a generic message.
#[must_use]
pub fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return trimmed.to_owned();
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        format!("exited with {}", output.status)
    } else {
        trimmed.to_owned()
    }
}
