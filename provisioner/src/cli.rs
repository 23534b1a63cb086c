//! Command-line interface definitions.
//!
//! Kept apart from `main.rs` so parsing can be unit tested.

use crate::config::DEFAULT_CONFIG_FILE;
use crate::workflow::Step;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Converge roestbak hosts to their declared configuration.
#[derive(Parser, Debug)]
#[command(name = "roestbak-provision")]
#[command(version, about)]
#[command(long_about = concat!(
    "Converge roestbak hosts to their declared configuration.\n\n",
    "`apply` installs OS packages, bootstraps the Rust toolchain, installs the ",
    "pinned xpadneo kernel module through DKMS, installs the gamepad udev rule and ",
    "builds and (re)starts the roestbak service. Every step is idempotent: a second ",
    "run against a converged host changes nothing.\n\n",
    "The module source is checked twice: the downloaded archive against ",
    "`download_sha256`, and the extracted, stamped tree against `tree_sha256`. ",
    "Either mismatch stops the run before anything is built.",
))]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  Converge this host:\n",
    "    $ sudo roestbak-provision apply\n\n",
    "  Only reinstall the kernel module:\n",
    "    $ sudo roestbak-provision apply --only module\n\n",
    "  Check the module without changing anything:\n",
    "    $ roestbak-provision status --json\n\n",
    "  Compute a tree_sha256 pin from an audited tree:\n",
    "    $ roestbak-provision digest /usr/src/hid-xpadneo-v0.9.7\n\n",
    "  Provision every configured robot:\n",
    "    $ roestbak-provision deploy",
))]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(
        short,
        long = "verbose",
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Converge the local host.
    Apply(ApplyArgs),

    /// Report module and udev state without changing anything.
    Status(StatusArgs),

    /// Print the tree digest of a directory.
    Digest(DigestArgs),

    /// Mirror the configuration to remote hosts and apply it there.
    Deploy(DeployArgs),
}

/// Arguments for `apply`.
#[derive(Args, Debug, Clone, Default)]
pub struct ApplyArgs {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: Utf8PathBuf,

    /// Run only these steps (repeatable); they still run in their fixed order.
    #[arg(long, value_enum, value_name = "STEP")]
    pub only: Vec<Step>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

impl ApplyArgs {
    /// The selected steps; all of them when `--only` was not given.
    ///
    /// # Examples
    ///
    /// ```
    /// use roestbak_provisioner::cli::ApplyArgs;
    /// use roestbak_provisioner::workflow::Step;
    ///
    /// assert_eq!(ApplyArgs::default().steps(), Step::ALL);
    /// ```
    #[must_use]
    pub fn steps(&self) -> Vec<Step> {
        if self.only.is_empty() {
            Step::ALL.to_vec()
        } else {
            self.only.clone()
        }
    }
}

/// Arguments for `status`.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: Utf8PathBuf,

    /// Print JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `digest`.
#[derive(Args, Debug, Clone)]
pub struct DigestArgs {
    /// Directory to hash.
    #[arg(value_name = "DIR")]
    pub dir: Utf8PathBuf,
}

/// Arguments for `deploy`.
#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: Utf8PathBuf,

    /// Target host (repeatable); defaults to the configured `hosts`.
    #[arg(long = "host", value_name = "HOST")]
    pub hosts: Vec<String>,
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
