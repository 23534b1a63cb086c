//! roestbak host provisioner library.
//!
//! Converges a host to a declared configuration: OS packages, a pinned Rust
//! toolchain, the out-of-tree `hid-xpadneo` kernel module built through
//! DKMS, a udev rule for gamepads, and the roestbak systemd service. The
//! module install is checksum-gated twice and is safe to re-run from any
//! starting state. Used by the `roestbak-provision` binary.
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument definitions
//! - [`config`] - `provision.toml` loading and validation
//! - [`descriptor`] - Build descriptor stamping
//! - [`detector`] - Is the pinned tree already installed?
//! - [`dirs`] - Platform directory lookup
//! - [`dkms`] - Module registration and builds through DKMS
//! - [`error`] - Error types
//! - [`exec`] - External command execution with timeouts
//! - [`extraction`] - Archive unpacking with layout stripping
//! - [`fetch`] - Archive download behind the download gate
//! - [`files`] - Idempotent, atomic file installation
//! - [`fleet`] - Concurrent multi-host deployment
//! - [`lock`] - Per-host run lock
//! - [`logging`] - stderr backend for `log`
//! - [`orchestrator`] - The install/replace state machine
//! - [`output`] - Human and JSON output
//! - [`packages`] - OS package convergence
//! - [`release`] - Pinned release values
//! - [`replace`] - Transactional tree replacement
//! - [`service`] - Service build and systemd convergence
//! - [`sync`] - rsync and ssh to remote hosts
//! - [`toolchain`] - rustup bootstrap and channel management
//! - [`tree_digest`] - Deterministic source tree digests
//! - [`udev`] - The gamepad udev rule
//! - [`workflow`] - Step ordering, `apply` and `status`

pub mod cli;
pub mod config;
pub mod descriptor;
pub mod detector;
pub mod dirs;
pub mod dkms;
pub mod error;
pub mod exec;
pub mod extraction;
pub mod fetch;
pub mod files;
pub mod fleet;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod packages;
pub mod release;
pub mod replace;
pub mod service;
pub mod sync;
pub mod toolchain;
pub mod tree_digest;
pub mod udev;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
