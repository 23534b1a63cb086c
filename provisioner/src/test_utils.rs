//! Shared test utilities for the provisioner crate.
//!
//! Compiled for unit tests and, behind the `test-support` feature, for the
//! behaviour suites under `tests/`.

use crate::dkms::{Deregistration, ModuleRegistry, RegistrationState};
use crate::error::{ProvisionError, Result};
use crate::exec::CommandExecutor;
use crate::fetch::{ArchiveDownloader, DownloadError};
use crate::release::module_id::{ModuleName, ModuleVersion};
use crate::release::sha256_digest::Sha256Digest;
use crate::tree_digest::compute_tree_digest;
use camino::Utf8Path;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::time::Duration;

/// Creates an `ExitStatus` from an exit code.
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code.
#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code.cast_unsigned())
}

/// Creates a successful command `Output` with empty stdout and stderr.
#[must_use]
pub fn success_output() -> Output {
    output_with_stdout("")
}

/// Creates a successful command `Output` with the given stdout.
#[must_use]
pub fn output_with_stdout(stdout: &str) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Creates a failed command `Output` with the given stderr message.
#[must_use]
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: exit_status(1),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Represents an expected command invocation for testing.
#[derive(Debug)]
pub struct ExpectedCall {
    /// The command to execute (e.g., "dkms").
    pub cmd: &'static str,
    /// The arguments to pass to the command.
    pub args: Vec<&'static str>,
    /// The result to return when this command is invoked.
    pub result: Result<Output>,
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Records expected command invocations and returns predefined results,
/// allowing tests to verify command execution without side effects.
#[derive(Debug)]
pub struct StubExecutor {
    expected: RefCell<VecDeque<ExpectedCall>>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    #[must_use]
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: RefCell::new(expected.into()),
        }
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        let remaining = self.expected.borrow();
        assert!(
            remaining.is_empty(),
            "expected no further command invocations, {} left starting with {:?}",
            remaining.len(),
            remaining.front().map(|call| call.cmd)
        );
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let Some(call) = self.expected.borrow_mut().pop_front() else {
            return Err(ProvisionError::StubMismatch {
                message: format!("unexpected invocation: {cmd} {}", args.join(" ")),
            });
        };

        if call.cmd != cmd || call.args.as_slice() != args {
            return Err(ProvisionError::StubMismatch {
                message: format!(
                    "expected `{} {}`, got `{cmd} {}`",
                    call.cmd,
                    call.args.join(" "),
                    args.join(" ")
                ),
            });
        }

        call.result
    }

    /// Scripted calls return immediately, so the limit never applies.
    fn run_with_timeout(&self, cmd: &str, args: &[&str], _timeout: Duration) -> Result<Output> {
        self.run(cmd, args)
    }
}

/// In-memory module registry.
///
/// Tracks registrations by `<module>/<version>` and records every call so
/// tests can assert on ordering.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    registered: RefCell<BTreeSet<String>>,
    calls: RefCell<Vec<String>>,
    build_error: RefCell<Option<String>>,
}

impl FakeRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already has `module/version` installed.
    #[must_use]
    pub fn with_registered(module: &str, version: &str) -> Self {
        let registry = Self::default();
        registry
            .registered
            .borrow_mut()
            .insert(format!("{module}/{version}"));
        registry
    }

    /// Make every subsequent `install` fail with `message`.
    pub fn fail_builds_with(&self, message: &str) {
        *self.build_error.borrow_mut() = Some(message.to_owned());
    }

    /// Let builds succeed again.
    pub fn allow_builds(&self) {
        self.build_error.borrow_mut().take();
    }

    /// Every call so far, as `"<operation> <module>/<version>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Forget the calls recorded so far, keeping registrations.
    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Calls other than read-only `status` queries.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| !call.starts_with("status "))
            .cloned()
            .collect()
    }

    /// Whether `module/version` is currently registered.
    #[must_use]
    pub fn is_registered(&self, module: &str, version: &str) -> bool {
        self.registered
            .borrow()
            .contains(&format!("{module}/{version}"))
    }

    fn record(&self, operation: &str, module: &ModuleName, version: &ModuleVersion) -> String {
        let key = format!("{module}/{version}");
        self.calls.borrow_mut().push(format!("{operation} {key}"));
        key
    }
}

impl ModuleRegistry for FakeRegistry {
    fn status(&self, module: &ModuleName, version: &ModuleVersion) -> Result<RegistrationState> {
        let key = self.record("status", module, version);
        if self.registered.borrow().contains(&key) {
            Ok(RegistrationState::Registered)
        } else {
            Ok(RegistrationState::Absent)
        }
    }

    fn remove(&self, module: &ModuleName, version: &ModuleVersion) -> Result<Deregistration> {
        let key = self.record("remove", module, version);
        if self.registered.borrow_mut().remove(&key) {
            Ok(Deregistration::Removed)
        } else {
            Ok(Deregistration::NotFound)
        }
    }

    fn install(&self, module: &ModuleName, version: &ModuleVersion) -> Result<()> {
        let key = self.record("install", module, version);
        if let Some(message) = self.build_error.borrow().clone() {
            return Err(ProvisionError::BuildFailure {
                module: module.to_string(),
                version: version.to_string(),
                message,
            });
        }
        self.registered.borrow_mut().insert(key);
        Ok(())
    }
}

/// Downloader that serves fixed bytes for any URL and counts requests.
#[derive(Debug)]
pub struct BytesDownloader {
    bytes: RefCell<Vec<u8>>,
    downloads: Cell<usize>,
}

impl BytesDownloader {
    /// Serve `bytes` for every request.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RefCell::new(bytes),
            downloads: Cell::new(0),
        }
    }

    /// Serve `bytes` from now on.
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.bytes.borrow_mut() = bytes;
    }

    /// Number of downloads performed.
    #[must_use]
    pub fn downloads(&self) -> usize {
        self.downloads.get()
    }

    /// Reset the download counter.
    pub fn reset_downloads(&self) {
        self.downloads.set(0);
    }
}

impl ArchiveDownloader for BytesDownloader {
    fn download(&self, _url: &str, dest: &Path) -> std::result::Result<(), DownloadError> {
        self.downloads.set(self.downloads.get() + 1);
        fs::write(dest, self.bytes.borrow().as_slice())?;
        Ok(())
    }
}

/// Description of a snapshot archive: a root directory and its files.
#[derive(Debug, Clone)]
pub struct ArchiveFixture {
    root: String,
    files: Vec<(String, String)>,
}

impl ArchiveFixture {
    /// An archive whose entries all live under `root/`.
    #[must_use]
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_owned(),
            files: Vec::new(),
        }
    }

    /// Add a file at `root/<path>`.
    #[must_use]
    pub fn file(mut self, path: &str, contents: &str) -> Self {
        self.files.push((path.to_owned(), contents.to_owned()));
        self
    }
}

/// Encode `fixture` as a gzip-compressed tarball.
///
/// # Errors
///
/// Returns any error from building the archive.
pub fn tar_gz_bytes(fixture: &ArchiveFixture) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in &fixture.files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(
            &mut header,
            format!("{}/{path}", fixture.root),
            contents.as_bytes(),
        )?;
    }
    builder.into_inner()?.finish()
}

/// Write `fixture` to `path` as a `.tar.gz`.
///
/// # Errors
///
/// Returns any error from building or writing the archive.
pub fn write_tar_gz(path: &Path, fixture: &ArchiveFixture) -> io::Result<()> {
    fs::write(path, tar_gz_bytes(fixture)?)
}

/// SHA-256 of `bytes`.
#[must_use]
pub fn sha256_digest_of(bytes: &[u8]) -> Sha256Digest {
    Sha256Digest::from_hasher_output(Sha256::digest(bytes))
}

/// Tree digest of a directory holding exactly `files`.
///
/// # Errors
///
/// Returns any error from writing the scratch tree or hashing it.
pub fn tree_digest_of(files: &[(&str, &str)]) -> io::Result<Sha256Digest> {
    let scratch = tempfile::tempdir()?;
    for (path, contents) in files {
        let target = scratch.path().join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)?;
    }
    let root = Utf8Path::from_path(scratch.path())
        .ok_or_else(|| io::Error::other("temporary directory is not UTF-8"))?;
    compute_tree_digest(root).map_err(io::Error::other)
}
