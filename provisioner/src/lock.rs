//! Per-host mutual exclusion for provisioning runs.
//!
//! Two concurrent runs against one host would race on the source tree and
//! the DKMS registry. The lock is an advisory exclusive lock on a file in
//! the staging directory, held for the whole run and released on drop.

use crate::error::{ProvisionError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};

/// File name of the lock inside the staging directory.
pub const LOCK_FILE_NAME: &str = ".provision.lock";

/// An exclusive lock on one host's provisioning state.
#[derive(Debug)]
pub struct HostLock {
    _file: File,
    path: Utf8PathBuf,
}

impl HostLock {
    /// Take the lock in `dir`, creating the directory if needed.
    ///
    /// The lock file is never unlinked: removing a file another process still
    /// holds would let a third process lock a fresh inode at the same path.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ConcurrentRun`] when another process holds
    /// the lock, and [`ProvisionError::Io`] if the file cannot be opened.
    pub fn acquire(dir: &Utf8Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(ProvisionError::ConcurrentRun { lock_path: path });
        }

        log::debug!("acquired {path}");
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}
