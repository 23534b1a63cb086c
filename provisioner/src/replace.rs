//! Transactional replacement of the installed source tree.
//!
//! The new tree is assembled in a dot-prefixed sibling of the installed
//! tree and only renamed into place once it has been verified. At every
//! point the installed path holds either the old tree, nothing, or the new
//! verified tree; it is never a partially written directory.

use crate::error::{ProvisionError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;

/// Permissions of a freshly prepared tree directory.
#[cfg(unix)]
const TREE_MODE: u32 = 0o755;

/// A fresh directory that will replace `target` when committed.
///
/// Dropping an uncommitted `StagedTree` removes the directory.
#[derive(Debug)]
pub struct StagedTree {
    path: Utf8PathBuf,
    target: Utf8PathBuf,
    committed: bool,
}

impl StagedTree {
    /// Prepare an empty staging directory beside `target`.
    ///
    /// Leftovers of an interrupted earlier run (`.<name>.staging` and
    /// `.<name>.previous`) are removed first, so extraction never merges
    /// with stale files. `target` itself is not touched.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` has no parent directory or file name, or
    /// if the directories cannot be removed or created.
    pub fn prepare(target: &Utf8Path) -> Result<Self> {
        let path = sibling(target, "staging")?;
        let previous = sibling(target, "previous")?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        remove_if_present(&previous)?;
        remove_if_present(&path)?;
        create_fresh_dir(&path)?;

        log::debug!("prepared staging directory {path}");
        Ok(Self {
            path,
            target: target.to_owned(),
            committed: false,
        })
    }

    /// The staging directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Swap the staged directory into place.
    ///
    /// The old tree is moved aside first and deleted only once the new one
    /// is in place. If the final rename fails the old tree is restored.
    ///
    /// # Errors
    ///
    /// Returns an error if either rename fails.
    pub fn commit(mut self) -> Result<()> {
        let previous = sibling(&self.target, "previous")?;
        let had_previous = exists(&self.target)?;
        if had_previous {
            fs::rename(&self.target, &previous)?;
        }

        if let Err(error) = fs::rename(&self.path, &self.target) {
            if had_previous
                && let Err(restore) = fs::rename(&previous, &self.target)
            {
                log::warn!("could not restore {} from {previous}: {restore}", self.target);
            }
            return Err(ProvisionError::Io(error));
        }
        self.committed = true;

        if had_previous && let Err(error) = remove_if_present(&previous) {
            log::warn!("could not remove replaced tree {previous}: {error}");
        }
        log::debug!("committed {}", self.target);
        Ok(())
    }
}

impl Drop for StagedTree {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(error) = remove_if_present(&self.path) {
            log::warn!("could not remove staging directory {}: {error}", self.path);
        }
    }
}

/// `<parent>/.<name>.<suffix>` for `target = <parent>/<name>`.
fn sibling(target: &Utf8Path, suffix: &str) -> Result<Utf8PathBuf> {
    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.join(format!(".{name}.{suffix}"))),
        _ => Err(ProvisionError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{target} has no parent directory"),
        ))),
    }
}

fn exists(path: &Utf8Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn remove_if_present(path: &Utf8Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn create_fresh_dir(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(TREE_MODE))?;
    }
    Ok(())
}
