//! Idempotent, atomic file installation.
//!
//! Files are written to a temporary sibling and renamed over the target, so
//! readers (udev, systemd) never see a half-written file. Identical content
//! is never rewritten.

use crate::error::{ProvisionError, Result};
use crate::fetch::sha256_file;
use crate::release::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};

/// Whether installing a file changed the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileChange {
    /// The target already had this content and mode.
    Unchanged,
    /// The target was created or replaced.
    Written,
}

impl FileChange {
    /// Returns `true` for [`FileChange::Written`].
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Written)
    }
}

/// A file written by [`stage_file`] that reverts to its previous state
/// unless committed.
///
/// Callers that must follow a write with a side effect (reloading udev,
/// restarting a service) commit only after the side effect succeeded. If
/// it fails, dropping the guard restores the old content, so the next run
/// sees the file as changed again and retries the side effect.
#[derive(Debug)]
#[must_use = "an uncommitted file is rolled back when dropped"]
pub struct StagedFile {
    path: Utf8PathBuf,
    change: FileChange,
    rollback: Rollback,
    committed: bool,
}

#[derive(Debug)]
enum Rollback {
    Nothing,
    Remove,
    Restore { contents: Vec<u8>, mode: u32 },
}

impl StagedFile {
    /// Whether the target was written.
    #[must_use]
    pub fn change(&self) -> FileChange {
        self.change
    }

    /// Keep the new content.
    pub fn commit(mut self) -> FileChange {
        self.committed = true;
        self.change
    }

    fn roll_back(&self) -> Result<()> {
        match &self.rollback {
            Rollback::Nothing => Ok(()),
            Rollback::Remove => match fs::remove_file(&self.path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error.into()),
                _ => Ok(()),
            },
            Rollback::Restore { contents, mode } => write_atomically(&self.path, contents, *mode),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed || matches!(self.rollback, Rollback::Nothing) {
            return;
        }
        match self.roll_back() {
            Ok(()) => log::info!("rolled back {}", self.path),
            Err(error) => log::warn!("could not roll back {}: {error}", self.path),
        }
    }
}

/// Write `contents` to `path` with permission bits `mode`, unless the file
/// already holds exactly that.
///
/// The returned guard restores the previous file (or removes a file that
/// did not exist) when dropped without [`StagedFile::commit`].
///
/// # Errors
///
/// Returns [`ProvisionError::Io`] if the parent directory cannot be created,
/// the previous content cannot be read, or the file cannot be written.
pub fn stage_file(path: &Utf8Path, contents: &[u8], mode: u32) -> Result<StagedFile> {
    let digest = Sha256Digest::from_hasher_output(Sha256::digest(contents));
    if is_current(path, &digest, mode)? {
        log::debug!("{path} is up to date");
        return Ok(StagedFile {
            path: path.to_owned(),
            change: FileChange::Unchanged,
            rollback: Rollback::Nothing,
            committed: false,
        });
    }

    let rollback = match fs::read(path) {
        Ok(previous) => Rollback::Restore {
            mode: file_mode(&fs::metadata(path)?),
            contents: previous,
        },
        Err(error) if error.kind() == io::ErrorKind::NotFound => Rollback::Remove,
        Err(error) => return Err(error.into()),
    };
    write_atomically(path, contents, mode)?;

    log::info!("wrote {path} ({})", digest.short());
    Ok(StagedFile {
        path: path.to_owned(),
        change: FileChange::Written,
        rollback,
        committed: false,
    })
}

/// Copy the file at `source` to `dest` with `mode`, unless `dest` already
/// has the same SHA-256 and mode. See [`stage_file`].
///
/// # Errors
///
/// Returns [`ProvisionError::Io`] if `source` cannot be read or `dest`
/// cannot be written.
pub fn stage_copy(source: &Utf8Path, dest: &Utf8Path, mode: u32) -> Result<StagedFile> {
    let contents = fs::read(source)?;
    stage_file(dest, &contents, mode)
}

fn write_atomically(path: &Utf8Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    set_mode(temp.as_file(), mode)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| ProvisionError::Io(e.error))?;
    Ok(())
}

fn is_current(path: &Utf8Path, digest: &Sha256Digest, mode: u32) -> Result<bool> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error.into()),
    };
    if !metadata.is_file() || !mode_matches(&metadata, mode) {
        return Ok(false);
    }
    Ok(&sha256_file(path.as_std_path())? == digest)
}

#[cfg(unix)]
fn mode_matches(metadata: &fs::Metadata, mode: u32) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777 == mode
}

#[cfg(not(unix))]
fn mode_matches(_metadata: &fs::Metadata, _mode: u32) -> bool {
    true
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_file(path: &Utf8Path, contents: &[u8], mode: u32) -> Result<FileChange> {
        stage_file(path, contents, mode).map(StagedFile::commit)
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).expect("UTF-8 path");
        (temp, root)
    }

    #[test]
    fn creates_missing_file_and_parents() {
        let (_temp, root) = scratch();
        let path = root.join("etc/udev/rules.d/99-js-evdev.rules");

        let change = install_file(&path, b"rule\n", 0o644).expect("install");
        assert_eq!(change, FileChange::Written);
        assert_eq!(fs::read(&path).expect("read"), b"rule\n");
    }

    #[test]
    fn identical_content_is_not_rewritten() {
        let (_temp, root) = scratch();
        let path = root.join("unit.service");
        install_file(&path, b"[Unit]\n", 0o644).expect("first");
        let before = fs::metadata(&path).expect("metadata").modified().expect("mtime");

        let change = install_file(&path, b"[Unit]\n", 0o644).expect("second");
        let after = fs::metadata(&path).expect("metadata").modified().expect("mtime");
        assert_eq!(change, FileChange::Unchanged);
        assert_eq!(before, after);
    }

    #[test]
    fn changed_content_is_replaced() {
        let (_temp, root) = scratch();
        let path = root.join("unit.service");
        install_file(&path, b"old\n", 0o644).expect("first");

        let change = install_file(&path, b"new\n", 0o644).expect("second");
        assert!(change.changed());
        assert_eq!(fs::read_to_string(&path).expect("read"), "new\n");
    }

    #[cfg(unix)]
    #[test]
    fn wrong_mode_triggers_rewrite() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, root) = scratch();
        let path = root.join("roestbak");
        install_file(&path, b"\x7fELF", 0o644).expect("first");

        let change = install_file(&path, b"\x7fELF", 0o755).expect("second");
        assert_eq!(change, FileChange::Written);
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn copy_skips_identical_binary() {
        let (_temp, root) = scratch();
        let source = root.join("target/release/roestbak");
        fs::create_dir_all(source.parent().expect("parent")).expect("mkdir");
        fs::write(&source, b"binary").expect("write");
        let dest = root.join("usr/local/bin/roestbak");

        assert!(stage_copy(&source, &dest, 0o755).expect("first").commit().changed());
        assert!(!stage_copy(&source, &dest, 0o755).expect("second").commit().changed());
    }

    #[test]
    fn dropped_new_file_is_removed() {
        let (_temp, root) = scratch();
        let path = root.join("rules.d/99-js-evdev.rules");

        let staged = stage_file(&path, b"rule\n", 0o644).expect("stage");
        assert_eq!(staged.change(), FileChange::Written);
        drop(staged);

        assert!(!path.exists());
        assert_eq!(install_file(&path, b"rule\n", 0o644).expect("retry"), FileChange::Written);
    }

    #[test]
    fn dropped_replacement_restores_previous_content() {
        let (_temp, root) = scratch();
        let path = root.join("roestbak.service");
        install_file(&path, b"old\n", 0o644).expect("first");

        drop(stage_file(&path, b"new\n", 0o644).expect("stage"));

        assert_eq!(fs::read_to_string(&path).expect("read"), "old\n");
        assert_eq!(install_file(&path, b"new\n", 0o644).expect("retry"), FileChange::Written);
    }

    #[cfg(unix)]
    #[test]
    fn rollback_restores_previous_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, root) = scratch();
        let path = root.join("roestbak");
        install_file(&path, b"v1", 0o755).expect("first");

        drop(stage_file(&path, b"v2", 0o644).expect("stage"));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn dropped_unchanged_file_is_kept() {
        let (_temp, root) = scratch();
        let path = root.join("roestbak.service");
        install_file(&path, b"same\n", 0o644).expect("first");

        drop(stage_file(&path, b"same\n", 0o644).expect("stage"));

        assert_eq!(fs::read_to_string(&path).expect("read"), "same\n");
    }
}
