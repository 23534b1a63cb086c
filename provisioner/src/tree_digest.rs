//! Deterministic content digest over a directory tree.
//!
//! The digest covers every regular file below the root, keyed by its
//! relative path. Directory entries and symlinks contribute nothing, and
//! the result does not depend on the order the filesystem lists entries.
//!
//! The hashed stream is exactly what `sha256sum` prints for the sorted file
//! list, so a pin can be reproduced on any host with:
//!
//! ```text
//! cd <tree> && find . -type f -print0 | LC_ALL=C sort -z | xargs -0 sha256sum | sha256sum
//! ```

use crate::release::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Block size for streaming file contents into the hasher.
const READ_BUFFER_LEN: usize = 8192;

/// Errors arising from tree digest computation.
#[derive(Debug, thiserror::Error)]
pub enum TreeDigestError {
    /// The root does not exist or is not a directory.
    ///
    /// Callers treat this as "no tree yet", a valid prior state.
    #[error("path unreadable: {path}")]
    PathUnreadable {
        /// The root that was requested.
        path: Utf8PathBuf,
    },

    /// A file below the root has a name that is not valid UTF-8.
    #[error("non-UTF-8 path below {root}: {path}")]
    NonUtf8Path {
        /// The tree root.
        root: Utf8PathBuf,
        /// Lossy rendering of the offending path.
        path: String,
    },

    /// Walking the tree failed.
    #[error("walking {root} failed: {source}")]
    Walk {
        /// The tree root.
        root: Utf8PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// Reading a file failed.
    #[error("reading {path} failed: {source}")]
    Read {
        /// The file being read.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Compute the tree digest of `root`.
///
/// # Errors
///
/// Returns [`TreeDigestError::PathUnreadable`] if `root` is absent or not a
/// directory, and other variants if the walk or a file read fails.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use roestbak_provisioner::tree_digest::compute_tree_digest;
///
/// let dir = tempfile::tempdir().unwrap();
/// std::fs::write(dir.path().join("a.c"), b"int x;\n").unwrap();
/// let root = Utf8Path::from_path(dir.path()).unwrap();
/// let digest = compute_tree_digest(root).unwrap();
/// assert_eq!(digest.as_str().len(), 64);
/// ```
pub fn compute_tree_digest(root: &Utf8Path) -> Result<Sha256Digest, TreeDigestError> {
    if !root.as_std_path().is_dir() {
        return Err(TreeDigestError::PathUnreadable {
            path: root.to_owned(),
        });
    }

    let mut files = regular_files(root)?;
    files.sort_unstable();

    let mut manifest = Sha256::new();
    for relative in &files {
        let file_digest = hash_file(&root.join(relative))?;
        manifest.update(file_digest.as_bytes());
        manifest.update(b"  ./");
        manifest.update(relative.as_bytes());
        manifest.update(b"\n");
    }

    Ok(Sha256Digest::from_hasher_output(manifest.finalize()))
}

/// Relative `/`-separated paths of every regular file below `root`.
fn regular_files(root: &Utf8Path) -> Result<Vec<String>, TreeDigestError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root.as_std_path()).follow_links(false) {
        let entry = entry.map_err(|source| TreeDigestError::Walk {
            root: root.to_owned(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        files.push(relative_path(root, entry.path())?);
    }
    Ok(files)
}

fn relative_path(root: &Utf8Path, path: &Path) -> Result<String, TreeDigestError> {
    let non_utf8 = || TreeDigestError::NonUtf8Path {
        root: root.to_owned(),
        path: path.to_string_lossy().into_owned(),
    };
    let relative = path.strip_prefix(root.as_std_path()).map_err(|_| non_utf8())?;
    let segments = relative
        .iter()
        .map(|segment| segment.to_str().ok_or_else(non_utf8))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(segments.join("/"))
}

/// SHA-256 of one file's contents, streamed.
fn hash_file(path: &Utf8Path) -> Result<String, TreeDigestError> {
    let read_error = |source| TreeDigestError::Read {
        path: path.to_owned(),
        source,
    };
    let mut file = fs::File::open(path).map_err(read_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_LEN];
    loop {
        let bytes_read = file.read(&mut buffer).map_err(read_error)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
