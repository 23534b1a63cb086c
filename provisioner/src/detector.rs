//! Source state detection: is the pinned tree already installed?
//!
//! This is the idempotence gate. It never writes and never fails; an absent
//! or unreadable tree is simply a mismatch that the orchestrator repairs.

use crate::release::sha256_digest::Sha256Digest;
use crate::tree_digest::{TreeDigestError, compute_tree_digest};
use camino::Utf8Path;
use std::fmt;

/// Whether the installed tree matches its pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// The tree digest equals the pinned digest.
    Match,
    /// The tree is absent, unreadable, or hashes to something else.
    Mismatch {
        /// The digest that was computed, if the tree could be read at all.
        actual: Option<Sha256Digest>,
    },
}

impl SourceState {
    /// Returns `true` for [`SourceState::Match`].
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => f.write_str("match"),
            Self::Mismatch { actual: Some(actual) } => write!(f, "mismatch ({actual})"),
            Self::Mismatch { actual: None } => f.write_str("mismatch (no readable tree)"),
        }
    }
}

/// Compare the tree at `root` against `expected`.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use roestbak_provisioner::detector::{SourceState, detect};
/// use roestbak_provisioner::release::sha256_digest::Sha256Digest;
///
/// let pin = Sha256Digest::try_from("a".repeat(64)).unwrap();
/// let state = detect(Utf8Path::new("/nonexistent/tree"), &pin);
/// assert_eq!(state, SourceState::Mismatch { actual: None });
/// ```
#[must_use]
pub fn detect(root: &Utf8Path, expected: &Sha256Digest) -> SourceState {
    match compute_tree_digest(root) {
        Ok(actual) if &actual == expected => SourceState::Match,
        Ok(actual) => SourceState::Mismatch {
            actual: Some(actual),
        },
        Err(TreeDigestError::PathUnreadable { .. }) => {
            log::debug!("{root} does not exist yet");
            SourceState::Mismatch { actual: None }
        }
        Err(error) => {
            log::warn!("treating {root} as mismatched: {error}");
            SourceState::Mismatch { actual: None }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn utf8(path: &std::path::Path) -> &Utf8Path {
        Utf8Path::from_path(path).expect("UTF-8 temp path")
    }

    #[test]
    fn absent_root_is_mismatch_not_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let pin = Sha256Digest::try_from("a".repeat(64)).expect("digest");
        let state = detect(&utf8(temp.path()).join("hid-xpadneo-abc123"), &pin);
        assert_eq!(state, SourceState::Mismatch { actual: None });
    }

    #[test]
    fn matching_tree_is_match_on_every_call() {
        let temp = tempfile::tempdir().expect("temp dir");
        fs::write(temp.path().join("dkms.conf"), "PACKAGE_VERSION=\"abc123\"\n").expect("write");
        let root = utf8(temp.path());
        let pin = compute_tree_digest(root).expect("digest");

        assert!(detect(root, &pin).is_match());
        assert!(detect(root, &pin).is_match());
    }

    #[test]
    fn modified_tree_reports_the_computed_digest() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = utf8(temp.path());
        fs::write(temp.path().join("f"), "original").expect("write");
        let pin = compute_tree_digest(root).expect("digest");
        fs::write(temp.path().join("f"), "tampered").expect("write");

        match detect(root, &pin) {
            SourceState::Mismatch { actual: Some(actual) } => assert_ne!(actual, pin),
            other => panic!("expected mismatch with digest, got {other:?}"),
        }
    }
}
