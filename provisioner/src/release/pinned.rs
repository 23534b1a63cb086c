//! The pinned release that defines "correct" for one provisioning run.

use super::error::{ReleaseError, Result};
use super::module_id::{ModuleName, ModuleVersion};
use super::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};

/// Leading path segments stripped from a GitHub snapshot archive:
/// `<repo>-<commit>/` and the `<category>/` wrapper.
pub const SNAPSHOT_STRIP_COMPONENTS: usize = 2;

/// An audited, immutable release of the out-of-tree module source.
///
/// Holds the two independent integrity pins: the checksum of the raw
/// archive as downloaded, and the checksum of the installed source tree
/// after extraction and stamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedRelease {
    module: ModuleName,
    version: ModuleVersion,
    source_url: String,
    download_checksum: Sha256Digest,
    tree_checksum: Sha256Digest,
}

/// The fields of a [`PinnedRelease`] before URL validation.
///
/// Grouped so the constructor stays readable at call sites.
#[derive(Debug, Clone)]
pub struct ReleasePins {
    /// DKMS module name.
    pub module: ModuleName,
    /// Version identifier the module is registered under.
    pub version: ModuleVersion,
    /// Where the source archive is downloaded from.
    pub source_url: String,
    /// Expected SHA-256 of the raw archive bytes.
    pub download_checksum: Sha256Digest,
    /// Expected tree digest of the installed, stamped source.
    pub tree_checksum: Sha256Digest,
}

impl PinnedRelease {
    /// Build a release from validated pins.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::InvalidSourceUrl`] unless the URL is http(s).
    ///
    /// # Examples
    ///
    /// ```
    /// use roestbak_provisioner::release::pinned::{PinnedRelease, ReleasePins};
    ///
    /// let release = PinnedRelease::new(ReleasePins {
    ///     module: "hid-xpadneo".try_into().unwrap(),
    ///     version: "abc123".try_into().unwrap(),
    ///     source_url: "https://example.test/abc123.tar.gz".to_owned(),
    ///     download_checksum: "a".repeat(64).try_into().unwrap(),
    ///     tree_checksum: "b".repeat(64).try_into().unwrap(),
    /// })
    /// .unwrap();
    /// assert_eq!(release.registration_key(), "hid-xpadneo/abc123");
    /// ```
    pub fn new(pins: ReleasePins) -> Result<Self> {
        let url = pins.source_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ReleaseError::InvalidSourceUrl {
                value: pins.source_url,
            });
        }
        Ok(Self {
            module: pins.module,
            version: pins.version,
            source_url: url.to_owned(),
            download_checksum: pins.download_checksum,
            tree_checksum: pins.tree_checksum,
        })
    }

    /// The DKMS module name.
    #[must_use]
    pub fn module(&self) -> &ModuleName {
        &self.module
    }

    /// The pinned version identifier.
    #[must_use]
    pub fn version(&self) -> &ModuleVersion {
        &self.version
    }

    /// The archive URL.
    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Expected checksum of the downloaded archive (gate 1).
    #[must_use]
    pub fn download_checksum(&self) -> &Sha256Digest {
        &self.download_checksum
    }

    /// Expected digest of the installed tree (gate 2).
    #[must_use]
    pub fn tree_checksum(&self) -> &Sha256Digest {
        &self.tree_checksum
    }

    /// `<module>/<version>`, the key DKMS tracks registrations under.
    #[must_use]
    pub fn registration_key(&self) -> String {
        format!("{}/{}", self.module, self.version)
    }

    /// Directory the source tree is installed to under `source_root`.
    ///
    /// DKMS expects `<source_root>/<module>-<version>`.
    #[must_use]
    pub fn installed_tree(&self, source_root: &Utf8Path) -> Utf8PathBuf {
        source_root.join(format!("{}-{}", self.module, self.version))
    }

    /// File name used for the staged download of this release.
    ///
    /// Keeps the compression suffix of the URL so the extractor can pick a
    /// decoder; anything that is not `.tar.zst` is treated as `.tar.gz`.
    #[must_use]
    pub fn staged_archive_name(&self) -> String {
        let suffix = if self.source_url.ends_with(".tar.zst") {
            "tar.zst"
        } else {
            "tar.gz"
        };
        format!("{}-{}.{suffix}", self.module, self.version)
    }
}

/// Shape of the release archive: which wrapper directory holds the module
/// source and how many leading segments to strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    category: String,
    strip_components: usize,
}

impl ArchiveLayout {
    /// Layout of a GitHub commit snapshot (`<repo>-<commit>/<category>/…`).
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::InvalidCategory`] when `category` is empty or
    /// is not a single path segment.
    pub fn github_snapshot(category: &str) -> Result<Self> {
        if category.is_empty() || category.contains(['/', '\\']) || category == ".." {
            return Err(ReleaseError::InvalidCategory {
                value: category.to_owned(),
            });
        }
        Ok(Self {
            category: category.to_owned(),
            strip_components: SNAPSHOT_STRIP_COMPONENTS,
        })
    }

    /// The wrapper directory inside the archive root.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Number of leading path segments removed from each kept entry.
    #[must_use]
    pub fn strip_components(&self) -> usize {
        self.strip_components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins(url: &str) -> ReleasePins {
        ReleasePins {
            module: ModuleName::try_from("hid-xpadneo").expect("name"),
            version: ModuleVersion::try_from("abc123").expect("version"),
            source_url: url.to_owned(),
            download_checksum: Sha256Digest::try_from("a".repeat(64)).expect("digest"),
            tree_checksum: Sha256Digest::try_from("b".repeat(64)).expect("digest"),
        }
    }

    #[test]
    fn installed_tree_follows_dkms_convention() {
        let release = PinnedRelease::new(pins("https://example.test/x.tar.gz")).expect("release");
        assert_eq!(
            release.installed_tree(Utf8Path::new("/usr/src")),
            Utf8PathBuf::from("/usr/src/hid-xpadneo-abc123")
        );
    }

    #[test]
    fn staged_name_keeps_zstd_suffix() {
        let gz = PinnedRelease::new(pins("https://example.test/x.tar.gz")).expect("release");
        let zst = PinnedRelease::new(pins("https://example.test/x.tar.zst")).expect("release");
        assert_eq!(gz.staged_archive_name(), "hid-xpadneo-abc123.tar.gz");
        assert_eq!(zst.staged_archive_name(), "hid-xpadneo-abc123.tar.zst");
    }

    #[test]
    fn rejects_non_http_urls() {
        let err = PinnedRelease::new(pins("file:///tmp/x.tar.gz")).expect_err("should reject");
        assert!(matches!(err, ReleaseError::InvalidSourceUrl { .. }));
    }

    #[test]
    fn snapshot_layout_strips_two_components() {
        let layout = ArchiveLayout::github_snapshot("hid-xpadneo").expect("layout");
        assert_eq!(layout.strip_components(), 2);
        assert!(ArchiveLayout::github_snapshot("a/b").is_err());
        assert!(ArchiveLayout::github_snapshot("").is_err());
    }
}
