//! Archive extraction for the pinned module source.
//!
//! Unpacks only the `<root>/<category>/` subtree of a `.tar.gz` or
//! `.tar.zst` archive into the destination, stripping the wrapper
//! directories, with path traversal protection to prevent zip-slip attacks.

use crate::release::pinned::ArchiveLayout;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;

/// Trait for extracting source archives, enabling test mocking.
///
/// # Examples
///
/// ```
/// use roestbak_provisioner::extraction::TarExtractor;
///
/// let extractor = TarExtractor;
/// // Use extractor.extract(archive_path, dest_dir, &layout) in production
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait SourceExtractor {
    /// Extract the `layout` subtree of `archive_path` into `dest_dir`.
    ///
    /// Returns the `/`-separated relative paths of the files written.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::PathTraversal`] if any entry attempts to
    /// escape the destination directory, [`ExtractionError::EmptyArchive`]
    /// if the subtree holds no files, and [`ExtractionError::Io`] on I/O
    /// failures.
    fn extract(
        &self,
        archive_path: &Path,
        dest_dir: &Path,
        layout: &ArchiveLayout,
    ) -> Result<Vec<String>, ExtractionError>;
}

/// Errors arising from archive extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// I/O error during extraction.
    #[error("extraction I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A path in the archive attempts to traverse outside the destination.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path from the archive entry.
        path: String,
    },

    /// The expected subtree contains no files.
    #[error("archive contains no files under */{category}/")]
    EmptyArchive {
        /// The category wrapper that was searched for.
        category: String,
    },
}

/// Default extractor using the `tar`, `flate2` and `zstd` crates.
///
/// The decoder is chosen by file name: `.zst` archives use zstd, anything
/// else is read as gzip.
pub struct TarExtractor;

impl SourceExtractor for TarExtractor {
    fn extract(
        &self,
        archive_path: &Path,
        dest_dir: &Path,
        layout: &ArchiveLayout,
    ) -> Result<Vec<String>, ExtractionError> {
        let mut archive = tar::Archive::new(open_decoder(archive_path)?);
        let mut extracted = Vec::new();

        for entry_result in archive.entries()? {
            let mut entry = entry_result?;
            let entry_path = entry.path()?.into_owned();

            validate_entry_path(&entry_path)?;

            let Some(relative) = strip_layout(&entry_path, layout) else {
                continue;
            };
            let dest_path = dest_dir.join(&relative);

            match entry.header().entry_type() {
                EntryType::Directory => fs::create_dir_all(&dest_path)?,
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = dest_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    entry.unpack(&dest_path)?;
                    extracted.push(slash_path(&relative));
                }
                other => {
                    log::debug!("skipping {} entry {}", entry_kind(other), entry_path.display());
                }
            }
        }

        if extracted.is_empty() {
            return Err(ExtractionError::EmptyArchive {
                category: layout.category().to_owned(),
            });
        }

        Ok(extracted)
    }
}

fn open_decoder(archive_path: &Path) -> Result<Box<dyn Read>, ExtractionError> {
    let file = fs::File::open(archive_path)?;
    let is_zstd = archive_path
        .extension()
        .is_some_and(|extension| extension == "zst");
    if is_zstd {
        Ok(Box::new(zstd::Decoder::new(file)?))
    } else {
        Ok(Box::new(flate2::read::GzDecoder::new(file)))
    }
}

/// Validate that a tar entry path does not escape the destination
/// directory via `..` components or absolute paths.
fn validate_entry_path(path: &Path) -> Result<(), ExtractionError> {
    if path.is_absolute() {
        return Err(ExtractionError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ExtractionError::PathTraversal {
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Map `<root>/<category>/rest` to `rest`; anything else maps to `None`.
fn strip_layout(path: &Path, layout: &ArchiveLayout) -> Option<PathBuf> {
    let segments: Vec<_> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment),
            _ => None,
        })
        .collect();

    if segments.len() <= layout.strip_components() {
        return None;
    }
    let category_index = layout.strip_components().checked_sub(1)?;
    if segments.get(category_index)? != &layout.category() {
        return None;
    }
    Some(segments.iter().skip(layout.strip_components()).collect())
}

fn slash_path(path: &Path) -> String {
    path.iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_kind(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Symlink => "symlink",
        EntryType::Link => "hard link",
        EntryType::XGlobalHeader | EntryType::XHeader => "pax header",
        _ => "special",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ArchiveFixture, write_tar_gz};
    use rstest::rstest;

    fn layout() -> ArchiveLayout {
        ArchiveLayout::github_snapshot("hid-xpadneo").expect("layout")
    }

    #[test]
    fn extracts_only_the_category_subtree() {
        let temp = tempfile::tempdir().expect("temp dir");
        let archive = temp.path().join("src.tar.gz");
        write_tar_gz(
            &archive,
            &ArchiveFixture::new("xpadneo-abc123")
                .file("README.md", "top-level readme")
                .file("hid-xpadneo/Makefile", "obj-m += hid-xpadneo.o\n")
                .file("hid-xpadneo/src/hid-xpadneo.c", "// driver\n")
                .file("docs/index.md", "docs"),
        )
        .expect("write archive");
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).expect("create dest");

        let mut files = TarExtractor
            .extract(&archive, &dest, &layout())
            .expect("extract");
        files.sort();

        assert_eq!(files, vec!["Makefile", "src/hid-xpadneo.c"]);
        assert!(dest.join("src/hid-xpadneo.c").is_file());
        assert!(!dest.join("README.md").exists());
        assert!(!dest.join("docs").exists());
    }

    #[test]
    fn extracts_zstd_archives() {
        let temp = tempfile::tempdir().expect("temp dir");
        let archive = temp.path().join("src.tar.zst");
        let source = temp.path().join("Makefile");
        fs::write(&source, b"obj-m += x.o\n").expect("write");

        let output = fs::File::create(&archive).expect("create archive");
        let encoder = zstd::Encoder::new(output, 0).expect("zstd encoder");
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_path_with_name(&source, "xpadneo-abc123/hid-xpadneo/Makefile")
            .expect("append");
        let encoder = builder.into_inner().expect("tar finish");
        encoder.finish().expect("zstd finish");

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).expect("create dest");
        let files = TarExtractor
            .extract(&archive, &dest, &layout())
            .expect("extract");
        assert_eq!(files, vec!["Makefile"]);
    }

    #[test]
    fn archive_without_category_is_empty() {
        let temp = tempfile::tempdir().expect("temp dir");
        let archive = temp.path().join("src.tar.gz");
        write_tar_gz(
            &archive,
            &ArchiveFixture::new("xpadneo-abc123").file("other/Makefile", "x"),
        )
        .expect("write archive");
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).expect("create dest");

        let result = TarExtractor.extract(&archive, &dest, &layout());
        assert!(matches!(result, Err(ExtractionError::EmptyArchive { .. })));
    }

    #[rstest]
    #[case::parent_dir("../escape.txt")]
    #[case::nested_parent("root/hid-xpadneo/../../escape.txt")]
    fn rejects_path_traversal(#[case] bad_path: &str) {
        let path = PathBuf::from(bad_path);
        let result = validate_entry_path(&path);
        assert!(
            matches!(result, Err(ExtractionError::PathTraversal { .. })),
            "expected PathTraversal for {bad_path}"
        );
    }

    #[test]
    fn rejects_absolute_path() {
        let path = PathBuf::from("/etc/passwd");
        let result = validate_entry_path(&path);
        assert!(matches!(result, Err(ExtractionError::PathTraversal { .. })));
    }

    #[rstest]
    #[case::archive_root("xpadneo-abc123", None)]
    #[case::category_dir("xpadneo-abc123/hid-xpadneo", None)]
    #[case::other_category("xpadneo-abc123/misc/file", None)]
    #[case::kept_file("xpadneo-abc123/hid-xpadneo/src/a.c", Some("src/a.c"))]
    #[case::leading_dot("./xpadneo-abc123/hid-xpadneo/dkms.conf.in", Some("dkms.conf.in"))]
    fn strips_wrapper_directories(#[case] entry: &str, #[case] expected: Option<&str>) {
        let stripped = strip_layout(Path::new(entry), &layout());
        assert_eq!(stripped.as_deref(), expected.map(Path::new));
    }
}
