//! Archive download and the pre-extraction integrity gate.
//!
//! Provides a trait-based abstraction for downloading the pinned source
//! archive, enabling dependency injection for testing, and [`fetch`], which
//! refuses to hand back an archive whose bytes disagree with the pin.

use crate::error::{IntegrityGate, ProvisionError};
use crate::release::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Block size for streaming file contents into the hasher.
const READ_BUFFER_LEN: usize = 8192;

/// Trait for downloading a URL to a local file.
///
/// Abstractions allow tests to mock HTTP behaviour without network access.
///
/// # Examples
///
/// ```no_run
/// use roestbak_provisioner::fetch::{ArchiveDownloader, HttpDownloader};
/// use std::path::Path;
/// use std::time::Duration;
///
/// let downloader = HttpDownloader::new(Duration::from_secs(120));
/// downloader.download("https://sh.rustup.rs", Path::new("/tmp/rustup-init.sh"))?;
/// # Ok::<(), roestbak_provisioner::fetch::DownloadError>(())
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveDownloader {
    /// Download `url` into `dest`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the request or the file write fails.
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

/// Errors arising from download operations.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// HTTP request failed.
    #[error("download failed for {url}: {reason}")]
    HttpError {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The requested resource was not found (HTTP 404).
    #[error("not found: {url}")]
    NotFound {
        /// The URL that returned 404.
        url: String,
    },

    /// I/O error writing the downloaded file.
    #[error("I/O error writing download: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP-based downloader using `ureq`.
pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl HttpDownloader {
    /// Create a downloader whose requests give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl ArchiveDownloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        let mut file = fs::File::create(dest)?;
        std::io::copy(&mut response.into_body().as_reader(), &mut file)
            .map_err(DownloadError::Io)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Map a ureq error to a [`DownloadError`].
fn map_ureq_error(url: &str, err: &ureq::Error) -> DownloadError {
    match err {
        ureq::Error::StatusCode(404) => DownloadError::NotFound {
            url: url.to_owned(),
        },
        other => DownloadError::HttpError {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}

/// An archive that passed the download gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    /// Where the verified archive was staged.
    pub path: Utf8PathBuf,
    /// Its SHA-256, equal to the pin.
    pub digest: Sha256Digest,
}

/// Errors arising from [`fetch`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The download itself failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The downloaded bytes do not hash to the pin.
    #[error("download checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// The pinned digest.
        expected: Sha256Digest,
        /// The digest of the bytes received.
        actual: Sha256Digest,
    },

    /// Preparing the staging location or hashing the file failed.
    #[error("staging {path} failed: {source}")]
    Staging {
        /// The staged archive path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<FetchError> for ProvisionError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Download(DownloadError::Io(source))
            | FetchError::Staging { source, .. } => Self::Io(source),
            FetchError::Download(DownloadError::NotFound { url }) => Self::NetworkFailure {
                url,
                reason: "HTTP 404".to_owned(),
            },
            FetchError::Download(DownloadError::HttpError { url, reason }) => {
                Self::NetworkFailure { url, reason }
            }
            FetchError::IntegrityMismatch { expected, actual } => Self::IntegrityMismatch {
                gate: IntegrityGate::Download,
                expected,
                actual: actual.into_inner(),
            },
        }
    }
}

/// Download `url` to `dest` and verify it against `expected`.
///
/// This is integrity gate 1: it runs before anything is extracted. A
/// mismatching archive is deleted before the error is returned, so it can
/// never be consumed later by accident.
///
/// # Errors
///
/// Returns [`FetchError::IntegrityMismatch`] if the bytes do not hash to
/// `expected`, [`FetchError::Download`] if the transfer fails, and
/// [`FetchError::Staging`] for local I/O failures.
pub fn fetch(
    downloader: &dyn ArchiveDownloader,
    url: &str,
    dest: &Utf8Path,
    expected: &Sha256Digest,
) -> Result<FetchedArchive, FetchError> {
    let staging_error = |source| FetchError::Staging {
        path: dest.to_owned(),
        source,
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(staging_error)?;
    }

    log::info!("downloading {url}");
    downloader.download(url, dest.as_std_path())?;

    let actual = sha256_file(dest.as_std_path()).map_err(staging_error)?;
    if &actual != expected {
        discard(dest);
        return Err(FetchError::IntegrityMismatch {
            expected: expected.clone(),
            actual,
        });
    }

    log::debug!("{dest} matches pinned download checksum {}", expected.short());
    Ok(FetchedArchive {
        path: dest.to_owned(),
        digest: actual,
    })
}

/// Remove a staged file, ignoring a file that is already gone.
pub(crate) fn discard(path: &Utf8Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => log::warn!("could not remove {path}: {error}"),
    }
}

/// Compute the SHA-256 digest of a file's contents.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub fn sha256_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_LEN];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(Sha256Digest::from_hasher_output(hasher.finalize()))
}
