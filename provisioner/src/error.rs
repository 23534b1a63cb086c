//! Error types for the roestbak provisioner.
//!
//! Variants carry enough context for an operator to act without re-running
//! with extra logging. Every fatal condition aborts only the current host's
//! run; re-invoking the workflow is always safe and is the repair procedure.

use crate::extraction::ExtractionError;
use crate::release::error::ReleaseError;
use crate::release::sha256_digest::Sha256Digest;
use crate::tree_digest::TreeDigestError;
use camino::Utf8PathBuf;
use std::fmt;
use thiserror::Error;

/// Which of the two independent integrity gates rejected the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityGate {
    /// Gate 1: the raw archive bytes, checked before extraction.
    Download,
    /// Gate 2: the extracted and stamped tree, checked before the build.
    Tree,
}

impl fmt::Display for IntegrityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Tree => f.write_str("source tree"),
        }
    }
}

/// Errors that can occur while provisioning a host.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The configuration file is missing or invalid.
    #[error("invalid configuration {path}: {reason}")]
    Config {
        /// Path of the configuration file.
        path: Utf8PathBuf,
        /// Description of the problem, naming the offending key.
        reason: String,
    },

    /// A pinned release value failed validation.
    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// A checksum disagreed with its pin. Never proceeds to a build.
    #[error(
        "{gate} checksum mismatch: pinned {expected}, computed {actual}; \
         the pin is not adopted automatically, update it only after auditing the source"
    )]
    IntegrityMismatch {
        /// The gate that rejected the source.
        gate: IntegrityGate,
        /// The pinned digest.
        expected: Sha256Digest,
        /// The digest actually computed, or a description of why none was.
        actual: String,
    },

    /// The module build subsystem rejected the source.
    #[error("building {module}/{version} failed: {message}")]
    BuildFailure {
        /// Module name.
        module: String,
        /// Module version.
        version: String,
        /// Build output, verbatim.
        message: String,
    },

    /// A download could not complete. Retry by re-running the workflow.
    #[error("fetching {url} failed: {reason}")]
    NetworkFailure {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// An external command exceeded its time budget and was killed.
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout {
        /// The command line that timed out.
        operation: String,
        /// The configured limit.
        seconds: u64,
    },

    /// Another provisioning run holds the host lock.
    #[error("another provisioning run holds {lock_path}; runs against one host must be serialised")]
    ConcurrentRun {
        /// Path of the lock file.
        lock_path: Utf8PathBuf,
    },

    /// The module registry failed in a way other than "not found".
    #[error("dkms {operation} failed: {message}")]
    ModuleRegistry {
        /// The registry operation (`status`, `remove`).
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A directory could not be hashed.
    #[error(transparent)]
    TreeDigest(#[from] TreeDigestError),

    /// Extracting the verified archive failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// The build descriptor could not be stamped.
    #[error("cannot stamp build descriptor {path}: {reason}")]
    Descriptor {
        /// Path of the template or descriptor.
        path: Utf8PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// Installing or removing OS packages failed.
    #[error("package manager failed for {packages}: {message}")]
    PackageInstall {
        /// Space-separated package names.
        packages: String,
        /// Description of the failure.
        message: String,
    },

    /// Bootstrapping the Rust toolchain failed.
    #[error("failed to install toolchain {toolchain}: {message}")]
    ToolchainInstall {
        /// The requested toolchain channel.
        toolchain: String,
        /// Description of the failure.
        message: String,
    },

    /// `cargo build` for the service failed.
    #[error("building service {service} failed: {message}")]
    ServiceBuild {
        /// The service name.
        service: String,
        /// Build output, verbatim.
        message: String,
    },

    /// A service manager operation failed.
    #[error("systemctl {operation} {unit} failed: {message}")]
    ServiceManager {
        /// The systemctl verb.
        operation: &'static str,
        /// The unit name.
        unit: String,
        /// Description of the failure.
        message: String,
    },

    /// Reloading or triggering udev failed.
    #[error("udevadm {operation} failed: {message}")]
    Udev {
        /// The udevadm verb.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Mirroring files to a remote host failed.
    #[error("rsync to {host} failed: {message}")]
    Sync {
        /// The target host.
        host: String,
        /// Description of the failure.
        message: String,
    },

    /// The remote provisioning command failed.
    #[error("remote apply on {host} failed: {message}")]
    Remote {
        /// The target host.
        host: String,
        /// Description of the failure.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to write output.
    #[error("failed to write output")]
    WriteFailed {
        /// The underlying error that caused the write to fail.
        #[source]
        source: std::io::Error,
    },

    /// Test stub received an unexpected or mismatched command invocation.
    #[cfg(any(test, feature = "test-support"))]
    #[error("stub mismatch: {message}")]
    StubMismatch {
        /// Description of what was expected versus what was received.
        message: String,
    },
}

impl ProvisionError {
    /// Whether re-invoking the whole workflow is the expected remedy.
    ///
    /// Nothing is retried within one run; this only informs the operator.
    ///
    /// # Examples
    ///
    /// ```
    /// use roestbak_provisioner::error::ProvisionError;
    ///
    /// let err = ProvisionError::NetworkFailure {
    ///     url: "https://example.test".to_owned(),
    ///     reason: "connection reset".to_owned(),
    /// };
    /// assert!(err.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure { .. } | Self::Timeout { .. })
    }
}

/// Result type alias using [`ProvisionError`].
pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> Sha256Digest {
        Sha256Digest::try_from(c.to_string().repeat(64)).expect("valid digest")
    }

    #[test]
    fn integrity_mismatch_names_gate_and_both_digests() {
        let err = ProvisionError::IntegrityMismatch {
            gate: IntegrityGate::Download,
            expected: digest('a'),
            actual: "b".repeat(64),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("download checksum mismatch"));
        assert!(msg.contains(&"a".repeat(64)));
        assert!(msg.contains(&"b".repeat(64)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn build_failure_surfaces_output_verbatim() {
        let err = ProvisionError::BuildFailure {
            module: "hid-xpadneo".to_owned(),
            version: "abc123".to_owned(),
            message: "make: *** [Makefile:12: all] Error 2".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("hid-xpadneo/abc123"));
        assert!(msg.contains("make: *** [Makefile:12: all] Error 2"));
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = ProvisionError::Timeout {
            operation: "dkms install".to_owned(),
            seconds: 30,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30 seconds"));
    }

    #[test]
    fn write_failed_preserves_source() {
        let err = ProvisionError::WriteFailed {
            source: std::io::Error::other("broken pipe"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
