//! Error types for pinned release values.
//!
//! Each variant names the rejected input and the constraint it broke.

use thiserror::Error;

/// Errors arising from invalid pinned-release values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// A SHA-256 digest is not a valid 64-character lowercase hex string.
    #[error("invalid SHA-256 digest: {reason}")]
    InvalidSha256Digest {
        /// Description of the validation failure.
        reason: String,
    },

    /// A module version cannot be used as a DKMS version and path component.
    #[error("invalid module version \"{value}\": {reason}")]
    InvalidModuleVersion {
        /// The rejected version string.
        value: String,
        /// Description of the validation failure.
        reason: String,
    },

    /// A module name cannot be used as a DKMS module name.
    #[error("invalid module name \"{value}\": {reason}")]
    InvalidModuleName {
        /// The rejected name.
        value: String,
        /// Description of the validation failure.
        reason: String,
    },

    /// The source URL is not an http(s) URL.
    #[error("invalid source URL \"{value}\": expected an http:// or https:// URL")]
    InvalidSourceUrl {
        /// The rejected URL.
        value: String,
    },

    /// The archive category wrapper is empty or contains a separator.
    #[error("invalid archive category \"{value}\": must be a single path segment")]
    InvalidCategory {
        /// The rejected category.
        value: String,
    },
}

/// Result type alias using [`ReleaseError`].
pub type Result<T> = std::result::Result<T, ReleaseError>;
