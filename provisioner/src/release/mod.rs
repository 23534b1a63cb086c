//! Pinned release model: the values that define a correct install.
//!
//! # Sub-modules
//!
//! - [`error`] - Validation errors for release values.
//! - [`module_id`] - `ModuleName` and `ModuleVersion` newtypes.
//! - [`pinned`] - `PinnedRelease` and the archive layout it ships in.
//! - [`sha256_digest`] - SHA-256 digest newtype (`Sha256Digest`).

pub mod error;
pub mod module_id;
pub mod pinned;
pub mod sha256_digest;
