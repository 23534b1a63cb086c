//! Platform directory lookup.
//!
//! Wraps `directories-next` behind a trait so configuration defaults can
//! be tested without depending on the invoking user's home.

use std::path::PathBuf;

/// Application name used for per-user directories.
pub const APPLICATION: &str = "roestbak-provision";

/// Provides the base directories configuration defaults derive from.
#[cfg_attr(test, mockall::automock)]
pub trait BaseDirs {
    /// The invoking user's home directory.
    fn home_dir(&self) -> Option<PathBuf>;

    /// The provisioner's cache directory (`~/.cache/roestbak-provision`).
    fn cache_dir(&self) -> Option<PathBuf>;
}

/// [`BaseDirs`] backed by the platform conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBaseDirs;

impl BaseDirs for SystemBaseDirs {
    fn home_dir(&self) -> Option<PathBuf> {
        directories_next::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        directories_next::ProjectDirs::from("", "", APPLICATION)
            .map(|dirs| dirs.cache_dir().to_path_buf())
    }
}
