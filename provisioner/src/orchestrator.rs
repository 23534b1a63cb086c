//! The install/replace state machine for the pinned module source.
//!
//! A run starts at [`InstallState::Idle`] and walks
//!
//! ```text
//! Verifying ─ match + registered ─────────────────────────────► Done
//!     │      └ match, unregistered ─────────────────────────────► BuildReady
//!     └ mismatch ► Fetching ► Deregistering ► Clearing ► Extracting
//!                  ► Stamping ► ReVerifying ─ match ──► BuildReady
//!                                            └ mismatch ► Fatal
//! ```
//!
//! Nothing past `Verifying` happens unless the tree digest disagrees with
//! the pin, the registration is never removed before the archive has passed
//! the download gate, and the build is never requested for a tree that has
//! not passed the tree gate.

use crate::descriptor::{DescriptorSpec, stamp_descriptor};
use crate::detector::{SourceState, detect};
use crate::dkms::{Deregistration, ModuleRegistry, RegistrationState};
use crate::error::{IntegrityGate, ProvisionError, Result};
use crate::extraction::SourceExtractor;
use crate::fetch::{ArchiveDownloader, discard, fetch};
use crate::release::pinned::{ArchiveLayout, PinnedRelease};
use crate::replace::StagedTree;
use crate::tree_digest::compute_tree_digest;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use std::fmt;

/// States of one install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallState {
    /// Not started.
    Idle,
    /// Comparing the installed tree against its pin.
    Verifying,
    /// The host already holds the pinned, registered module.
    Done,
    /// Downloading the archive through the download gate.
    Fetching,
    /// Removing any registration of the pinned version.
    Deregistering,
    /// Preparing a fresh, empty directory for the new tree.
    Clearing,
    /// Unpacking the verified archive.
    Extracting,
    /// Writing the version into the build descriptor.
    Stamping,
    /// Checking the new tree against the tree gate.
    ReVerifying,
    /// The tree is proven valid and has been handed to the module builder.
    BuildReady,
    /// The new tree failed the tree gate; nothing was built.
    Fatal,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Fetching => "fetching",
            Self::Deregistering => "deregistering",
            Self::Clearing => "clearing",
            Self::Extracting => "extracting",
            Self::Stamping => "stamping",
            Self::ReVerifying => "re-verifying",
            Self::BuildReady => "build-ready",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// What a successful run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallOutcome {
    /// Tree and registration were already correct; nothing was written.
    Current,
    /// The tree was correct but unregistered; only the build ran.
    Registered,
    /// The tree was replaced and built.
    Replaced,
}

impl InstallOutcome {
    /// Whether the run changed the host.
    #[must_use]
    pub fn changed(self) -> bool {
        !matches!(self, Self::Current)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// What the run did.
    pub outcome: InstallOutcome,
    /// Every state entered, starting with [`InstallState::Idle`].
    pub transitions: Vec<InstallState>,
}

/// Where and what to install.
#[derive(Debug, Clone, Copy)]
pub struct InstallPlan<'a> {
    /// The release that defines "correct".
    pub release: &'a PinnedRelease,
    /// Shape of the release archive.
    pub layout: &'a ArchiveLayout,
    /// Descriptor template and version field.
    pub descriptor: &'a DescriptorSpec,
    /// Parent of the installed tree (`/usr/src` for DKMS).
    pub source_root: &'a Utf8Path,
    /// Directory the archive is downloaded to.
    pub staging_dir: &'a Utf8Path,
}

impl InstallPlan<'_> {
    /// The installed tree directory.
    #[must_use]
    pub fn installed_tree(&self) -> Utf8PathBuf {
        self.release.installed_tree(self.source_root)
    }

    fn staged_archive(&self) -> Utf8PathBuf {
        self.staging_dir.join(self.release.staged_archive_name())
    }
}

/// The external systems a run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Fetches the archive.
    pub downloader: &'a dyn ArchiveDownloader,
    /// Unpacks the archive.
    pub extractor: &'a dyn SourceExtractor,
    /// Tracks and builds module registrations.
    pub registry: &'a dyn ModuleRegistry,
}

/// Converge the installed module source to `plan.release`.
///
/// # Errors
///
/// Returns [`ProvisionError::IntegrityMismatch`] when either gate rejects
/// the source, [`ProvisionError::BuildFailure`] when the build is rejected,
/// [`ProvisionError::NetworkFailure`] when the download fails, and other
/// variants for registry and I/O failures. On every error the installed
/// tree is either untouched or absent.
pub fn install_source(
    plan: &InstallPlan<'_>,
    collaborators: &Collaborators<'_>,
) -> Result<InstallReport> {
    let mut run = InstallRun {
        plan,
        collaborators,
        transitions: vec![InstallState::Idle],
    };
    let outcome = run.execute()?;
    Ok(InstallReport {
        outcome,
        transitions: run.transitions,
    })
}

struct InstallRun<'p, 'c> {
    plan: &'p InstallPlan<'p>,
    collaborators: &'c Collaborators<'c>,
    transitions: Vec<InstallState>,
}

impl InstallRun<'_, '_> {
    fn enter(&mut self, state: InstallState) {
        log::info!("{}: {state}", self.plan.release.registration_key());
        self.transitions.push(state);
    }

    fn execute(&mut self) -> Result<InstallOutcome> {
        let release = self.plan.release;
        let tree = self.plan.installed_tree();

        self.enter(InstallState::Verifying);
        match detect(&tree, release.tree_checksum()) {
            SourceState::Match => return self.converge_registration(),
            mismatch @ SourceState::Mismatch { .. } => {
                log::info!("{tree}: {mismatch}, expected {}", release.tree_checksum());
            }
        }

        self.enter(InstallState::Fetching);
        let archive = fetch(
            self.collaborators.downloader,
            release.source_url(),
            &self.plan.staged_archive(),
            release.download_checksum(),
        )?;

        self.enter(InstallState::Deregistering);
        match self
            .collaborators
            .registry
            .remove(release.module(), release.version())?
        {
            Deregistration::Removed => log::info!("removed {}", release.registration_key()),
            Deregistration::NotFound => {
                log::warn!("{} was not registered", release.registration_key());
            }
        }

        self.enter(InstallState::Clearing);
        let staged = StagedTree::prepare(&tree)?;

        self.enter(InstallState::Extracting);
        let extracted = self.collaborators.extractor.extract(
            archive.path.as_std_path(),
            staged.path().as_std_path(),
            self.plan.layout,
        );
        discard(&archive.path);
        let files = extracted?;
        log::debug!("extracted {} files into {}", files.len(), staged.path());

        self.enter(InstallState::Stamping);
        stamp_descriptor(staged.path(), self.plan.descriptor, release.version())?;

        self.enter(InstallState::ReVerifying);
        let actual = match compute_tree_digest(staged.path()) {
            Ok(digest) if &digest == release.tree_checksum() => None,
            Ok(digest) => Some(digest.into_inner()),
            Err(error) => Some(error.to_string()),
        };
        if let Some(actual) = actual {
            self.enter(InstallState::Fatal);
            return Err(ProvisionError::IntegrityMismatch {
                gate: IntegrityGate::Tree,
                expected: release.tree_checksum().clone(),
                actual,
            });
        }
        staged.commit()?;

        self.build()?;
        Ok(InstallOutcome::Replaced)
    }

    fn converge_registration(&mut self) -> Result<InstallOutcome> {
        let release = self.plan.release;
        match self
            .collaborators
            .registry
            .status(release.module(), release.version())?
        {
            RegistrationState::Registered => {
                self.enter(InstallState::Done);
                Ok(InstallOutcome::Current)
            }
            RegistrationState::Absent => {
                log::info!(
                    "source tree is current but {} is not installed",
                    release.registration_key()
                );
                self.build()?;
                Ok(InstallOutcome::Registered)
            }
        }
    }

    fn build(&mut self) -> Result<()> {
        self.enter(InstallState::BuildReady);
        let release = self.plan.release;
        self.collaborators
            .registry
            .install(release.module(), release.version())
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
