//! `provision.toml`: the declarative description of a converged host.
//!
//! The file is parsed into raw serde structs and then validated into the
//! domain types the workflow consumes. Every section except `[release]` is
//! optional; omitted keys take the defaults documented on each raw struct.

use crate::descriptor::DescriptorSpec;
use crate::dirs::BaseDirs;
use crate::error::ProvisionError;
use crate::fleet::DeployPlan;
use crate::packages::PackageSet;
use crate::release::module_id::{ModuleName, ModuleVersion};
use crate::release::pinned::{ArchiveLayout, PinnedRelease, ReleasePins};
use crate::release::sha256_digest::Sha256Digest;
use crate::service::{RestartPolicy, ServiceSpec, UnitDescription};
use crate::sync::SyncPlan;
use crate::toolchain::{DEFAULT_INSTALLER_URL, RustToolchain};
use crate::udev::DEFAULT_RULES_PATH;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "provision.toml";

/// Module installed when `release.module` is omitted.
pub const DEFAULT_MODULE: &str = "hid-xpadneo";

/// Staging directory used when the platform has no cache directory.
pub const FALLBACK_STAGING_DIR: &str = "/var/cache/roestbak-provision";

/// Errors arising from loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The configuration path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// The configuration path.
        path: Utf8PathBuf,
        /// The parser's message, naming line and key.
        message: String,
    },

    /// A value parsed but is not acceptable.
    #[error("{path}: invalid `{key}`: {reason}")]
    Invalid {
        /// The configuration path.
        path: Utf8PathBuf,
        /// Dotted key of the offending value.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<ConfigError> for ProvisionError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Read { path, source } => Self::Config {
                path,
                reason: source.to_string(),
            },
            ConfigError::Parse { path, message } => Self::Config {
                path,
                reason: message,
            },
            ConfigError::Invalid { path, key, reason } => Self::Config {
                path,
                reason: format!("`{key}`: {reason}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    release: RawRelease,
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    packages: RawPackages,
    #[serde(default)]
    toolchain: RawToolchain,
    #[serde(default)]
    udev: RawUdev,
    #[serde(default)]
    service: RawService,
    #[serde(default)]
    sync: RawSync,
    #[serde(default)]
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRelease {
    module: Option<ModuleName>,
    version: ModuleVersion,
    source_url: String,
    download_sha256: Sha256Digest,
    tree_sha256: Sha256Digest,
    /// Wrapper directory inside the archive; defaults to the module name.
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    source_root: Option<Utf8PathBuf>,
    staging_dir: Option<Utf8PathBuf>,
    descriptor_template: Option<String>,
    descriptor: Option<String>,
    version_field: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawTimeouts {
    fetch_secs: u64,
    build_secs: u64,
    command_secs: u64,
    deploy_secs: Option<u64>,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            fetch_secs: 120,
            build_secs: 1800,
            command_secs: 600,
            deploy_secs: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawPackages {
    present: Vec<String>,
    absent: Vec<String>,
}

impl Default for RawPackages {
    fn default() -> Self {
        Self {
            present: ["dkms", "build-essential", "rsync"].map(str::to_owned).to_vec(),
            absent: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawToolchain {
    channel: String,
    components: Vec<String>,
    cargo_home: Option<Utf8PathBuf>,
    installer_url: String,
}

impl Default for RawToolchain {
    fn default() -> Self {
        Self {
            channel: "stable".to_owned(),
            components: Vec::new(),
            cargo_home: None,
            installer_url: DEFAULT_INSTALLER_URL.to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawUdev {
    rules_path: Utf8PathBuf,
}

impl Default for RawUdev {
    fn default() -> Self {
        Self {
            rules_path: DEFAULT_RULES_PATH.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawService {
    name: String,
    source_dir: Utf8PathBuf,
    binary: Option<String>,
    install_path: Option<Utf8PathBuf>,
    unit_dir: Utf8PathBuf,
    enabled: bool,
    description: String,
    after: Vec<String>,
    user: Option<String>,
    restart: RestartPolicy,
    restart_sec: u64,
}

impl Default for RawService {
    fn default() -> Self {
        Self {
            name: "roestbak".to_owned(),
            source_dir: "/opt/roestbak-provision/roestbak".into(),
            binary: None,
            install_path: None,
            unit_dir: "/etc/systemd/system".into(),
            enabled: true,
            description: "roestbak gamepad-driven robot controller".to_owned(),
            after: vec!["bluetooth.target".to_owned()],
            user: None,
            restart: RestartPolicy::Always,
            restart_sec: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawSync {
    paths: Vec<Utf8PathBuf>,
    remote_dir: String,
    remote_command: Option<Vec<String>>,
}

impl Default for RawSync {
    fn default() -> Self {
        Self {
            paths: vec![DEFAULT_CONFIG_FILE.into(), "roestbak".into()],
            remote_dir: "/opt/roestbak-provision".to_owned(),
            remote_command: None,
        }
    }
}

/// Command timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Archive and installer script downloads.
    pub fetch: Duration,
    /// `dkms install`, `cargo build` and toolchain installs.
    pub build: Duration,
    /// Every other external command.
    pub command: Duration,
    /// A whole remote `apply` run started by `deploy`.
    pub deploy: Duration,
}

/// A validated `provision.toml`.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Where the configuration was loaded from.
    pub path: Utf8PathBuf,
    /// The pinned module source.
    pub release: PinnedRelease,
    /// Shape of the release archive.
    pub layout: ArchiveLayout,
    /// Build descriptor stamping rules.
    pub descriptor: DescriptorSpec,
    /// Parent directory of installed module trees.
    pub source_root: Utf8PathBuf,
    /// Download staging directory; also holds the host lock.
    pub staging_dir: Utf8PathBuf,
    /// Command timeouts.
    pub timeouts: Timeouts,
    /// Desired OS packages.
    pub packages: PackageSet,
    /// The pinned Rust toolchain.
    pub toolchain: RustToolchain,
    /// Install path of the udev rule.
    pub udev_rules_path: Utf8PathBuf,
    /// The service to build and run.
    pub service: ServiceSpec,
    /// How remote hosts are provisioned.
    pub deploy: DeployPlan,
    /// Hosts `deploy` targets by default.
    pub hosts: Vec<String>,
}

impl ProvisionConfig {
    /// Read and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, malformed, or holds
    /// an invalid value.
    pub fn load(path: &Utf8Path, dirs: &dyn BaseDirs) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&contents, path, dirs)
    }

    /// Validate configuration text; `path` is used for messages only.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is malformed or holds an invalid
    /// value.
    pub fn from_toml(contents: &str, path: &Utf8Path, dirs: &dyn BaseDirs) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        Validator { path, dirs }.validate(raw)
    }
}

struct Validator<'a> {
    path: &'a Utf8Path,
    dirs: &'a dyn BaseDirs,
}

impl Validator<'_> {
    fn invalid(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            path: self.path.to_owned(),
            key: key.to_owned(),
            reason: reason.into(),
        }
    }

    fn validate(&self, raw: RawConfig) -> Result<ProvisionConfig, ConfigError> {
        let module = match raw.release.module {
            Some(module) => module,
            None => ModuleName::try_from(DEFAULT_MODULE)
                .map_err(|e| self.invalid("release.module", e.to_string()))?,
        };
        let category = raw
            .release
            .category
            .clone()
            .unwrap_or_else(|| module.to_string());
        let layout = ArchiveLayout::github_snapshot(&category)
            .map_err(|e| self.invalid("release.category", e.to_string()))?;
        let release = PinnedRelease::new(ReleasePins {
            module,
            version: raw.release.version,
            source_url: raw.release.source_url,
            download_checksum: raw.release.download_sha256,
            tree_checksum: raw.release.tree_sha256,
        })
        .map_err(|e| self.invalid("release.source_url", e.to_string()))?;

        let timeouts = self.timeouts(&raw.timeouts)?;
        let descriptor = self.descriptor(&raw.paths)?;
        let staging_dir = match raw.paths.staging_dir {
            Some(dir) => dir,
            None => self.default_staging_dir(),
        };
        let cargo_home = match raw.toolchain.cargo_home {
            Some(home) => home,
            None => self.default_cargo_home(),
        };
        if raw.toolchain.channel.trim().is_empty() {
            return Err(self.invalid("toolchain.channel", "must not be empty"));
        }
        let service = self.service(raw.service)?;
        let deploy = self.deploy(raw.sync, timeouts)?;
        if let Some(host) = raw.hosts.iter().find(|host| !is_host_name(host)) {
            return Err(self.invalid("hosts", format!("\"{host}\" is not a host name")));
        }

        Ok(ProvisionConfig {
            path: self.path.to_owned(),
            release,
            layout,
            descriptor,
            source_root: raw.paths.source_root.unwrap_or_else(|| "/usr/src".into()),
            staging_dir,
            timeouts,
            packages: PackageSet {
                present: raw.packages.present,
                absent: raw.packages.absent,
            },
            toolchain: RustToolchain::new(
                &raw.toolchain.channel,
                raw.toolchain.components,
                cargo_home,
                &raw.toolchain.installer_url,
            ),
            udev_rules_path: raw.udev.rules_path,
            service,
            deploy,
            hosts: raw.hosts,
        })
    }

    fn timeouts(&self, raw: &RawTimeouts) -> Result<Timeouts, ConfigError> {
        for (key, value) in [
            ("timeouts.fetch_secs", raw.fetch_secs),
            ("timeouts.build_secs", raw.build_secs),
            ("timeouts.command_secs", raw.command_secs),
        ] {
            if value == 0 {
                return Err(self.invalid(key, "must be at least 1 second"));
            }
        }
        let deploy_secs = match raw.deploy_secs {
            Some(secs) if secs < raw.build_secs => {
                return Err(self.invalid(
                    "timeouts.deploy_secs",
                    "must be at least timeouts.build_secs, a remote apply includes builds",
                ));
            }
            Some(secs) => secs,
            None => default_deploy_secs(raw),
        };
        Ok(Timeouts {
            fetch: Duration::from_secs(raw.fetch_secs),
            build: Duration::from_secs(raw.build_secs),
            command: Duration::from_secs(raw.command_secs),
            deploy: Duration::from_secs(deploy_secs),
        })
    }

    fn descriptor(&self, raw: &RawPaths) -> Result<DescriptorSpec, ConfigError> {
        let defaults = DescriptorSpec::default();
        let spec = DescriptorSpec {
            template: raw.descriptor_template.clone().unwrap_or(defaults.template),
            descriptor: raw.descriptor.clone().unwrap_or(defaults.descriptor),
            version_field: raw.version_field.clone().unwrap_or(defaults.version_field),
        };
        for (key, name) in [
            ("paths.descriptor_template", &spec.template),
            ("paths.descriptor", &spec.descriptor),
        ] {
            if !is_plain_relative(Utf8Path::new(name)) {
                return Err(self.invalid(key, "must be a relative path inside the source tree"));
            }
        }
        if spec.template == spec.descriptor {
            return Err(self.invalid("paths.descriptor", "must differ from the template"));
        }
        let field_ok = !spec.version_field.is_empty()
            && spec
                .version_field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !field_ok {
            return Err(self.invalid("paths.version_field", "must be a shell variable name"));
        }
        Ok(spec)
    }

    fn service(&self, raw: RawService) -> Result<ServiceSpec, ConfigError> {
        if raw.name.is_empty() || raw.name.contains(['/', ' ']) {
            return Err(self.invalid("service.name", "must be a unit name without spaces or slashes"));
        }
        let binary = raw.binary.unwrap_or_else(|| raw.name.clone());
        if binary.is_empty() || binary.contains('/') {
            return Err(self.invalid("service.binary", "must be a cargo binary target name"));
        }
        let install_path = raw
            .install_path
            .unwrap_or_else(|| Utf8Path::new("/usr/local/bin").join(&binary));
        if !install_path.is_absolute() {
            return Err(self.invalid("service.install_path", "must be absolute"));
        }
        Ok(ServiceSpec {
            unit: UnitDescription {
                description: raw.description,
                after: raw.after,
                exec_start: install_path.clone(),
                user: raw.user,
                restart: raw.restart,
                restart_sec: raw.restart_sec,
            },
            name: raw.name,
            source_dir: raw.source_dir,
            binary,
            install_path,
            unit_dir: raw.unit_dir,
            enabled: raw.enabled,
        })
    }

    fn deploy(&self, raw: RawSync, timeouts: Timeouts) -> Result<DeployPlan, ConfigError> {
        if raw.paths.is_empty() {
            return Err(self.invalid("sync.paths", "must list at least one path"));
        }
        if let Some(path) = raw.paths.iter().find(|path| !is_plain_relative(path)) {
            return Err(self.invalid(
                "sync.paths",
                format!("\"{path}\" must be relative and stay below the working directory"),
            ));
        }
        let remote_dir = raw.remote_dir.trim_end_matches('/').to_owned();
        if !remote_dir.starts_with('/') {
            return Err(self.invalid("sync.remote_dir", "must be an absolute path"));
        }
        let remote_command = raw.remote_command.unwrap_or_else(|| {
            vec![
                "sudo".to_owned(),
                "roestbak-provision".to_owned(),
                "apply".to_owned(),
                "--config".to_owned(),
                format!("{remote_dir}/{DEFAULT_CONFIG_FILE}"),
            ]
        });
        if remote_command.is_empty() {
            return Err(self.invalid("sync.remote_command", "must not be empty"));
        }
        Ok(DeployPlan {
            sync: SyncPlan {
                paths: raw.paths,
                remote_dir,
            },
            remote_command,
            sync_timeout: timeouts.command,
            apply_timeout: timeouts.deploy,
        })
    }

    fn default_staging_dir(&self) -> Utf8PathBuf {
        self.dirs
            .cache_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .unwrap_or_else(|| FALLBACK_STAGING_DIR.into())
    }

    fn default_cargo_home(&self) -> Utf8PathBuf {
        self.dirs
            .home_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .unwrap_or_else(|| "/root".into())
            .join(".cargo")
    }
}

/// Worst case for a remote `apply` on a fresh host: the module archive and
/// rustup installer downloads, four builds (apt, toolchain, DKMS, cargo),
/// and the command budget for the remaining steps.
fn default_deploy_secs(raw: &RawTimeouts) -> u64 {
    raw.fetch_secs
        .saturating_mul(2)
        .saturating_add(raw.build_secs.saturating_mul(4))
        .saturating_add(raw.command_secs)
}

/// Relative, non-empty, and free of `..`.
fn is_plain_relative(path: &Utf8Path) -> bool {
    !path.as_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir))
}

fn is_host_name(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | ':'))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
