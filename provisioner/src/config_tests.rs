//! Tests for configuration loading and validation.

use super::*;
use crate::dirs::MockBaseDirs;
use rstest::{fixture, rstest};
use std::path::PathBuf;

const MINIMAL: &str = r#"
[release]
version = "a4e6f8d"
source_url = "https://github.com/atar-axis/xpadneo/archive/a4e6f8d.tar.gz"
download_sha256 = "1111111111111111111111111111111111111111111111111111111111111111"
tree_sha256 = "2222222222222222222222222222222222222222222222222222222222222222"
"#;

#[fixture]
fn dirs() -> MockBaseDirs {
    let mut dirs = MockBaseDirs::new();
    dirs.expect_home_dir()
        .returning(|| Some(PathBuf::from("/home/pi")));
    dirs.expect_cache_dir()
        .returning(|| Some(PathBuf::from("/home/pi/.cache/roestbak-provision")));
    dirs
}

fn parse(contents: &str, dirs: &MockBaseDirs) -> Result<ProvisionConfig, ConfigError> {
    ProvisionConfig::from_toml(contents, Utf8Path::new("provision.toml"), dirs)
}

fn with_section(section: &str) -> String {
    format!("{MINIMAL}\n{section}")
}

fn invalid_key(result: Result<ProvisionConfig, ConfigError>) -> String {
    match result {
        Err(ConfigError::Invalid { key, .. }) => key,
        other => panic!("expected an invalid value, got {other:?}"),
    }
}

#[rstest]
fn minimal_config_takes_documented_defaults(dirs: MockBaseDirs) {
    let config = parse(MINIMAL, &dirs).expect("parse");

    assert_eq!(config.release.module().as_str(), "hid-xpadneo");
    assert_eq!(config.release.version().as_str(), "a4e6f8d");
    assert_eq!(config.layout.category(), "hid-xpadneo");
    assert_eq!(config.source_root, Utf8PathBuf::from("/usr/src"));
    assert_eq!(
        config.staging_dir,
        Utf8PathBuf::from("/home/pi/.cache/roestbak-provision")
    );
    assert_eq!(config.descriptor, DescriptorSpec::default());
    assert_eq!(config.timeouts.build, Duration::from_secs(1800));
    assert_eq!(config.packages.present, ["dkms", "build-essential", "rsync"]);
    assert_eq!(config.toolchain.channel(), "stable");
    assert_eq!(
        config.toolchain.cargo(),
        Utf8PathBuf::from("/home/pi/.cargo/bin/cargo")
    );
    assert_eq!(config.udev_rules_path, Utf8PathBuf::from(DEFAULT_RULES_PATH));
    assert_eq!(config.service.unit_name(), "roestbak.service");
    assert_eq!(
        config.service.install_path,
        Utf8PathBuf::from("/usr/local/bin/roestbak")
    );
    assert_eq!(config.service.unit.exec_start, config.service.install_path);
    assert!(config.hosts.is_empty());
}

#[rstest]
fn default_remote_command_applies_the_mirrored_config(dirs: MockBaseDirs) {
    let config = parse(&with_section("[sync]\nremote_dir = \"/srv/provision/\"\n"), &dirs)
        .expect("parse");

    assert_eq!(config.deploy.sync.remote_dir, "/srv/provision");
    assert_eq!(
        config.deploy.remote_command,
        [
            "sudo",
            "roestbak-provision",
            "apply",
            "--config",
            "/srv/provision/provision.toml"
        ]
    );
}

#[rstest]
fn missing_directories_fall_back_to_system_paths() {
    let mut dirs = MockBaseDirs::new();
    dirs.expect_home_dir().returning(|| None);
    dirs.expect_cache_dir().returning(|| None);

    let config = parse(MINIMAL, &dirs).expect("parse");

    assert_eq!(config.staging_dir, Utf8PathBuf::from(FALLBACK_STAGING_DIR));
    assert_eq!(
        config.toolchain.cargo(),
        Utf8PathBuf::from("/root/.cargo/bin/cargo")
    );
}

#[rstest]
fn explicit_sections_override_defaults(dirs: MockBaseDirs) {
    let config = parse(
        &with_section(
            r#"
[paths]
staging_dir = "/var/tmp/provision"
descriptor_template = "dkms.conf.template"

[service]
name = "controller"
binary = "roestbak-ctl"
user = "pi"
restart = "on-failure"
enabled = false
"#,
        )
        .replace("[release]", "hosts = [\"robot-1\", \"pi@robot-2\"]\n[release]"),
        &dirs,
    )
    .expect("parse");

    assert_eq!(config.staging_dir, Utf8PathBuf::from("/var/tmp/provision"));
    assert_eq!(config.descriptor.template, "dkms.conf.template");
    assert_eq!(config.service.binary, "roestbak-ctl");
    assert_eq!(
        config.service.install_path,
        Utf8PathBuf::from("/usr/local/bin/roestbak-ctl")
    );
    assert_eq!(config.service.unit.restart, RestartPolicy::OnFailure);
    assert!(!config.service.enabled);
    assert_eq!(config.hosts, ["robot-1", "pi@robot-2"]);
}

#[rstest]
fn missing_release_section_is_a_parse_error(dirs: MockBaseDirs) {
    let result = parse("[paths]\nsource_root = \"/usr/src\"\n", &dirs);
    assert!(matches!(result, Err(ConfigError::Parse { message, .. }) if message.contains("release")));
}

#[rstest]
fn unknown_keys_are_rejected(dirs: MockBaseDirs) {
    let result = parse(&with_section("[udev]\nrule_path = \"/tmp/x\"\n"), &dirs);
    assert!(matches!(result, Err(ConfigError::Parse { message, .. }) if message.contains("rule_path")));
}

#[rstest]
fn malformed_digest_names_the_key(dirs: MockBaseDirs) {
    let contents = MINIMAL.replace(&"2".repeat(64), "not-a-digest");
    let result = parse(&contents, &dirs);
    assert!(matches!(
        result,
        Err(ConfigError::Parse { message, .. }) if message.contains("tree_sha256")
    ));
}

#[rstest]
#[case::ftp_url(
    &MINIMAL.replace("https://github.com", "ftp://github.com"),
    "release.source_url"
)]
#[case::nested_category(&with_section("").replace("[release]", "[release]\ncategory = \"a/b\""), "release.category")]
#[case::zero_timeout(&with_section("[timeouts]\nbuild_secs = 0\n"), "timeouts.build_secs")]
#[case::short_deploy(&with_section("[timeouts]\ndeploy_secs = 600\n"), "timeouts.deploy_secs")]
#[case::escaping_descriptor(&with_section("[paths]\ndescriptor = \"../dkms.conf\"\n"), "paths.descriptor")]
#[case::same_template(&with_section("[paths]\ndescriptor = \"dkms.conf.in\"\n"), "paths.descriptor")]
#[case::bad_field(&with_section("[paths]\nversion_field = \"PACKAGE VERSION\"\n"), "paths.version_field")]
#[case::empty_channel(&with_section("[toolchain]\nchannel = \" \"\n"), "toolchain.channel")]
#[case::bad_unit_name(&with_section("[service]\nname = \"a/b\"\n"), "service.name")]
#[case::relative_install(&with_section("[service]\ninstall_path = \"bin/roestbak\"\n"), "service.install_path")]
#[case::escaping_sync(&with_section("[sync]\npaths = [\"../secrets\"]\n"), "sync.paths")]
#[case::relative_remote(&with_section("[sync]\nremote_dir = \"opt\"\n"), "sync.remote_dir")]
#[case::empty_remote_command(&with_section("[sync]\nremote_command = []\n"), "sync.remote_command")]
#[case::option_host(&with_section("").replace("[release]", "hosts = [\"-oProxyCommand=x\"]\n[release]"), "hosts")]
fn invalid_values_name_their_key(dirs: MockBaseDirs, #[case] contents: &str, #[case] key: &str) {
    assert_eq!(invalid_key(parse(contents, &dirs)), key);
}

#[rstest]
fn remote_apply_outlasts_every_build(dirs: MockBaseDirs) {
    let config = parse(MINIMAL, &dirs).expect("parse");

    assert_eq!(config.deploy.sync_timeout, config.timeouts.command);
    assert!(config.deploy.apply_timeout >= config.timeouts.build);
    assert_eq!(config.deploy.apply_timeout, Duration::from_secs(2 * 120 + 4 * 1800 + 600));
}

#[rstest]
fn explicit_deploy_timeout_is_used(dirs: MockBaseDirs) {
    let config = parse(&with_section("[timeouts]\ndeploy_secs = 5400\n"), &dirs).expect("parse");

    assert_eq!(config.deploy.apply_timeout, Duration::from_secs(5400));
}

#[rstest]
fn load_reports_unreadable_files(dirs: MockBaseDirs) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("absent.toml")).expect("utf8");

    let result = ProvisionConfig::load(&path, &dirs);

    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[rstest]
fn load_reads_the_file(dirs: MockBaseDirs) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("provision.toml")).expect("utf8");
    fs::write(&path, MINIMAL).expect("write config");

    let config = ProvisionConfig::load(&path, &dirs).expect("load");

    assert_eq!(config.path, path);
}

#[test]
fn invalid_values_convert_to_config_errors() {
    let error = ProvisionError::from(ConfigError::Invalid {
        path: "provision.toml".into(),
        key: "sync.paths".to_owned(),
        reason: "must list at least one path".to_owned(),
    });
    assert_eq!(
        error.to_string(),
        "invalid configuration provision.toml: `sync.paths`: must list at least one path"
    );
}
