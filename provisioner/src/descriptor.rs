//! Build descriptor stamping.
//!
//! The module source ships a descriptor template (`dkms.conf.in`) whose
//! version field is a placeholder. Stamping copies it to the real
//! descriptor and rewrites only the version line, leaving every other field
//! the template carries untouched.

use crate::error::{ProvisionError, Result};
use crate::release::module_id::ModuleVersion;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Where the descriptor template lives and which field carries the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSpec {
    /// Template file name, relative to the tree root.
    pub template: String,
    /// Stamped descriptor file name, relative to the tree root.
    pub descriptor: String,
    /// Name of the version field (`PACKAGE_VERSION` for DKMS).
    pub version_field: String,
}

impl Default for DescriptorSpec {
    fn default() -> Self {
        Self {
            template: "dkms.conf.in".to_owned(),
            descriptor: "dkms.conf".to_owned(),
            version_field: "PACKAGE_VERSION".to_owned(),
        }
    }
}

/// Write `<tree>/<descriptor>` from `<tree>/<template>` with the version
/// field set to `version`. Returns the descriptor path.
///
/// # Errors
///
/// Returns [`ProvisionError::Descriptor`] if the template is unreadable or
/// lacks the version field, and [`ProvisionError::Io`] if writing fails.
pub fn stamp_descriptor(
    tree: &Utf8Path,
    spec: &DescriptorSpec,
    version: &ModuleVersion,
) -> Result<Utf8PathBuf> {
    let template_path = tree.join(&spec.template);
    let template = fs::read_to_string(&template_path).map_err(|e| ProvisionError::Descriptor {
        path: template_path.clone(),
        reason: e.to_string(),
    })?;

    let stamped = rewrite_field(&template, &spec.version_field, version.as_str()).ok_or_else(
        || ProvisionError::Descriptor {
            path: template_path.clone(),
            reason: format!("no line starts with {}=", spec.version_field),
        },
    )?;

    let descriptor_path = tree.join(&spec.descriptor);
    fs::write(&descriptor_path, stamped)?;
    log::debug!("stamped {descriptor_path} with {}={version}", spec.version_field);
    Ok(descriptor_path)
}

/// Replace every line starting with `<field>=` by `<field>="<value>"`.
///
/// Line terminators are preserved byte for byte. Returns `None` when no
/// line carries the field.
///
/// # Examples
///
/// ```
/// use roestbak_provisioner::descriptor::rewrite_field;
///
/// let template = "PACKAGE_NAME=\"hid-xpadneo\"\nPACKAGE_VERSION=\"@DO_NOT_CHANGE@\"\n";
/// let stamped = rewrite_field(template, "PACKAGE_VERSION", "abc123").unwrap();
/// assert_eq!(stamped, "PACKAGE_NAME=\"hid-xpadneo\"\nPACKAGE_VERSION=\"abc123\"\n");
/// ```
#[must_use]
pub fn rewrite_field(contents: &str, field: &str, value: &str) -> Option<String> {
    let prefix = format!("{field}=");
    let mut found = false;
    let mut output = String::with_capacity(contents.len());

    for line in contents.split_inclusive('\n') {
        if line.starts_with(&prefix) {
            found = true;
            output.push_str(&prefix);
            output.push('"');
            output.push_str(value);
            output.push('"');
            output.push_str(line_terminator(line));
        } else {
            output.push_str(line);
        }
    }

    found.then_some(output)
}

fn line_terminator(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TEMPLATE: &str = concat!(
        "PACKAGE_NAME=\"hid-xpadneo\"\n",
        "PACKAGE_VERSION=\"@DO_NOT_CHANGE@\"\n",
        "BUILT_MODULE_NAME[0]=\"hid-xpadneo\"\n",
        "# PACKAGE_VERSION= in a comment is left alone\n",
        "AUTOINSTALL=\"yes\"\n",
    );

    #[test]
    fn rewrites_only_the_anchored_line() {
        let stamped = rewrite_field(TEMPLATE, "PACKAGE_VERSION", "abc123").expect("field");
        assert_eq!(
            stamped,
            TEMPLATE.replace("\"@DO_NOT_CHANGE@\"", "\"abc123\"")
        );
    }

    #[rstest]
    #[case::no_trailing_newline("PACKAGE_VERSION=old", "PACKAGE_VERSION=\"v1\"")]
    #[case::crlf("PACKAGE_VERSION=old\r\nX=1\r\n", "PACKAGE_VERSION=\"v1\"\r\nX=1\r\n")]
    fn preserves_line_terminators(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(rewrite_field(input, "PACKAGE_VERSION", "v1").as_deref(), Some(expected));
    }

    #[test]
    fn missing_field_is_none() {
        assert!(rewrite_field("PACKAGE_NAME=x\n", "PACKAGE_VERSION", "v1").is_none());
    }

    #[test]
    fn stamp_writes_descriptor_beside_template() {
        let temp = tempfile::tempdir().expect("temp dir");
        let tree = Utf8Path::from_path(temp.path()).expect("UTF-8 path");
        fs::write(tree.join("dkms.conf.in"), TEMPLATE).expect("write template");
        let version = ModuleVersion::try_from("abc123").expect("version");

        let path = stamp_descriptor(tree, &DescriptorSpec::default(), &version).expect("stamp");

        assert_eq!(path, tree.join("dkms.conf"));
        let stamped = fs::read_to_string(path).expect("read");
        assert!(stamped.contains("PACKAGE_VERSION=\"abc123\"\n"));
        assert_eq!(
            fs::read_to_string(tree.join("dkms.conf.in")).expect("read"),
            TEMPLATE,
            "template must stay intact"
        );
    }

    #[test]
    fn stamp_without_template_is_descriptor_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let tree = Utf8Path::from_path(temp.path()).expect("UTF-8 path");
        let version = ModuleVersion::try_from("abc123").expect("version");

        let result = stamp_descriptor(tree, &DescriptorSpec::default(), &version);
        assert!(matches!(result, Err(ProvisionError::Descriptor { .. })));
    }
}
