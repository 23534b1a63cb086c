//! Module name and version newtypes.
//!
//! Both values end up as DKMS identifiers and as path components under the
//! source root (`/usr/src/<name>-<version>`), so both share one conservative
//! character policy: ASCII alphanumerics plus `.`, `_`, `+` and `-`, not
//! starting with `.` or `-`.

use super::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identifier accepted for either a name or a version.
const MAX_LEN: usize = 64;

/// A validated pinned module version (a release tag or commit SHA).
///
/// # Examples
///
/// ```
/// use roestbak_provisioner::release::module_id::ModuleVersion;
///
/// let version: ModuleVersion = "abc123".try_into().unwrap();
/// assert_eq!(version.as_str(), "abc123");
/// assert!(ModuleVersion::try_from("../etc").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleVersion(String);

/// A validated kernel module name as registered with DKMS.
///
/// # Examples
///
/// ```
/// use roestbak_provisioner::release::module_id::ModuleName;
///
/// let name: ModuleName = "hid-xpadneo".try_into().unwrap();
/// assert_eq!(name.to_string(), "hid-xpadneo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(String);

macro_rules! identifier_newtype {
    ($ty:ident, $variant:ident) => {
        impl $ty {
            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the wrapper and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = ReleaseError;

            fn try_from(value: &str) -> Result<Self> {
                Self::try_from(value.to_owned())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = ReleaseError;

            fn try_from(value: String) -> Result<Self> {
                match identifier_problem(&value) {
                    Some(reason) => Err(ReleaseError::$variant { value, reason }),
                    None => Ok(Self(value)),
                }
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier_newtype!(ModuleVersion, InvalidModuleVersion);
identifier_newtype!(ModuleName, InvalidModuleName);

/// Describe why `value` is not an acceptable identifier, if it is not.
fn identifier_problem(value: &str) -> Option<String> {
    if value.is_empty() {
        return Some("must not be empty".to_owned());
    }
    if value.len() > MAX_LEN {
        return Some(format!("must be at most {MAX_LEN} characters"));
    }
    if value.starts_with(['.', '-']) {
        return Some("must not start with '.' or '-'".to_owned());
    }
    value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-')))
        .map(|bad| format!("unsupported character '{bad}'"))
}
