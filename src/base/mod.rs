//! Base images and the guest configuration they imply.
//!
//! A [`Base`] names an operating-system family and revision together with
//! everything kiln writes into a fresh instance of it: hostname, proxies,
//! command environment and prerequisite packages.

mod os_release;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use os_release::OsRelease;

/// Guest file holding the [`CompatibilityRecord`].
pub const COMPATIBILITY_FILE: &str = "/etc/kiln-image.conf";

/// Compatibility tag written by this release of kiln.
pub const DEFAULT_COMPATIBILITY_TAG: &str = "kiln-base-v1";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Errors raised while describing a base.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BaseError {
    /// Raised when a base descriptor is not `family:revision`.
    #[error("invalid base '{0}', expected <family>:<revision> such as ubuntu:22.04")]
    Descriptor(String),
    /// Raised when the guest reports a different operating system.
    #[error("expected {expected}, instance reports {found}")]
    Mismatch {
        /// Description of the configured base.
        expected: String,
        /// Description of what the guest reported.
        found: String,
    },
    /// Raised when packages are requested for a family kiln cannot install
    /// into.
    #[error("no package manager known for base family '{0}'")]
    NoPackageManager(String),
}

/// Package manager driving prerequisite installation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageManager {
    /// Debian and Ubuntu.
    Apt,
    /// Fedora, CentOS, AlmaLinux and Rocky Linux.
    Dnf,
}

impl PackageManager {
    fn for_family(family: &str) -> Option<Self> {
        match family {
            "ubuntu" | "debian" => Some(Self::Apt),
            "fedora" | "centos" | "almalinux" | "rocky" => Some(Self::Dnf),
            _ => None,
        }
    }
}

/// Operating-system image plus configuration recipe for new instances.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Base {
    /// Distribution identifier as it appears in `os-release` `ID`.
    pub family: String,
    /// Release identifier as it appears in `os-release` `VERSION_ID`.
    pub revision: String,
    /// Tag recorded in [`COMPATIBILITY_FILE`] once configured.
    #[serde(default = "default_tag")]
    pub compatibility_tag: String,
    /// Hostname written into the guest.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Packages installed during configuration.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Proxy for plain HTTP traffic.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Proxy for HTTPS traffic.
    #[serde(default)]
    pub https_proxy: Option<String>,
}

fn default_tag() -> String {
    DEFAULT_COMPATIBILITY_TAG.to_owned()
}

fn default_hostname() -> String {
    "kiln-instance".to_owned()
}

impl Base {
    /// Creates a base for `family` and `revision` with default settings.
    #[must_use]
    pub fn new(family: impl Into<String>, revision: impl Into<String>) -> Self {
        let family_id = family.into().trim().to_ascii_lowercase();
        let packages = match PackageManager::for_family(&family_id) {
            Some(PackageManager::Apt) => vec!["apt-utils".to_owned(), "ca-certificates".to_owned()],
            Some(PackageManager::Dnf) => vec!["ca-certificates".to_owned()],
            None => Vec::new(),
        };
        Self {
            family: family_id,
            revision: revision.into().trim().to_owned(),
            compatibility_tag: default_tag(),
            hostname: default_hostname(),
            packages,
            http_proxy: None,
            https_proxy: None,
        }
    }

    /// Shorthand for an Ubuntu base.
    #[must_use]
    pub fn ubuntu(revision: impl Into<String>) -> Self {
        Self::new("ubuntu", revision)
    }

    /// Sets the hostname written into the guest.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Replaces the prerequisite package list.
    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Sets both proxies.
    #[must_use]
    pub fn with_proxies(mut self, http: Option<String>, https: Option<String>) -> Self {
        self.http_proxy = http;
        self.https_proxy = https;
        self
    }

    /// Sets the compatibility tag.
    #[must_use]
    pub fn with_compatibility_tag(mut self, tag: impl Into<String>) -> Self {
        self.compatibility_tag = tag.into();
        self
    }

    /// Package manager used to install prerequisites, if the family has one
    /// kiln knows.
    #[must_use]
    pub fn package_manager(&self) -> Option<PackageManager> {
        PackageManager::for_family(&self.family)
    }

    /// Environment applied to every command run in the guest.
    #[must_use]
    pub fn command_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([("PATH".to_owned(), DEFAULT_PATH.to_owned())]);
        if let Some(proxy) = &self.http_proxy {
            env.insert("http_proxy".to_owned(), proxy.clone());
        }
        if let Some(proxy) = &self.https_proxy {
            env.insert("https_proxy".to_owned(), proxy.clone());
        }
        env
    }

    /// Checks that `release` describes this base.
    ///
    /// # Errors
    ///
    /// Returns [`BaseError::Mismatch`] when the family or revision differ.
    pub fn check_release(&self, release: &OsRelease) -> Result<(), BaseError> {
        let id = release.id().unwrap_or_default().to_ascii_lowercase();
        let version = release.version_id().unwrap_or_default();
        if id == self.family && version == self.revision {
            return Ok(());
        }
        Err(BaseError::Mismatch {
            expected: self.to_string(),
            found: format!("{}:{}", display_or_unknown(&id), display_or_unknown(version)),
        })
    }

    /// Checks that packages are only requested where they can be installed.
    ///
    /// # Errors
    ///
    /// Returns [`BaseError::NoPackageManager`] when packages are listed for
    /// an unknown family.
    pub fn check_installable(&self) -> Result<(), BaseError> {
        if self.packages.is_empty() || self.package_manager().is_some() {
            Ok(())
        } else {
            Err(BaseError::NoPackageManager(self.family.clone()))
        }
    }
}

fn display_or_unknown(value: &str) -> &str {
    if value.is_empty() { "unknown" } else { value }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.revision)
    }
}

impl FromStr for Base {
    type Err = BaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((family, revision))
                if !family.trim().is_empty() && !revision.trim().is_empty() =>
            {
                Ok(Self::new(family, revision))
            }
            _ => Err(BaseError::Descriptor(value.to_owned())),
        }
    }
}

/// Record kiln leaves in a configured guest.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CompatibilityRecord {
    /// Tag of the configuration recipe applied to the guest.
    pub compatibility_tag: String,
}

impl CompatibilityRecord {
    /// Record for `base`.
    #[must_use]
    pub fn for_base(base: &Base) -> Self {
        Self {
            compatibility_tag: base.compatibility_tag.clone(),
        }
    }

    /// Serialises the record as YAML.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Parses a record from YAML.
    ///
    /// # Errors
    ///
    /// Returns the parser error.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}
