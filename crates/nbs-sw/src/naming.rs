//! Partition naming: `{prefix}-{kind}-{version}`.

use crate::{Result, ServiceWorkerError};

/// The two kinds of partition a version owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    /// Navigable HTML documents and the precache manifest.
    Pages,
    /// Static build artifacts, icons and other same-origin GETs.
    Assets,
}

impl PartitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::Pages => "pages",
            PartitionKind::Assets => "assets",
        }
    }
}

/// Names of the current partitions for one app prefix and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    prefix: String,
    version: String,
}

impl CacheNames {
    /// Validate and build the naming scheme.
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let version = version.into();
        validate_component("prefix", &prefix)?;
        validate_component("version", &version)?;
        Ok(Self { prefix, version })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Partition name for a kind.
    pub fn name(&self, kind: PartitionKind) -> String {
        format!("{}-{}-{}", self.prefix, kind.as_str(), self.version)
    }

    pub fn pages(&self) -> String {
        self.name(PartitionKind::Pages)
    }

    pub fn assets(&self) -> String {
        self.name(PartitionKind::Assets)
    }

    /// Same names for another version.
    pub fn with_version(&self, version: impl Into<String>) -> Result<Self> {
        Self::new(self.prefix.clone(), version)
    }

    /// Whether a stored partition belongs to this app but not to this version.
    ///
    /// Partitions of other applications (different prefix) are never stale.
    pub fn is_stale(&self, name: &str) -> bool {
        name.starts_with(self.prefix.as_str()) && name != self.pages() && name != self.assets()
    }
}

/// Partition names double as directory names, so keep them plain.
pub(crate) fn validate_component(what: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ServiceWorkerError::InvalidName(format!(
            "{} '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            what, value
        )))
    }
}
