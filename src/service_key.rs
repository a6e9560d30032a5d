//! The `group/interface:version` cache and subscription key derived from a URL.

use std::fmt;

use fabric_core::Url;

/// Identifies one service reference independent of any single provider URL.
/// Used as the per-service configuration-listener cache key and to derive
/// the naming-service level `<category>:<interface>:<version>:<group>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    group: String,
    interface: String,
    version: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        interface: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            interface: interface.into(),
            version: version.into(),
        }
    }

    /// Derive the key from a URL's `path` (interface name) and its `group`/
    /// `version` parameters.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.parameter("group", ""), url.path(), url.parameter("version", ""))
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// `<application>.configurators`-style cache key for this service, used
    /// by [`crate::config_listener::ServiceConfigurationListener`].
    #[must_use]
    pub fn configurators_key(&self) -> String {
        format!("{self}.configurators")
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        write!(f, "{}", self.interface)?;
        if !self.version.is_empty() {
            write!(f, ":{}", self.version)?;
        }
        Ok(())
    }
}
