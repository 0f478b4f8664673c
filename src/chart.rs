use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The parsed contents of a chart manifest file.
///
/// Only `name` and `version` are interpreted; every other field is carried
/// verbatim so that serialized index entries reproduce the manifest exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartMetadata {
    /// The chart name
    pub name: String,
    /// The chart version
    pub version: String,
    /// Chart annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Any remaining manifest fields, preserved as-is
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ChartMetadata {
    /// Parses and validates a chart manifest.
    pub fn parse(data: &[u8]) -> Result<Self, errors::ParseError> {
        let metadata: ChartMetadata = serde_yaml::from_slice(data)?;
        if metadata.name.is_empty() {
            return Err(errors::ParseError::MissingName);
        }
        if metadata.version.is_empty() {
            return Err(errors::ParseError::MissingVersion);
        }

        Ok(metadata)
    }
}

/// A chart dependency declared in a requirements or lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    /// The dependency chart name
    pub name: String,
    /// The dependency version constraint
    #[serde(default)]
    pub version: String,
    /// The repository the dependency comes from, either an http(s) URL or
    /// an alias of a named local index
    #[serde(default)]
    pub repository: String,
}

impl Dependency {
    /// Returns the index name when the repository reference is an alias of
    /// the form `alias:NAME` or `@NAME`.
    pub fn alias(&self) -> Option<&str> {
        self.repository
            .strip_prefix("alias:")
            .or_else(|| self.repository.strip_prefix('@'))
    }
}

/// The chart requirements file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Requirements {
    /// The declared dependencies
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// The chart requirements lock file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequirementsLock {
    /// The locked dependencies
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Errors that can occur when handling chart manifests
pub mod errors {
    use thiserror::Error;

    /// Errors that can occur when parsing a chart manifest
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum ParseError {
        /// The manifest is not valid YAML
        #[error("error deserializing chart manifest")]
        Serde(#[from] serde_yaml::Error),

        /// The manifest has no chart name
        #[error("chart manifest has no name")]
        MissingName,

        /// The manifest has no chart version
        #[error("chart manifest has no version")]
        MissingVersion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preserves_unknown_fields() {
        let metadata = ChartMetadata::parse(
            b"name: mychart\nversion: 0.1.0\ndescription: a chart\nkeywords:\n- web\n",
        )
        .unwrap();
        assert_eq!(metadata.name, "mychart");
        assert_eq!(metadata.version, "0.1.0");
        assert!(metadata.extra.contains_key("description"));
        assert!(metadata.extra.contains_key("keywords"));
    }

    #[test]
    fn parse_rejects_incomplete_manifests() {
        assert!(matches!(
            ChartMetadata::parse(b"version: 0.1.0\nname: \"\"\n"),
            Err(errors::ParseError::MissingName)
        ));
        assert!(matches!(
            ChartMetadata::parse(b"name: mychart\nversion: \"\"\n"),
            Err(errors::ParseError::MissingVersion)
        ));
    }

    #[test]
    fn alias_forms() {
        let mut dependency = Dependency {
            name: "mychart".to_string(),
            version: "0.1.0".to_string(),
            repository: "alias:stable".to_string(),
        };
        assert_eq!(dependency.alias(), Some("stable"));

        dependency.repository = "@stable".to_string();
        assert_eq!(dependency.alias(), Some("stable"));

        dependency.repository = "https://example.com/charts".to_string();
        assert_eq!(dependency.alias(), None);
    }
}
