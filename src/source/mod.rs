use crate::DEFAULT_INDEX_NAME;

/// Git-backed source repositories
pub mod git;

/// A repository-relative directory prefix routed into a named index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDirectory {
    /// The directory prefix; empty means the whole tree
    pub prefix: String,
    /// The name of the index charts under the prefix are routed into
    pub index_name: String,
}

impl IndexedDirectory {
    /// Parses a `dir[@index]` specification; a missing index name routes
    /// into the default index.
    pub fn parse(spec: &str) -> Self {
        let (prefix, index_name) = match spec.split_once('@') {
            Some((prefix, index_name)) if !index_name.is_empty() => (prefix, index_name),
            Some((prefix, _)) => (prefix, DEFAULT_INDEX_NAME),
            None => (spec, DEFAULT_INDEX_NAME),
        };

        IndexedDirectory {
            prefix: prefix.trim_matches('/').to_string(),
            index_name: index_name.to_string(),
        }
    }

    /// Returns whether a tree path falls under this directory. An empty
    /// prefix matches every path.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// A repository registered with the dependency manager, able to render a
/// chart package archive for one of its indexed charts.
pub trait LocalRepository: Send + Sync {
    /// The repository fingerprint
    fn name(&self) -> &str;
    /// The upstream URL
    fn url(&self) -> &str;
    /// Renders the archive of the chart at `<commit>/<tree-path>`
    fn archive(&self, path: &str) -> Result<Vec<u8>, git::errors::ExtractError>;
}
