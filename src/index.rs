use std::{
    cmp::Ordering,
    collections::BTreeMap,
    io::Write,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::chart::ChartMetadata;

/// A chart bound to the URLs it can be retrieved from, the commit time it
/// was created at, and a digest of its manifest content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageEntry {
    /// The chart metadata
    #[serde(flatten)]
    pub metadata: ChartMetadata,
    /// Retrieval URLs, the first being canonical
    #[serde(default)]
    pub urls: Vec<String>,
    /// The committer time of the commit the chart was discovered in
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    /// Digest of the chart manifest content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl PartialEq for PackageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.name == other.metadata.name && self.metadata.version == other.metadata.version
    }
}

impl Eq for PackageEntry {}

/// The serialized shape of a chart repository index document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    /// The index document format version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// When the document was generated
    #[serde(default = "Utc::now")]
    pub generated: DateTime<Utc>,
    /// Chart name to known versions, newest first
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<PackageEntry>>,
}

impl IndexFile {
    fn new() -> Self {
        IndexFile {
            api_version: "v1".to_string(),
            generated: Utc::now(),
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Cache {
    raw: Vec<u8>,
    compressed: Vec<u8>,
    // distinguishes a populated-but-stale cache from an empty one
    valid: bool,
}

#[derive(Debug)]
struct State {
    file: IndexFile,
    cache: Cache,
}

/// An in-memory chart index.
///
/// The index holds at most one entry per chart name and version; inserting a
/// duplicate replaces the existing entry only when the new entry carries a
/// strictly later creation time, so the latest committed revision of a chart
/// version always wins regardless of walk order.
///
/// Serialization is memoized in both raw and gzip form. Any mutation
/// invalidates both cached buffers together; the `generated` timestamp is
/// stamped when the cache is regenerated and is stable for as long as the
/// cache is valid.
#[derive(Debug)]
pub struct Index {
    state: RwLock<State>,
}

impl Default for Index {
    fn default() -> Self {
        Index::new()
    }
}

impl Index {
    /// Returns a new empty index.
    pub fn new() -> Self {
        Index {
            state: RwLock::new(State {
                file: IndexFile::new(),
                cache: Cache::default(),
            }),
        }
    }

    /// Adds a chart to the index. Returns whether the index changed.
    pub fn add(
        &self,
        metadata: ChartMetadata,
        urls: Vec<String>,
        created: DateTime<Utc>,
        digest: Option<String>,
    ) -> bool {
        let mut state = self.state.write().unwrap();

        let entry = PackageEntry {
            metadata,
            urls,
            created,
            digest,
        };

        let versions = state.file.entries.entry(entry.metadata.name.clone()).or_default();
        match versions
            .iter()
            .position(|existing| existing.metadata.version == entry.metadata.version)
        {
            None => versions.push(entry),
            Some(idx) if entry.created > versions[idx].created => versions[idx] = entry,
            Some(_) => return false,
        }

        state.cache.valid = false;
        true
    }

    /// Returns the entry for a chart version.
    ///
    /// An empty version returns the newest entry; otherwise an exact version
    /// match is preferred, falling back to the highest version satisfying
    /// `version` parsed as a semver requirement.
    pub fn get(&self, name: &str, version: &str) -> Option<PackageEntry> {
        let state = self.state.read().unwrap();

        let versions = state.file.entries.get(name)?;
        if version.is_empty() {
            return versions
                .iter()
                .max_by(|a, b| compare_versions(&a.metadata.version, &b.metadata.version))
                .cloned();
        }

        if let Some(entry) = versions.iter().find(|e| e.metadata.version == version) {
            return Some(entry.clone());
        }

        let requirement = VersionReq::parse(version).ok()?;
        versions
            .iter()
            .filter_map(|e| Version::parse(&e.metadata.version).ok().map(|v| (v, e)))
            .filter(|(v, _)| requirement.matches(v))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, e)| e.clone())
    }

    /// Returns the number of distinct charts and the total number of chart
    /// versions in the index.
    pub fn count(&self) -> (usize, usize) {
        let state = self.state.read().unwrap();

        let charts = state.file.entries.len();
        let versions = state.file.entries.values().map(Vec::len).sum();

        (charts, versions)
    }

    /// Writes the YAML serialization of the index. The serialized form is
    /// cached so that subsequent calls do not re-serialize an unchanged
    /// index.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), errors::WriteError> {
        {
            let state = self.state.read().unwrap();
            if state.cache.valid {
                writer.write_all(&state.cache.raw)?;
                return Ok(());
            }
        }

        let mut state = self.state.write().unwrap();
        regenerate(&mut state)?;
        writer.write_all(&state.cache.raw)?;

        Ok(())
    }

    /// Writes the gzip-compressed YAML serialization of the index, cached
    /// alongside the raw form.
    pub fn compressed_write_to<W: Write>(&self, writer: &mut W) -> Result<(), errors::WriteError> {
        {
            let state = self.state.read().unwrap();
            if state.cache.valid {
                writer.write_all(&state.cache.compressed)?;
                return Ok(());
            }
        }

        let mut state = self.state.write().unwrap();
        regenerate(&mut state)?;
        writer.write_all(&state.cache.compressed)?;

        Ok(())
    }

    /// Replaces the index contents with a parsed index document.
    pub fn unmarshal(&self, data: &[u8]) -> Result<(), errors::UnmarshalError> {
        let file: IndexFile = serde_yaml::from_slice(data)?;

        let mut state = self.state.write().unwrap();
        state.file = file;
        state.cache.valid = false;

        Ok(())
    }
}

fn regenerate(state: &mut State) -> Result<(), errors::WriteError> {
    if state.cache.valid {
        return Ok(());
    }

    for versions in state.file.entries.values_mut() {
        versions.sort_by(|a, b| compare_versions(&b.metadata.version, &a.metadata.version));
    }
    state.file.generated = Utc::now();

    let raw = serde_yaml::to_string(&state.file)?.into_bytes();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    state.cache = Cache {
        raw,
        compressed,
        valid: true,
    };

    Ok(())
}

// Semver ordering, with unparseable versions sorting below parseable ones
// and comparing lexically among themselves.
fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Errors that can occur when serializing or deserializing an index
pub mod errors {
    use thiserror::Error;

    /// Errors that can occur when writing an index document
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum WriteError {
        /// The index could not be serialized
        #[error("error serializing index")]
        Serialize(#[from] serde_yaml::Error),

        /// The serialized index could not be written out
        #[error("error writing index")]
        Io(#[from] std::io::Error),
    }

    /// Errors that can occur when parsing an index document
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum UnmarshalError {
        /// The document is not a valid index
        #[error("error deserializing index")]
        Parse(#[from] serde_yaml::Error),
    }
}
