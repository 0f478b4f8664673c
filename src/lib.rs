#![deny(missing_docs)]
//! navigator indexes Helm charts across the entire commit history of git
//! repositories and serves them as a standard chart repository. Every chart
//! revision that ever existed on the default branch becomes a downloadable
//! release, without a separate publishing step.
//!
//! The library contains the indexing engine: the chart [`index`](crate::index),
//! the [`registry`](crate::registry) of named indexes, the concurrent
//! dependency [`download`](crate::download) manager, the git-backed
//! [`source`](crate::source) repository, and the tar+gzip
//! [`archive`](crate::archive) producer. The HTTP surface lives in the
//! `navigator-server` crate.

/// Archive assembly
pub mod archive;
/// Chart manifests and declared dependencies
pub mod chart;
/// Dependency downloading
pub mod download;
/// Ignore rules for chart packaging
pub mod ignore;
/// The chart index
pub mod index;
/// Named indexes
pub mod registry;
/// Source repositories
pub mod source;
/// Hashing and path helpers
pub mod util;

/// The name of the chart manifest file
pub const CHART_FILE_NAME: &str = "Chart.yaml";
/// The name of the chart ignore file
pub const IGNORE_FILE_NAME: &str = ".helmignore";
/// The name of the chart requirements file
pub const REQUIREMENTS_FILE_NAME: &str = "requirements.yaml";
/// The name of the chart requirements lock file
pub const LOCKFILE_FILE_NAME: &str = "requirements.lock";
/// The name of the default index
pub const DEFAULT_INDEX_NAME: &str = "default";

/// Annotation naming the repository a chart was indexed from
pub const REPOSITORY_ANNOTATION: &str = "repository";
/// Annotation naming the commit-qualified tree path of an indexed chart
pub const PATH_ANNOTATION: &str = "path";
