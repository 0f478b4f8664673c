use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use threadpool::ThreadPool;

use crate::{
    chart::Dependency, index::Index, registry::IndexRegistry, source::LocalRepository,
    PATH_ANNOTATION, REPOSITORY_ANNOTATION,
};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_WORKERS: usize = 6;

// A lazily populated index for one remote repository. The inner mutex
// serializes the fetch-and-parse of its index document so that concurrent
// dependency downloads from the same origin collapse into one network fetch.
#[derive(Debug)]
struct SingleflightIndex {
    index: Index,
    fetch: Mutex<()>,
}

impl SingleflightIndex {
    fn new() -> Self {
        SingleflightIndex {
            index: Index::new(),
            fetch: Mutex::new(()),
        }
    }
}

// A fully resolved download target, prepared before any worker is spawned.
enum Fetch {
    Remote {
        origin: Arc<SingleflightIndex>,
        base: String,
    },
    Local {
        repository: Arc<dyn LocalRepository>,
        path: String,
    },
}

/// Downloads the declared dependencies of a chart.
///
/// A dependency names a versioned chart in a remote repository, or in a
/// named local index via an alias reference. Remote repositories have their
/// index document downloaded and cached on first use; aliased dependencies
/// are assembled by the local repository that indexed them.
pub struct DependencyManager {
    client: reqwest::blocking::Client,
    registry: Arc<IndexRegistry>,
    remotes: Mutex<HashMap<String, Arc<SingleflightIndex>>>,
    local: Mutex<HashMap<String, Weak<dyn LocalRepository>>>,
}

impl DependencyManager {
    /// Returns a new dependency manager resolving aliases against `registry`.
    pub fn new(registry: Arc<IndexRegistry>) -> Self {
        DependencyManager {
            client: reqwest::blocking::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .expect("failed to build http client"),
            registry,
            remotes: Mutex::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a local repository for aliased dependency resolution. The
    /// manager does not keep the repository alive.
    pub fn add_local_repository(&self, repository: Arc<dyn LocalRepository>) {
        self.local
            .lock()
            .unwrap()
            .insert(repository.name().to_string(), Arc::downgrade(&repository));
    }

    /// Downloads every dependency concurrently, returning archives keyed by
    /// `<name>.tgz`. The first failure cancels the remaining downloads and
    /// is returned; no partial result is produced.
    pub fn download(
        &self,
        dependencies: &[Dependency],
    ) -> Result<HashMap<String, Vec<u8>>, errors::DownloadError> {
        if dependencies.is_empty() {
            return Ok(HashMap::new());
        }

        let mut fetches = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            fetches.push(self.prepare(dependency)?);
        }

        let pool = ThreadPool::new(dependencies.len().min(DOWNLOAD_WORKERS));
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        for (idx, (dependency, fetch)) in dependencies.iter().cloned().zip(fetches).enumerate() {
            let tx = tx.clone();
            let cancelled = Arc::clone(&cancelled);
            let client = self.client.clone();

            pool.execute(move || {
                let result = if cancelled.load(Ordering::SeqCst) {
                    Err(errors::DownloadError::Cancelled)
                } else {
                    match fetch {
                        Fetch::Local { repository, path } => repository
                            .archive(&path)
                            .map_err(|e| errors::DownloadError::Archive(Box::new(e))),
                        Fetch::Remote { origin, base } => {
                            package_url(&client, &origin, &dependency, &base)
                                .and_then(|url| download_url(&client, &url))
                        }
                    }
                };

                if result.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                let _ = tx.send((idx, result));
            });
        }

        pool.join();
        drop(tx);

        let mut slots: Vec<Option<Result<Vec<u8>, errors::DownloadError>>> =
            dependencies.iter().map(|_| None).collect();
        for (idx, result) in rx {
            slots[idx] = Some(result);
        }

        // surface the root cause rather than a cancellation artifact
        let mut cancelled_error = None;
        let mut archives = HashMap::new();
        for (dependency, slot) in dependencies.iter().zip(slots) {
            match slot {
                Some(Ok(data)) => {
                    archives.insert(format!("{}.tgz", dependency.name), data);
                }
                Some(Err(errors::DownloadError::Cancelled)) => {
                    cancelled_error = Some(errors::DownloadError::Cancelled);
                }
                Some(Err(e)) => return Err(e),
                None => cancelled_error = Some(errors::DownloadError::Cancelled),
            }
        }
        if let Some(e) = cancelled_error {
            return Err(e);
        }

        Ok(archives)
    }

    // Classifies a dependency reference, resolving aliases to a local
    // repository and validating remote repository URLs.
    fn prepare(&self, dependency: &Dependency) -> Result<Fetch, errors::DownloadError> {
        if let Some(alias) = dependency.alias() {
            return self.prepare_local(dependency, alias);
        }

        let repository = url::Url::parse(&dependency.repository).map_err(|_| {
            errors::DownloadError::InvalidRepository {
                name: dependency.name.clone(),
                version: dependency.version.clone(),
                repository: dependency.repository.clone(),
            }
        })?;
        match repository.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(errors::DownloadError::UnsupportedScheme {
                    name: dependency.name.clone(),
                    version: dependency.version.clone(),
                    scheme: scheme.to_string(),
                })
            }
        }

        Ok(Fetch::Remote {
            origin: self.origin(&dependency.repository),
            base: dependency.repository.trim_end_matches('/').to_string(),
        })
    }

    fn prepare_local(
        &self,
        dependency: &Dependency,
        alias: &str,
    ) -> Result<Fetch, errors::DownloadError> {
        let index = self.registry.get(alias)?;
        let entry = index.get(&dependency.name, &dependency.version).ok_or_else(|| {
            errors::DownloadError::NotFound {
                name: dependency.name.clone(),
                version: dependency.version.clone(),
                repository: dependency.repository.clone(),
            }
        })?;

        let (repository, path) = match (
            entry.metadata.annotations.get(REPOSITORY_ANNOTATION),
            entry.metadata.annotations.get(PATH_ANNOTATION),
        ) {
            (Some(repository), Some(path)) => (repository.clone(), path.clone()),
            _ => {
                return Err(errors::DownloadError::MissingAnnotations {
                    name: dependency.name.clone(),
                    version: dependency.version.clone(),
                })
            }
        };

        let repository = self
            .local
            .lock()
            .unwrap()
            .get(&repository)
            .and_then(Weak::upgrade)
            .ok_or(errors::DownloadError::RepositoryNotFound(repository))?;

        Ok(Fetch::Local { repository, path })
    }

    // Find-or-insert under the manager-wide lock; the per-origin fetch lock
    // takes over for any network I/O.
    fn origin(&self, repository: &str) -> Arc<SingleflightIndex> {
        self.remotes
            .lock()
            .unwrap()
            .entry(repository.to_string())
            .or_insert_with(|| Arc::new(SingleflightIndex::new()))
            .clone()
    }
}

// Resolves the download URL of a dependency against a remote origin,
// fetching and parsing the origin's index document if the dependency is not
// already known.
fn package_url(
    client: &reqwest::blocking::Client,
    origin: &SingleflightIndex,
    dependency: &Dependency,
    base: &str,
) -> Result<String, errors::DownloadError> {
    let _flight = origin.fetch.lock().unwrap();

    let entry = match origin.index.get(&dependency.name, &dependency.version) {
        Some(entry) => entry,
        None => {
            let url = format!("{base}/index.yaml");
            let body = download_url(client, &url)?;
            origin
                .index
                .unmarshal(&body)
                .map_err(|e| errors::DownloadError::Unmarshal { url, source: e })?;

            origin
                .index
                .get(&dependency.name, &dependency.version)
                .ok_or_else(|| errors::DownloadError::NotFound {
                    name: dependency.name.clone(),
                    version: dependency.version.clone(),
                    repository: dependency.repository.clone(),
                })?
        }
    };

    let raw = entry.urls.first().map(String::as_str).unwrap_or_default();
    let resolved = match url::Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            url::Url::parse(&format!("{base}/{raw}")).ok()
        }
        Err(_) => None,
    };

    match resolved {
        Some(url) => Ok(url.to_string()),
        None => Err(errors::DownloadError::InvalidPackageUrl {
            name: dependency.name.clone(),
            version: dependency.version.clone(),
            url: raw.to_string(),
        }),
    }
}

fn download_url(
    client: &reqwest::blocking::Client,
    url: &str,
) -> Result<Vec<u8>, errors::DownloadError> {
    let begin = Instant::now();
    let result = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes());

    match result {
        Ok(body) => {
            log::debug!("downloaded {url} in {:?}", begin.elapsed());
            Ok(body.to_vec())
        }
        Err(e) => {
            log::error!("error downloading {url} after {:?}: {e}", begin.elapsed());
            Err(errors::DownloadError::Request {
                url: url.to_string(),
                source: e,
            })
        }
    }
}

/// Errors that can occur when downloading chart dependencies
pub mod errors {
    use thiserror::Error;

    /// Errors that can occur when downloading chart dependencies
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum DownloadError {
        /// The dependency's repository reference is not a valid URL
        #[error("chart dependency {name}:{version} has invalid repository {repository}")]
        InvalidRepository {
            /// The dependency name
            name: String,
            /// The dependency version
            version: String,
            /// The offending repository reference
            repository: String,
        },

        /// The dependency's repository URL uses an unsupported scheme
        #[error("chart dependency {name}:{version} has unsupported repository scheme {scheme}://")]
        UnsupportedScheme {
            /// The dependency name
            name: String,
            /// The dependency version
            version: String,
            /// The offending scheme
            scheme: String,
        },

        /// An aliased dependency names an index that does not exist
        #[error(transparent)]
        IndexNotFound(#[from] crate::registry::errors::IndexNotFound),

        /// The dependency is absent from its repository's index
        #[error("chart dependency {name}:{version} not found in repository {repository}")]
        NotFound {
            /// The dependency name
            name: String,
            /// The dependency version
            version: String,
            /// The repository reference that was searched
            repository: String,
        },

        /// An indexed entry is missing its origin annotations
        #[error("chart dependency {name}:{version} has no origin annotations")]
        MissingAnnotations {
            /// The dependency name
            name: String,
            /// The dependency version
            version: String,
        },

        /// The local repository owning an aliased dependency is not registered
        #[error("repository {0} not found")]
        RepositoryNotFound(String),

        /// The index entry's package URL cannot be resolved to an absolute URL
        #[error("chart dependency {name}:{version} has invalid package url {url}")]
        InvalidPackageUrl {
            /// The dependency name
            name: String,
            /// The dependency version
            version: String,
            /// The offending URL
            url: String,
        },

        /// An HTTP request failed
        #[error("error requesting {url}")]
        Request {
            /// The requested URL
            url: String,
            /// The underlying error
            #[source]
            source: reqwest::Error,
        },

        /// A remote index document could not be parsed
        #[error("error parsing index from {url}")]
        Unmarshal {
            /// The index document URL
            url: String,
            /// The underlying error
            #[source]
            source: crate::index::errors::UnmarshalError,
        },

        /// Assembling an aliased dependency's archive failed
        #[error("error assembling local dependency archive")]
        Archive(#[source] Box<crate::source::git::errors::ExtractError>),

        /// The download was cancelled because a sibling download failed
        #[error("download cancelled")]
        Cancelled,
    }
}
