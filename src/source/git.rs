use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::DateTime;
use gix::{bstr::BStr, remote::Direction, traverse::tree::Recorder, ObjectId};
use tempfile::TempDir;

use crate::{
    archive::{Package, PackageFile},
    chart::{ChartMetadata, Dependency, Requirements, RequirementsLock},
    download::DependencyManager,
    ignore::Rules,
    registry::IndexRegistry,
    source::{IndexedDirectory, LocalRepository},
    util::join_path,
    CHART_FILE_NAME, IGNORE_FILE_NAME, LOCKFILE_FILE_NAME, PATH_ANNOTATION,
    REQUIREMENTS_FILE_NAME, REPOSITORY_ANNOTATION,
};

#[derive(Debug, Default)]
struct WalkState {
    cloned: bool,
    head: Option<ObjectId>,
    // chart files already indexed, keyed by path and blob hash so that a
    // manifest is only processed once per distinct content
    visited: HashSet<String>,
}

/// A git repository whose history is indexed for charts.
///
/// The upstream is cloned bare into a scratch directory that lives as long
/// as the repository value. Each [`update`](GitRepository::update) fetches
/// the upstream and walks every commit reachable from the default branch's
/// head, discovering chart manifests under the configured indexed
/// directories and publishing them into the registry's indexes.
pub struct GitRepository {
    name: String,
    url: String,
    directories: Vec<IndexedDirectory>,
    registry: Arc<IndexRegistry>,
    dependencies: Arc<DependencyManager>,
    checkout: TempDir,
    state: Mutex<WalkState>,
}

impl GitRepository {
    /// Returns a new repository named `name` for the given upstream URL.
    pub fn new(
        name: String,
        url: String,
        directories: Vec<IndexedDirectory>,
        registry: Arc<IndexRegistry>,
        dependencies: Arc<DependencyManager>,
    ) -> Result<Self, std::io::Error> {
        Ok(GitRepository {
            name,
            url,
            directories,
            registry,
            dependencies,
            checkout: TempDir::new()?,
            state: Mutex::new(WalkState::default()),
        })
    }

    fn path(&self) -> &Path {
        self.checkout.path()
    }

    /// Clones or fetches the upstream, then indexes any commits reachable
    /// from the default branch's head that have not been walked before.
    pub fn update(&self) -> Result<(), errors::UpdateError> {
        let mut state = self.state.lock().unwrap();

        let begin = Instant::now();
        if state.cloned {
            self.fetch()?;
        } else {
            self.clone_upstream()?;
            state.cloned = true;
        }
        log::info!("fetched {} in {:?}", self.url, begin.elapsed());

        let repo = gix::open(self.path())
            .map_err(|e| errors::UpdateError::Open(self.path().to_path_buf(), Box::new(e)))?;
        let head = self.head_commit(&repo)?;
        let head_id = head.id;

        if state.head == Some(head_id) {
            return Ok(());
        }

        let begin = Instant::now();
        let mut walk = head
            .ancestors()
            .sorting(gix::traverse::commit::simple::Sorting::ByCommitTimeNewestFirst)
            .all()
            .map_err(|e| errors::UpdateError::Walk(self.url.clone(), e))?;

        while let Some(Ok(info)) = walk.next() {
            let commit = info
                .object()
                .map_err(|e| errors::UpdateError::ReadObject(info.id.to_string(), e))?;
            self.scan_commit(&mut state, &repo, &commit)?;
        }

        state.head = Some(head_id);
        log::info!("indexed {} at {} in {:?}", self.url, head_id, begin.elapsed());

        Ok(())
    }

    fn clone_upstream(&self) -> Result<(), errors::UpdateError> {
        let url = gix::Url::from_bytes(BStr::new(self.url.as_bytes()))
            .map_err(|e| errors::UpdateError::Url(self.url.clone(), e))?;

        gix::prepare_clone_bare(url, self.path())
            .map_err(|e| errors::UpdateError::Clone(self.url.clone(), Box::new(e)))?
            .fetch_only(gix::progress::Discard, &false.into())
            .map_err(|e| errors::UpdateError::Fetch(self.url.clone(), Box::new(e)))?;

        Ok(())
    }

    fn fetch(&self) -> Result<(), errors::UpdateError> {
        let path = self.path().to_path_buf();
        let repo = gix::open(&path)
            .map_err(|e| errors::UpdateError::Open(path.clone(), Box::new(e)))?;

        let remote = match repo.find_default_remote(Direction::Fetch) {
            Some(Ok(remote)) => remote,
            Some(Err(e)) => {
                return Err(errors::UpdateError::GetDefaultRemote(path, Box::new(e)))
            }
            None => return Err(errors::UpdateError::NoDefaultRemote(path)),
        };

        remote
            .connect(Direction::Fetch)
            .map_err(|e| errors::UpdateError::Connect(self.url.clone(), Box::new(e)))?
            .prepare_fetch(gix::progress::Discard, Default::default())
            .map_err(|e| errors::UpdateError::PrepareFetch(self.url.clone(), Box::new(e)))?
            .receive(gix::progress::Discard, &false.into())
            .map_err(|e| errors::UpdateError::Receive(self.url.clone(), Box::new(e)))?;

        Ok(())
    }

    // Resolves the commit the default branch's head points at, through the
    // default remote's fetch refspec.
    fn head_commit<'a>(
        &self,
        repo: &'a gix::Repository,
    ) -> Result<gix::Commit<'a>, errors::HeadError> {
        let path = repo.path().to_path_buf();

        let remote = match repo.find_default_remote(Direction::Fetch) {
            Some(Ok(remote)) => remote,
            Some(Err(e)) => return Err(errors::HeadError::GetDefaultRemote(path, Box::new(e))),
            None => return Err(errors::HeadError::NoDefaultRemote(path)),
        };

        let refspec = match remote.refspecs(Direction::Fetch).first() {
            Some(refspec) => refspec,
            None => return Err(errors::HeadError::NoRefSpecs(path)),
        };

        let spec_ref = refspec.to_ref();
        let local_ref = match spec_ref.local() {
            Some(local) => local
                .to_string()
                .replace('*', repo.branch_names().first().unwrap_or(&"main")),
            None => return Err(errors::HeadError::NoLocalRefSpec(path)),
        };

        let reference = match repo.find_reference(&local_ref) {
            Ok(reference) => reference,
            Err(e) => return Err(errors::HeadError::NoReference(local_ref, e)),
        };

        let reference_name = reference.name().as_bstr().to_string();
        let id = match reference.into_fully_peeled_id() {
            Ok(id) => id,
            Err(e) => return Err(errors::HeadError::CannotPeel(reference_name, e)),
        };

        let id_str = id.to_string();
        let object = match id.object() {
            Ok(object) => object,
            Err(e) => return Err(errors::HeadError::CannotConvertToObject(id_str, e)),
        };

        object
            .try_into_commit()
            .map_err(|e| errors::HeadError::NotACommit(id_str, e))
    }

    fn scan_commit(
        &self,
        state: &mut WalkState,
        repo: &gix::Repository,
        commit: &gix::Commit<'_>,
    ) -> Result<(), errors::UpdateError> {
        log::debug!("scanning commit {}", commit.id);

        let commit_id = commit.id.to_string();
        let created = DateTime::from_timestamp(
            commit.time().map(|time| time.seconds).unwrap_or_default(),
            0,
        )
        .unwrap_or_default();

        for directory in &self.directories {
            let tree = commit
                .tree()
                .map_err(|e| errors::UpdateError::Tree(commit_id.clone(), e))?;

            let subtree = if directory.prefix.is_empty() {
                tree
            } else {
                let mut buf = Vec::new();
                match tree.lookup_entry(directory.prefix.split('/'), &mut buf) {
                    Ok(Some(entry)) if entry.mode().is_tree() => entry
                        .object()
                        .map_err(|e| {
                            errors::UpdateError::ReadObject(directory.prefix.clone(), e)
                        })?
                        .into_tree(),
                    Ok(_) => {
                        log::debug!(
                            "directory {} not present at commit {commit_id}",
                            directory.prefix
                        );
                        continue;
                    }
                    Err(e) => {
                        return Err(errors::UpdateError::Lookup(directory.prefix.clone(), e))
                    }
                }
            };

            let mut recorder = Recorder::default();
            subtree
                .traverse()
                .breadthfirst(&mut recorder)
                .map_err(|e| errors::UpdateError::Traverse(commit_id.clone(), e))?;

            for record in recorder.records {
                if !record.mode.is_blob() {
                    continue;
                }
                let filepath = record.filepath.to_string();
                let basename = filepath.rsplit('/').next().unwrap_or(filepath.as_str());
                if basename != CHART_FILE_NAME {
                    continue;
                }

                let path = join_path([directory.prefix.as_str(), filepath.as_str()]);
                let key = format!("{path}|{}", record.oid);
                if !state.visited.insert(key) {
                    log::debug!("already indexed {path} at commit {commit_id}");
                    continue;
                }

                let mut object = repo
                    .find_object(record.oid)
                    .map_err(|e| errors::UpdateError::ReadObject(path.clone(), e))?;
                let data = std::mem::take(&mut object.data);

                let mut metadata = match ChartMetadata::parse(&data) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        log::error!("error parsing {path} at commit {commit_id}: {e}");
                        continue;
                    }
                };

                // a configured index missing from the registry is fatal
                let index = self.registry.get(&directory.index_name)?;

                let chart_dir = match path.rsplit_once('/') {
                    Some((dir, _)) => dir,
                    None => "",
                };
                let file_name = format!("{}-{}.tgz", metadata.name, metadata.version);
                let url = join_path([
                    self.name.as_str(),
                    commit_id.as_str(),
                    chart_dir,
                    file_name.as_str(),
                ]);
                metadata
                    .annotations
                    .insert(REPOSITORY_ANNOTATION.to_string(), self.name.clone());
                metadata.annotations.insert(
                    PATH_ANNOTATION.to_string(),
                    join_path([commit_id.as_str(), chart_dir]),
                );

                let name = metadata.name.clone();
                let version = metadata.version.clone();
                if index.add(metadata, vec![url], created, Some(record.oid.to_string())) {
                    log::debug!("indexed {name}@{version} from commit {commit_id}");
                }
            }
        }

        Ok(())
    }

    /// Loads the chart at `<commit>/<tree-path>`, resolves its declared
    /// dependencies, and returns the package ready for archiving.
    pub fn extract_package(&self, path: &str) -> Result<Package, errors::ExtractError> {
        let (commit, tree_path) = path
            .split_once('/')
            .ok_or_else(|| errors::ExtractError::InvalidPackageName(path.to_string()))?;
        if tree_path.is_empty() {
            return Err(errors::ExtractError::InvalidPackageName(path.to_string()));
        }
        if !self.directories.iter().any(|d| d.matches(tree_path)) {
            return Err(errors::ExtractError::DirectoryNotFound(
                tree_path.to_string(),
            ));
        }

        let repo = gix::open(self.path())
            .map_err(|e| errors::ExtractError::Open(self.path().to_path_buf(), Box::new(e)))?;

        let id = ObjectId::from_hex(commit.as_bytes())
            .map_err(|_| errors::ExtractError::InvalidCommit(commit.to_string()))?;
        let commit = repo
            .find_object(id)
            .map_err(|e| errors::ExtractError::CommitNotFound(id.to_string(), e))?
            .try_into_commit()
            .map_err(|e| errors::ExtractError::NotACommit(id.to_string(), e))?;
        let tree = commit
            .tree()
            .map_err(|e| errors::ExtractError::Tree(id.to_string(), e))?;

        let mut buf = Vec::new();
        let subtree = match tree.lookup_entry(tree_path.split('/'), &mut buf) {
            Ok(Some(entry)) if entry.mode().is_tree() => entry
                .object()
                .map_err(|e| errors::ExtractError::ReadObject(tree_path.to_string(), e))?
                .into_tree(),
            Ok(_) => {
                return Err(errors::ExtractError::DirectoryNotFound(
                    tree_path.to_string(),
                ))
            }
            Err(e) => return Err(errors::ExtractError::Lookup(tree_path.to_string(), e)),
        };

        let mut recorder = Recorder::default();
        subtree
            .traverse()
            .breadthfirst(&mut recorder)
            .map_err(|e| errors::ExtractError::Traverse(tree_path.to_string(), e))?;

        let mut files = Vec::new();
        let mut ignore_file = None;
        let mut requirements = None;
        let mut lockfile = None;
        for record in recorder.records {
            if !record.mode.is_blob() {
                continue;
            }
            let filepath = record.filepath.to_string();

            let mut object = repo
                .find_object(record.oid)
                .map_err(|e| errors::ExtractError::ReadObject(filepath.clone(), e))?;
            let data = std::mem::take(&mut object.data);

            match filepath.as_str() {
                IGNORE_FILE_NAME => ignore_file = Some(data.clone()),
                REQUIREMENTS_FILE_NAME => requirements = Some(data.clone()),
                LOCKFILE_FILE_NAME => lockfile = Some(data.clone()),
                _ => {}
            }
            files.push(PackageFile {
                path: filepath,
                data,
            });
        }

        let mut rules = match &ignore_file {
            Some(data) => Rules::parse(&String::from_utf8_lossy(data))?,
            None => Rules::empty(),
        };
        rules.add_defaults();

        let dependencies = load_dependencies(lockfile.as_deref(), requirements.as_deref())?;
        let archives = self
            .dependencies
            .download(&dependencies)
            .map_err(|e| errors::ExtractError::Download(Box::new(e)))?;

        let base_name = tree_path.rsplit('/').next().unwrap_or(tree_path);
        Ok(Package::new(
            base_name.to_string(),
            rules,
            files,
            archives.into_iter().collect::<BTreeMap<_, _>>(),
        ))
    }
}

// The lock file takes precedence over the requirements file; a chart with
// neither has no dependencies.
fn load_dependencies(
    lockfile: Option<&[u8]>,
    requirements: Option<&[u8]>,
) -> Result<Vec<Dependency>, errors::ExtractError> {
    if let Some(data) = lockfile {
        let lock: RequirementsLock =
            serde_yaml::from_slice(data).map_err(errors::ExtractError::Requirements)?;
        return Ok(lock.dependencies);
    }
    if let Some(data) = requirements {
        let requirements: Requirements =
            serde_yaml::from_slice(data).map_err(errors::ExtractError::Requirements)?;
        return Ok(requirements.dependencies);
    }

    Ok(Vec::new())
}

impl LocalRepository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn archive(&self, path: &str) -> Result<Vec<u8>, errors::ExtractError> {
        let package = self.extract_package(path)?;
        Ok(package.to_bytes()?)
    }
}

/// Errors that can occur when interacting with a git-backed repository
pub mod errors {
    use std::path::PathBuf;

    use thiserror::Error;

    /// Errors that can occur when updating a git-backed repository
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum UpdateError {
        /// The upstream URL is malformed
        #[error("invalid repository url {0}")]
        Url(String, #[source] gix::url::parse::Error),

        /// Error cloning the upstream repository
        #[error("error cloning repository from {0}")]
        Clone(String, #[source] Box<gix::clone::Error>),

        /// Error fetching during the initial clone
        #[error("error fetching repository from {0}")]
        Fetch(String, #[source] Box<gix::clone::fetch::Error>),

        /// Error opening the local clone
        #[error("error opening repository at {0}")]
        Open(PathBuf, #[source] Box<gix::open::Error>),

        /// No default remote found in the local clone
        #[error("no default remote found in repository at {0}")]
        NoDefaultRemote(PathBuf),

        /// Error getting the default remote of the local clone
        #[error("error getting default remote from repository at {0}")]
        GetDefaultRemote(PathBuf, #[source] Box<gix::remote::find::existing::Error>),

        /// Error connecting to the upstream repository
        #[error("error connecting to remote repository at {0}")]
        Connect(String, #[source] Box<gix::remote::connect::Error>),

        /// Error preparing a fetch from the upstream repository
        #[error("error preparing fetch from remote repository at {0}")]
        PrepareFetch(String, #[source] Box<gix::remote::fetch::prepare::Error>),

        /// Error receiving a fetch from the upstream repository
        #[error("error reading from remote repository at {0}")]
        Receive(String, #[source] Box<gix::remote::fetch::Error>),

        /// Error resolving the default branch's head
        #[error(transparent)]
        Head(#[from] HeadError),

        /// Error starting the commit walk
        #[error("error walking commits of {0}")]
        Walk(String, #[source] gix::revision::walk::Error),

        /// Error reading a commit's tree
        #[error("error reading tree of commit {0}")]
        Tree(String, #[source] gix::object::commit::Error),

        /// Error looking up a directory in a commit's tree
        #[error("error looking up directory {0}")]
        Lookup(String, #[source] gix::object::find::existing::Error),

        /// Error traversing a tree
        #[error("error traversing tree at commit {0}")]
        Traverse(String, #[source] gix::traverse::tree::breadthfirst::Error),

        /// Error reading an object from the repository
        #[error("error reading object {0}")]
        ReadObject(String, #[source] gix::object::find::existing::Error),

        /// A configured target index does not exist
        #[error(transparent)]
        IndexNotFound(#[from] crate::registry::errors::IndexNotFound),
    }

    /// Errors that can occur when resolving the default branch's head
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum HeadError {
        /// No default remote found in the local clone
        #[error("no default remote found in repository at {0}")]
        NoDefaultRemote(PathBuf),

        /// Error getting the default remote of the local clone
        #[error("error getting default remote from repository at {0}")]
        GetDefaultRemote(PathBuf, #[source] Box<gix::remote::find::existing::Error>),

        /// No refspecs found for the default remote
        #[error("no refspecs found in repository at {0}")]
        NoRefSpecs(PathBuf),

        /// The fetch refspec has no local side
        #[error("no local refspec found in repository at {0}")]
        NoLocalRefSpec(PathBuf),

        /// The local refspec does not name an existing reference
        #[error("no reference found for local refspec {0}")]
        NoReference(String, #[source] gix::reference::find::existing::Error),

        /// The reference cannot be peeled to an id
        #[error("cannot peel reference {0}")]
        CannotPeel(String, #[source] gix::reference::peel::Error),

        /// The peeled id cannot be read as an object
        #[error("error converting id {0} to object")]
        CannotConvertToObject(String, #[source] gix::object::find::existing::Error),

        /// The peeled object is not a commit
        #[error("object {0} is not a commit")]
        NotACommit(String, #[source] gix::object::try_into::Error),
    }

    /// Errors that can occur when extracting a chart package
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum ExtractError {
        /// The request path does not name a commit and chart directory
        #[error("invalid package name {0}")]
        InvalidPackageName(String),

        /// The chart directory is outside every indexed directory, or absent
        /// at the requested commit
        #[error("directory {0} not found")]
        DirectoryNotFound(String),

        /// Error opening the local clone
        #[error("error opening repository at {0}")]
        Open(PathBuf, #[source] Box<gix::open::Error>),

        /// The commit hash is malformed
        #[error("invalid commit hash {0}")]
        InvalidCommit(String),

        /// The commit does not exist in the repository
        #[error("commit {0} not found")]
        CommitNotFound(String, #[source] gix::object::find::existing::Error),

        /// The named object is not a commit
        #[error("object {0} is not a commit")]
        NotACommit(String, #[source] gix::object::try_into::Error),

        /// Error reading the commit's tree
        #[error("error reading tree of commit {0}")]
        Tree(String, #[source] gix::object::commit::Error),

        /// Error looking up the chart directory
        #[error("error looking up directory {0}")]
        Lookup(String, #[source] gix::object::find::existing::Error),

        /// Error traversing the chart tree
        #[error("error traversing tree at {0}")]
        Traverse(String, #[source] gix::traverse::tree::breadthfirst::Error),

        /// Error reading an object from the repository
        #[error("error reading object {0}")]
        ReadObject(String, #[source] gix::object::find::existing::Error),

        /// The chart's ignore file could not be parsed
        #[error(transparent)]
        Ignore(#[from] crate::ignore::errors::ParseError),

        /// The chart's requirements could not be parsed
        #[error("error parsing chart dependencies")]
        Requirements(#[source] serde_yaml::Error),

        /// Downloading the chart's dependencies failed
        #[error("error downloading chart dependencies")]
        Download(#[source] Box<crate::download::errors::DownloadError>),

        /// Writing the chart archive failed
        #[error(transparent)]
        Archive(#[from] crate::archive::errors::ArchiveError),
    }

    impl ExtractError {
        /// Whether the error means the requested package does not exist.
        pub fn not_found(&self) -> bool {
            matches!(
                self,
                ExtractError::InvalidPackageName(_) | ExtractError::DirectoryNotFound(_)
            )
        }
    }
}
