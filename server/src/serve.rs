use std::{collections::HashMap, sync::Arc};

use actix_web::{http::header, web, HttpRequest, HttpResponse};

use navigator::{
    download::DependencyManager,
    registry::IndexRegistry,
    source::{git::GitRepository, IndexedDirectory},
    util::fingerprint,
    DEFAULT_INDEX_NAME,
};

use crate::{error::Error, metrics, AppState};

/// The chart repository server state: named indexes, the dependency
/// manager, and the indexed source repositories keyed by fingerprint.
pub struct Navigator {
    registry: Arc<IndexRegistry>,
    dependency_manager: Arc<DependencyManager>,
    repositories: HashMap<String, Arc<GitRepository>>,
}

impl Default for Navigator {
    fn default() -> Self {
        Navigator::new()
    }
}

impl Navigator {
    pub fn new() -> Self {
        let registry = Arc::new(IndexRegistry::new());
        Navigator {
            dependency_manager: Arc::new(DependencyManager::new(registry.clone())),
            registry,
            repositories: HashMap::new(),
        }
    }

    /// Adds a git repository to index. Each directory spec is
    /// `dir[@index]`; an empty list indexes the whole tree into the
    /// default index.
    pub fn add_git_backed_repository(
        &mut self,
        url: &str,
        directories: &[String],
    ) -> Result<(), std::io::Error> {
        let name = fingerprint(url);
        log::info!(
            "adding repository {url} as {name}, directories: {}",
            directories.join(",")
        );

        let directories: Vec<IndexedDirectory> = if directories.is_empty() {
            vec![IndexedDirectory {
                prefix: String::new(),
                index_name: DEFAULT_INDEX_NAME.to_string(),
            }]
        } else {
            directories
                .iter()
                .map(|spec| IndexedDirectory::parse(spec))
                .collect()
        };
        for directory in &directories {
            self.registry.create(&directory.index_name);
        }

        let repository = Arc::new(GitRepository::new(
            name.clone(),
            url.to_string(),
            directories,
            self.registry.clone(),
            self.dependency_manager.clone(),
        )?);
        self.dependency_manager
            .add_local_repository(repository.clone());
        self.repositories.insert(name, repository);

        Ok(())
    }

    /// Fetches and indexes every repository, then republishes the per-index
    /// chart totals.
    pub fn update_repositories(&self) -> Result<(), navigator::source::git::errors::UpdateError> {
        for repository in self.repositories.values() {
            repository.update()?;
        }

        metrics::record_index_totals(&self.registry);

        Ok(())
    }
}

enum Reply {
    Index { body: Vec<u8>, compressed: bool },
    Chart(Vec<u8>),
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

pub async fn prometheus(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

/// Serves `GET /<index>/index.yaml` and
/// `GET /<index>/<repository>/<commit>/<dir>/<chart>-<version>.tgz`.
pub async fn serve(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let path = req.path().to_string();
    let gzip = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));

    // the engine does blocking git and network I/O
    let navigator = state.navigator.clone();
    let reply = web::block(move || dispatch(&navigator, &path, gzip))
        .await
        .map_err(|_| Error::Cancelled)??;

    Ok(match reply {
        Reply::Index { body, compressed } => {
            let mut response = HttpResponse::Ok();
            response.content_type("text/yaml");
            if compressed {
                response.insert_header((header::CONTENT_ENCODING, "gzip"));
            }
            response.body(body)
        }
        Reply::Chart(body) => HttpResponse::Ok()
            .content_type("application/x-tar")
            .body(body),
    })
}

fn dispatch(navigator: &Navigator, path: &str, gzip: bool) -> Result<Reply, Error> {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", path),
    };

    // serve an index document
    if file == "index.yaml" {
        let index = navigator.registry.get(dir.trim_matches('/'))?;

        let mut body = Vec::new();
        if gzip {
            index.compressed_write_to(&mut body)?;
        } else {
            index.write_to(&mut body)?;
        }
        return Ok(Reply::Index {
            body,
            compressed: gzip,
        });
    }

    // serve a packaged chart
    let (repository, tail) = dir
        .trim_matches('/')
        .split_once('/')
        .ok_or(Error::InvalidPackageName)?;
    let repository = navigator
        .repositories
        .get(repository)
        .ok_or(Error::RepositoryNotFound)?;

    let package = repository.extract_package(tail)?;
    let mut body = Vec::new();
    package.write_to(&mut body)?;

    Ok(Reply::Chart(body))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use actix_web::{middleware::from_fn, test, web, App};
    use git2::{IndexAddOption, RepositoryInitOptions, Signature, Time};

    use super::*;

    fn chart_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = git2::Repository::init_opts(dir.path(), &opts).unwrap();

        let chart = dir.path().join("charts/mychart");
        std::fs::create_dir_all(&chart).unwrap();
        std::fs::write(
            chart.join("Chart.yaml"),
            "name: mychart\nversion: 0.1.0\ndescription: an example chart\n",
        )
        .unwrap();
        std::fs::write(chart.join("values.yaml"), "replicas: 1\n").unwrap();

        let mut index = repo.index().unwrap();
        index
            .add_all(["*"], IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = Signature::new(
            "chart-author",
            "author@example.com",
            &Time::new(1_500_000_000, 0),
        )
        .unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "add charts", &tree, &[])
            .unwrap();

        dir
    }

    fn state(upstream: &tempfile::TempDir) -> web::Data<AppState> {
        // the recorder must be live before the update publishes gauges
        let handle = metrics::install();

        let mut navigator = Navigator::new();
        navigator
            .add_git_backed_repository(
                &upstream.path().display().to_string(),
                &["charts".to_string()],
            )
            .unwrap();
        navigator.update_repositories().unwrap();

        web::Data::new(AppState {
            navigator: Arc::new(navigator),
            metrics: handle,
        })
    }

    #[actix_web::test]
    async fn serves_indexes_charts_health_and_metrics() {
        let upstream = chart_fixture();
        let app = test::init_service(
            App::new()
                .wrap(from_fn(metrics::middleware))
                .app_data(state(&upstream))
                .route("/health", web::get().to(health))
                .route("/metrics", web::get().to(prometheus))
                .default_service(web::to(serve)),
        )
        .await;

        // health
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request())
            .await;
        assert!(resp.status().is_success());
        assert_eq!(test::read_body(resp).await, "ok");

        // index document
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/default/index.yaml").to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/yaml"
        );
        let body = test::read_body(resp).await;
        let document: serde_yaml::Value = serde_yaml::from_slice(&body).unwrap();
        let entry = &document["entries"]["mychart"][0];
        assert_eq!(entry["name"], "mychart");
        assert_eq!(entry["version"], "0.1.0");

        // gzip content negotiation
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/default/index.yaml")
                .insert_header((header::ACCEPT_ENCODING, "gzip"))
                .to_request(),
        )
        .await;
        assert_eq!(
            resp.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        let compressed = test::read_body(resp).await;
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_ref());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);

        // the indexed chart downloads as a tar archive rooted at its name
        let url = entry["urls"][0].as_str().unwrap().to_string();
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(&format!("/{url}")).to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-tar"
        );
        let body = test::read_body(resp).await;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(body.as_ref()));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(paths.contains(&"mychart/Chart.yaml".to_string()));
        assert!(paths.contains(&"mychart/values.yaml".to_string()));

        // unknown index
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/unknown/index.yaml").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);

        // unknown repository
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/unknown/path/chart-0.1.0.tgz")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);

        // metrics expose the request instruments and per-index totals
        let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request())
            .await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        for name in [
            "in_flight_requests",
            "requests_total",
            "request_duration_seconds",
            "response_size_bytes",
            "request_size_bytes",
            "navigator_total_charts_served",
            "navigator_total_chart_versions_served",
        ] {
            assert!(body.contains(name), "metrics output missing {name}");
        }
    }
}
