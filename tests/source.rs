use std::sync::Arc;

use navigator::{
    download::DependencyManager,
    registry::IndexRegistry,
    source::{git::GitRepository, IndexedDirectory},
    PATH_ANNOTATION, REPOSITORY_ANNOTATION,
};

use prelude::*;


struct Harness {
    registry: Arc<IndexRegistry>,
    repository: Arc<GitRepository>,
    // keeps the upstream alive for the duration of the test
    _fixture: FixtureRepository,
}

fn harness() -> Harness {
    let fixture = chart_fixture();

    let registry = Arc::new(IndexRegistry::new());
    registry.create("default");
    let dependency_manager = Arc::new(DependencyManager::new(registry.clone()));

    let repository = Arc::new(
        GitRepository::new(
            "repo".to_string(),
            fixture.url(),
            vec![IndexedDirectory::parse("charts")],
            registry.clone(),
            dependency_manager.clone(),
        )
        .unwrap(),
    );
    dependency_manager.add_local_repository(repository.clone());

    // clone, then a fetch that finds nothing new
    repository.update().unwrap();
    repository.update().unwrap();

    Harness {
        registry,
        repository,
        _fixture: fixture,
    }
}

#[test]
fn indexes_every_chart_revision_in_history() {
    let harness = harness();
    let index = harness.registry.get("default").unwrap();

    // two versions of mychart across two commits, one of mydependencychart
    assert_eq!(index.count(), (2, 3));

    let newest = index.get("mychart", "0.2.0").unwrap();
    let oldest = index.get("mychart", "0.1.0").unwrap();
    assert_eq!(newest.created.timestamp(), SECOND_COMMIT_TIME);
    assert_eq!(oldest.created.timestamp(), FIRST_COMMIT_TIME);
    assert!(newest.digest.is_some());

    let url = &newest.urls[0];
    assert!(url.starts_with("repo/"));
    assert!(url.ends_with("/charts/mychart/mychart-0.2.0.tgz"));

    assert_eq!(
        newest.metadata.annotations.get(REPOSITORY_ANNOTATION),
        Some(&"repo".to_string())
    );
    let path = newest.metadata.annotations.get(PATH_ANNOTATION).unwrap();
    assert!(path.ends_with("/charts/mychart"));

    // the unchanged dependency chart is deduplicated across both commits
    let dependency = index.get("mydependencychart", "0.1.0").unwrap();
    assert_eq!(dependency.created.timestamp(), SECOND_COMMIT_TIME);
}

#[test]
fn extracts_archives_with_dependencies_and_ignore_rules() {
    let harness = harness();
    let index = harness.registry.get("default").unwrap();

    let entry = index.get("mychart", "0.2.0").unwrap();
    let path = entry.metadata.annotations.get(PATH_ANNOTATION).unwrap();

    let package = harness.repository.extract_package(path).unwrap();
    assert_eq!(package.name(), "mychart");

    let entries = archive_entries(&package.to_bytes().unwrap());
    let manifest = String::from_utf8(entries.get("mychart/Chart.yaml").unwrap().clone()).unwrap();
    assert!(manifest.contains("version: 0.2.0"));
    assert!(entries.contains_key("mychart/values.yaml"));
    assert!(entries.contains_key("mychart/templates/deployment.yaml"));

    // .helmignore rules applied
    assert!(!entries.contains_key("mychart/NOTES.md"));

    // the aliased dependency is resolved through the local index and
    // injected as a nested archive
    let nested = entries.get("mychart/charts/mydependencychart.tgz").unwrap();
    let nested_entries = archive_entries(nested);
    let nested_manifest = String::from_utf8(
        nested_entries
            .get("mydependencychart/Chart.yaml")
            .unwrap()
            .clone(),
    )
    .unwrap();
    assert!(nested_manifest.contains("name: mydependencychart"));
}

#[test]
fn rejects_paths_outside_indexed_directories() {
    let harness = harness();

    let err = harness
        .repository
        .extract_package("0000000000000000000000000000000000000000/other/thing")
        .unwrap_err();
    assert!(err.not_found());

    let err = harness.repository.extract_package("no-slash").unwrap_err();
    assert!(err.not_found());
}

#[test]
fn update_is_idempotent_for_an_unchanged_head() {
    let harness = harness();
    let index = harness.registry.get("default").unwrap();
    let before = index.count();

    harness.repository.update().unwrap();
    assert_eq!(index.count(), before);
}
