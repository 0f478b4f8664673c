use std::io::Read;

use chrono::{Duration, TimeZone, Utc};

use navigator::{
    chart::ChartMetadata,
    index::Index,
    registry::IndexRegistry,
};

fn metadata(name: &str, version: &str) -> ChartMetadata {
    ChartMetadata {
        name: name.to_string(),
        version: version.to_string(),
        annotations: Default::default(),
        extra: Default::default(),
    }
}

fn write(index: &Index) -> Vec<u8> {
    let mut buffer = Vec::new();
    index.write_to(&mut buffer).unwrap();
    buffer
}

// the generated timestamp is expected to differ between serializations of
// equal content
fn without_generated(document: &[u8]) -> String {
    String::from_utf8(document.to_vec())
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with("generated:"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn latest_creation_time_wins() {
    let index = Index::new();
    let t0 = Utc.timestamp_opt(1_500_000_000, 0).unwrap();

    assert!(index.add(metadata("foo", "1.0.0"), vec!["a".to_string()], t0, None));

    // an earlier revision of the same version is rejected
    assert!(!index.add(
        metadata("foo", "1.0.0"),
        vec!["b".to_string()],
        t0 - Duration::hours(1),
        None,
    ));
    let entry = index.get("foo", "1.0.0").unwrap();
    assert_eq!(entry.created, t0);
    assert_eq!(entry.urls, vec!["a".to_string()]);

    // a later revision replaces it
    assert!(index.add(
        metadata("foo", "1.0.0"),
        vec!["c".to_string()],
        t0 + Duration::hours(1),
        None,
    ));
    let entry = index.get("foo", "1.0.0").unwrap();
    assert_eq!(entry.created, t0 + Duration::hours(1));
    assert_eq!(entry.urls, vec!["c".to_string()]);

    // an equal timestamp is rejected too
    assert!(!index.add(
        metadata("foo", "1.0.0"),
        vec!["d".to_string()],
        t0 + Duration::hours(1),
        None,
    ));

    assert_eq!(index.count(), (1, 1));
}

#[test]
fn count_tracks_charts_and_versions() {
    let index = Index::new();
    let now = Utc::now();

    index.add(metadata("foo", "1.0.0"), vec![], now, None);
    index.add(metadata("foo", "1.1.0"), vec![], now, None);
    index.add(metadata("bar", "0.1.0"), vec![], now, None);

    assert_eq!(index.count(), (2, 3));
}

#[test]
fn serialization_is_cached_until_mutation() {
    let index = Index::new();
    index.add(metadata("foo", "1.0.0"), vec!["foo-1.0.0.tgz".to_string()], Utc::now(), None);

    let first = write(&index);
    let second = write(&index);
    // byte-identical, including the generated timestamp: the cache was hit
    assert_eq!(first, second);

    index.add(metadata("foo", "1.1.0"), vec!["foo-1.1.0.tgz".to_string()], Utc::now(), None);
    let third = write(&index);
    assert_ne!(first, third);
}

#[test]
fn compressed_form_matches_raw_form() {
    let index = Index::new();
    index.add(metadata("foo", "1.0.0"), vec!["foo-1.0.0.tgz".to_string()], Utc::now(), None);

    let raw = write(&index);
    let mut compressed = Vec::new();
    index.compressed_write_to(&mut compressed).unwrap();

    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    assert_eq!(raw, decompressed);
}

#[test]
fn round_trips_through_unmarshal() {
    let index = Index::new();
    let created = Utc.timestamp_opt(1_521_158_400, 0).unwrap();

    let mut rich = metadata("mychart", "0.1.0");
    rich.extra.insert(
        "description".to_string(),
        serde_yaml::Value::String("an example chart".to_string()),
    );
    index.add(rich, vec!["repo/abc/charts/mychart-0.1.0.tgz".to_string()], created, Some("deadbeef".to_string()));
    index.add(metadata("mychart", "0.2.0"), vec!["repo/def/charts/mychart-0.2.0.tgz".to_string()], created, None);
    index.add(metadata("other", "1.0.0"), vec!["repo/abc/charts/other-1.0.0.tgz".to_string()], created, None);

    let first = write(&index);

    let reloaded = Index::new();
    reloaded.unmarshal(&first).unwrap();
    let second = write(&reloaded);

    assert_eq!(without_generated(&first), without_generated(&second));
}

#[test]
fn entries_serialize_newest_version_first() {
    let index = Index::new();
    let now = Utc::now();

    index.add(metadata("foo", "0.1.0"), vec![], now, None);
    index.add(metadata("foo", "1.0.0"), vec![], now, None);
    index.add(metadata("foo", "0.9.9"), vec![], now, None);

    let document = String::from_utf8(write(&index)).unwrap();
    let one = document.find("version: 1.0.0").unwrap();
    let nine = document.find("version: 0.9.9").unwrap();
    let oldest = document.find("version: 0.1.0").unwrap();
    assert!(one < nine && nine < oldest);
}

#[test]
fn get_resolves_constraints_and_latest() {
    let index = Index::new();
    let now = Utc::now();

    index.add(metadata("foo", "0.1.0"), vec![], now, None);
    index.add(metadata("foo", "0.2.0"), vec![], now, None);
    index.add(metadata("foo", "1.0.0"), vec![], now, None);

    assert_eq!(index.get("foo", "0.2.0").unwrap().metadata.version, "0.2.0");
    assert_eq!(index.get("foo", "").unwrap().metadata.version, "1.0.0");
    assert_eq!(index.get("foo", "0.*").unwrap().metadata.version, "0.2.0");
    assert_eq!(index.get("foo", "^0.1").unwrap().metadata.version, "0.1.0");
    assert!(index.get("foo", "2.0.0").is_none());
    assert!(index.get("missing", "1.0.0").is_none());
}

#[test]
fn unmarshal_replaces_existing_state() {
    let index = Index::new();
    index.add(metadata("stale", "9.9.9"), vec![], Utc::now(), None);

    let document = b"apiVersion: v1\nentries:\n  mychart:\n  - created: \"2018-03-16T00:30:49Z\"\n    name: mychart\n    urls:\n    - foobar/mychart-0.1.0.tgz\n    version: 0.1.0\ngenerated: \"2018-03-16T01:38:43.0089988Z\"\n";
    index.unmarshal(document).unwrap();

    assert!(index.get("stale", "9.9.9").is_none());
    let entry = index.get("mychart", "0.1.0").unwrap();
    assert_eq!(entry.urls, vec!["foobar/mychart-0.1.0.tgz".to_string()]);
}

#[test]
fn registry_create_is_idempotent() {
    let registry = IndexRegistry::new();
    let first = registry.create("default");
    let second = registry.create("default");
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
fn registry_lookup_and_names() {
    let registry = IndexRegistry::new();
    registry.create("stable");
    registry.create("incubator");

    assert!(registry.get("stable").is_ok());
    assert!(registry.get("missing").is_err());
    assert_eq!(
        registry.names(),
        vec!["incubator".to_string(), "stable".to_string()]
    );
}
