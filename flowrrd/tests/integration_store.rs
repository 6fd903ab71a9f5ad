//! Integration tests for the store lifecycle: creation, writes, reset and
//! inspection through the `Datasource` interface.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use flowrrd::error::{CreateError, WriteError};
use flowrrd::file::RrdFile;
use flowrrd::ring::Ring;
use flowrrd::{Config, Datasource, Field, FlowError, MetricClass, Protocol, RrdStore, Sample};
use tempfile::tempdir;

/// Day aligned, so every tier boundary falls on it.
const T: u64 = 1_699_920_000;

fn store(root: &Path) -> RrdStore {
    let mut config = Config::from_toml_str(
        r#"
        [general]
        sources = ["gw"]
        ports = [443]
        "#,
    )
    .unwrap();
    config.general.storage_root = root.to_path_buf();
    RrdStore::new(Arc::new(config))
}

fn sample(source: &str, port: u16, timestamp: u64, flows: f64) -> Sample {
    let mut fields = BTreeMap::new();
    fields.insert(Field::new(MetricClass::Flows, Protocol::Any), flows);
    fields.insert(Field::new(MetricClass::Flows, Protocol::Tcp), flows / 2.0);
    fields.insert(Field::new(MetricClass::Bytes, Protocol::Any), flows * 1500.0);
    Sample {
        source: source.to_string(),
        port,
        timestamp,
        fields,
    }
}

fn fine_value(path: &Path, field: &str, timestamp: u64) -> f64 {
    let file = RrdFile::open(path).unwrap();
    let index = file.field_index(field).unwrap();
    Ring::new(&file, 0).get(index, timestamp)
}

#[test]
fn test_create_is_not_idempotent_without_reset() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());

    store.create_at("gw", 0, false, T).unwrap();
    let err = store.create("gw", 0, false).unwrap_err();
    assert!(matches!(err, FlowError::Create(CreateError::AlreadyExists { .. })));

    // The existing file is untouched.
    assert_eq!(store.last_update("gw", 0).unwrap(), T);
}

#[test]
fn test_reset_creates_every_key() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());

    store.reset(&[]).unwrap();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["443.rrd", "gw.rrd", "gw_443.rrd"]);
}

#[test]
fn test_reset_replaces_existing_data() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());

    store.create_at("gw", 0, false, T - 300).unwrap();
    store.write(&sample("gw", 0, T, 3000.0)).unwrap();
    assert_eq!(store.last_update("gw", 0).unwrap(), T);

    store.reset(&["gw".to_string()]).unwrap();
    let path = store.resolve_path("gw", 0);
    assert!(fine_value(&path, "flows", T).is_nan());
    assert_ne!(store.last_update("gw", 0).unwrap(), T);
}

#[test]
fn test_write_stores_rates() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    let path = store.create_at("gw", 443, false, T - 300).unwrap();

    store.write(&sample("gw", 443, T, 3000.0)).unwrap();

    assert_eq!(fine_value(&path, "flows", T), 10.0);
    assert_eq!(fine_value(&path, "flows_tcp", T), 5.0);
    assert_eq!(fine_value(&path, "bytes", T), 15_000.0);
    // Fields missing from the sample are unknown.
    assert!(fine_value(&path, "packets", T).is_nan());
    assert!(fine_value(&path, "flows_udp", T).is_nan());
}

#[test]
fn test_write_floors_timestamp() {
    let floored = tempdir().unwrap();
    let exact = tempdir().unwrap();
    let a = store(floored.path());
    let b = store(exact.path());
    let path_a = a.create_at("gw", 0, false, T - 300).unwrap();
    let path_b = b.create_at("gw", 0, false, T - 300).unwrap();

    a.write(&sample("gw", 0, T + 17, 900.0)).unwrap();
    b.write(&sample("gw", 0, T, 900.0)).unwrap();

    assert_eq!(a.last_update("gw", 0).unwrap(), T);
    assert_eq!(b.last_update("gw", 0).unwrap(), T);
    assert_eq!(std::fs::read(path_a).unwrap(), std::fs::read(path_b).unwrap());
}

#[test]
fn test_write_rejects_outdated_sample() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();

    store.write(&sample("gw", 0, T, 1.0)).unwrap();
    let err = store.write(&sample("gw", 0, T + 299, 1.0)).unwrap_err();
    assert!(matches!(err, FlowError::Write(WriteError::Outdated { timestamp: T, last_update: T })));
}

#[test]
fn test_write_creates_missing_file() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    let now = chrono::Utc::now().timestamp() as u64;

    store.write(&sample("edge", 80, now, 100.0)).unwrap();

    assert!(dir.path().join("edge_80.rrd").exists());
    assert_eq!(store.last_update("edge", 80).unwrap(), now - now % 300);
}

#[test]
fn test_write_rejects_invalid_key() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());

    let err = store.write(&sample("", 0, T, 1.0)).unwrap_err();
    assert!(matches!(err, FlowError::Write(WriteError::Create(CreateError::InvalidKey { .. }))));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn test_date_boundaries() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();
    store.write(&sample("gw", 0, T, 1.0)).unwrap();

    let (first, last) = store.date_boundaries("gw").unwrap();
    assert_eq!(last, T);
    assert_eq!(first, T - 12_959 * 300);
}

#[cfg(unix)]
#[test]
fn test_create_in_read_only_directory() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let root = dir.path().join("ro");
    std::fs::create_dir(&root).unwrap();
    std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o555)).unwrap();

    let store = store(&root);
    let err = store.create("gw", 0, false).unwrap_err();

    std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert!(matches!(err, FlowError::Create(CreateError::NotWritable { .. })), "{err}");
    assert!(!root.join("gw.rrd").exists());
}
