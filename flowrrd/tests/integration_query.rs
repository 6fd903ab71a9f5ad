//! Integration tests for graph queries over real data files.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use flowrrd::error::QueryError;
use flowrrd::query::MAX_ROWS;
use flowrrd::{Config, Datasource, Display, Field, FlowError, MetricClass, Protocol, QueryRequest, RrdStore, Sample};
use tempfile::tempdir;

const T: u64 = 1_699_920_000;

fn store(root: &Path) -> RrdStore {
    let mut config = Config::from_toml_str(
        r#"
        [general]
        sources = ["gw", "edge"]
        ports = [80, 443]
        "#,
    )
    .unwrap();
    config.general.storage_root = root.to_path_buf();
    RrdStore::new(Arc::new(config))
}

/// Writes `flows` total flows, split evenly between tcp and udp.
fn write(store: &RrdStore, source: &str, port: u16, timestamp: u64, flows: f64) {
    let mut fields = BTreeMap::new();
    fields.insert(Field::new(MetricClass::Flows, Protocol::Any), flows);
    fields.insert(Field::new(MetricClass::Flows, Protocol::Tcp), flows / 2.0);
    fields.insert(Field::new(MetricClass::Flows, Protocol::Udp), flows / 2.0);
    store
        .write(&Sample {
            source: source.to_string(),
            port,
            timestamp,
            fields,
        })
        .unwrap();
}

#[test]
fn test_round_trip() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 600).unwrap();
    write(&store, "gw", 0, T - 300, 3000.0);
    write(&store, "gw", 0, T, 3000.0);

    let result = store
        .query(&QueryRequest {
            start: T - 3000,
            end: T,
            sources: vec!["gw".to_string()],
            protocols: vec![Protocol::Any],
            ..QueryRequest::default()
        })
        .unwrap();

    assert_eq!(result.step, 300);
    assert_eq!(result.legend, vec!["gw_flows_any"]);
    assert_eq!(result.data.len(), 10);
    assert_eq!(result.data[&(T - 300)], vec![Some(10.0)]);
    assert_eq!(result.data[&T], vec![Some(10.0)]);
    // Buckets without data come back as None rather than NaN.
    assert_eq!(result.data[&(T - 600)], vec![None]);
    assert_eq!(result.data[&(T - 2700)], vec![None]);
}

#[test]
fn test_sources_display() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    for source in ["gw", "edge"] {
        store.create_at(source, 0, false, T - 300).unwrap();
    }
    write(&store, "gw", 0, T, 3000.0);
    write(&store, "edge", 0, T, 1200.0);

    let result = store
        .query(&QueryRequest {
            start: T - 1200,
            end: T,
            ..QueryRequest::default()
        })
        .unwrap();

    assert_eq!(result.legend, vec!["gw_flows_tcp", "edge_flows_tcp"]);
    assert_eq!(result.data[&T], vec![Some(5.0), Some(2.0)]);
}

#[test]
fn test_protocols_display() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();
    write(&store, "gw", 0, T, 3000.0);

    let result = store
        .query(&QueryRequest {
            start: T - 1200,
            end: T,
            sources: vec!["gw".to_string()],
            display: Display::Protocols,
            ..QueryRequest::default()
        })
        .unwrap();

    assert_eq!(result.legend, vec!["tcp_flows_gw", "udp_flows_gw", "icmp_flows_gw", "other_flows_gw"]);
    assert_eq!(result.data[&T], vec![Some(5.0), Some(5.0), None, None]);
}

#[test]
fn test_ports_display_for_any_source() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    for port in [80, 443] {
        store.create_at("", port, false, T - 300).unwrap();
    }
    write(&store, "", 80, T, 600.0);
    write(&store, "", 443, T, 2400.0);

    let result = store
        .query(&QueryRequest {
            start: T - 1200,
            end: T,
            sources: vec!["any".to_string()],
            protocols: vec![Protocol::Any],
            display: Display::Ports,
            ..QueryRequest::default()
        })
        .unwrap();

    assert_eq!(result.legend, vec!["80_flows_any", "443_flows_any"]);
    assert_eq!(result.data[&T], vec![Some(2.0), Some(8.0)]);
}

#[test]
fn test_unaligned_range_is_floored() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();
    write(&store, "gw", 0, T, 3000.0);

    let request = QueryRequest {
        start: T - 1200,
        end: T,
        sources: vec!["gw".to_string()],
        ..QueryRequest::default()
    };
    let aligned = store.query(&request).unwrap();
    let unaligned = store
        .query(&QueryRequest {
            start: T - 1200 + 123,
            end: T + 299,
            ..request
        })
        .unwrap();

    assert_eq!(aligned, unaligned);
}

#[test]
fn test_long_range_is_capped() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();
    write(&store, "gw", 0, T, 3000.0);

    let result = store
        .query(&QueryRequest {
            start: T - 30 * 86_400,
            end: T,
            sources: vec!["gw".to_string()],
            ..QueryRequest::default()
        })
        .unwrap();

    assert!(result.data.len() <= MAX_ROWS, "{} rows", result.data.len());
    assert_eq!(result.step % 300, 0);
    assert!(result.step > 300);
    assert!(result.start <= T - 30 * 86_400);
    assert!(result.end >= T);
}

#[test]
fn test_missing_file_fails_query() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();

    let err = store
        .query(&QueryRequest {
            start: T - 1200,
            end: T,
            ..QueryRequest::default()
        })
        .unwrap_err();

    match err {
        FlowError::Query(QueryError::Unreadable { path, .. }) => assert!(path.ends_with("edge.rrd")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_empty_range_fails_query() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();

    let err = store
        .query(&QueryRequest {
            start: T + 10,
            end: T + 200,
            sources: vec!["gw".to_string()],
            ..QueryRequest::default()
        })
        .unwrap_err();

    assert!(matches!(err, FlowError::Query(QueryError::InvalidTimeRange { .. })));
}

#[test]
fn test_query_stays_inside_storage_root() {
    let dir = tempdir().unwrap();
    let outside = store(&dir.path().join("outside"));
    outside.create_at("secret", 0, false, T - 300).unwrap();
    write(&outside, "secret", 0, T, 3000.0);

    let store = store(&dir.path().join("root"));
    store.create_at("gw", 443, false, T - 300).unwrap();

    for source in ["../outside/secret", "gw_443"] {
        let err = store
            .query(&QueryRequest {
                start: T - 1200,
                end: T,
                sources: vec![source.to_string()],
                protocols: vec![Protocol::Any],
                ..QueryRequest::default()
            })
            .unwrap_err();
        assert!(
            matches!(err, FlowError::Query(QueryError::InvalidParameter { what: "source", .. })),
            "{source}: {err}"
        );
        assert!(store.last_update(source, 0).is_err(), "{source}");
    }
}

#[test]
fn test_unbounded_range_fails_query() {
    let dir = tempdir().unwrap();
    let store = store(dir.path());
    store.create_at("gw", 0, false, T - 300).unwrap();
    write(&store, "gw", 0, T, 3000.0);

    let err = store
        .query(&QueryRequest {
            start: 0,
            end: u64::MAX,
            sources: vec!["gw".to_string()],
            ..QueryRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, FlowError::Query(QueryError::InvalidTimeRange { .. })));

    // A range of decades is still answered within the row budget.
    let result = store
        .query(&QueryRequest {
            start: 0,
            end: 4_000_000_000,
            sources: vec!["gw".to_string()],
            ..QueryRequest::default()
        })
        .unwrap();
    assert!(result.data.len() <= MAX_ROWS);
}
