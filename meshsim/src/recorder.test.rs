use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::test_utils::fast_config;

fn record(source: &str, dest: &str, kind: Kind) -> FlowRecord {
    FlowRecord {
        source: source.to_string(),
        dest: dest.to_string(),
        kind,
        timestamp: Utc::now(),
        duration: None,
        trace: None,
    }
}

fn collecting(overflow: OverflowPolicy, capacity: usize) -> SimConfig {
    SimConfig {
        collect: true,
        overflow,
        flow_capacity: capacity,
        ..fast_config()
    }
}

#[test_log::test(tokio::test)]
async fn test_blocking_sink_records_everything() {
    let (mut recorder, sink) = Recorder::start(&collecting(OverflowPolicy::Block, 2));
    assert_matches!(sink, FlowSink::Blocking(_));

    let mut timed = record("us-east-1.b.0", "us-east-1.a.0", Kind::GetResponse);
    timed.duration = Some(Duration::from_millis(3));
    sink.emit_all([
        record("us-east-1.a.0", "us-east-1.b.0", Kind::GetRequest),
        record("us-east-1.a.0", "us-east-1.b.0", Kind::GetRequest),
        timed,
        record("us-east-1.a.0", "us-east-1.c.0", Kind::Chat),
    ])
    .await;

    assert!(recorder.finish(Duration::from_secs(1)).await);
    let snapshot = recorder.snapshot();
    assert_eq!(snapshot.records.len(), 4);
    assert_eq!(snapshot.dropped, 0);
    assert_eq!(snapshot.records_of(Kind::GetRequest).count(), 2);

    let edge = snapshot.edge("us-east-1.a.0", "us-east-1.b.0").unwrap();
    assert_eq!(edge.count, 2);
    assert_eq!(edge.count_of(Kind::GetRequest), 2);
    assert_eq!(edge.count_of(Kind::Chat), 0);
    assert_eq!(snapshot.service_edge_count("b", "a", Kind::GetResponse), 1);
    assert_eq!(snapshot.latency[&Kind::GetResponse].count, 1);
    assert!(!snapshot.latency.contains_key(&Kind::GetRequest));
}

#[test_log::test(tokio::test)]
async fn test_disabled_sink_records_nothing() {
    let mut config = fast_config();
    config.collect = false;
    let (mut recorder, sink) = Recorder::start(&config);
    assert!(!sink.is_enabled());

    sink.emit(record("us-east-1.a.0", "us-east-1.b.0", Kind::Hello))
        .await;
    assert!(recorder.finish(Duration::from_millis(10)).await);
    let snapshot = recorder.snapshot();
    assert!(snapshot.records.is_empty());
    assert!(snapshot.edges.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_drop_oldest_counts_what_it_loses() {
    let (mut recorder, sink) = Recorder::start(&collecting(OverflowPolicy::DropOldest, 4));
    assert_matches!(sink, FlowSink::DropOldest(_));

    // Nothing here yields, so the recorder only sees the queue once we finish.
    for _ in 0..100 {
        sink.emit(record("us-east-1.a.0", "us-east-1.b.0", Kind::Put))
            .await;
    }
    assert!(recorder.finish(Duration::from_secs(1)).await);

    let snapshot = recorder.snapshot();
    assert!(snapshot.dropped > 0);
    assert_eq!(snapshot.records.len() as u64 + snapshot.dropped, 100);
}

#[test]
fn test_graph_keeps_calls_only() {
    let mut store = FlowStore::default();
    store.ingest(record("us-east-1.a.0", "us-east-1.b.0", Kind::GetRequest));
    store.ingest(record("us-east-1.a.0", "us-east-1.b.0", Kind::Hello));
    store.ingest(record("us-east-1.b.0", "us-east-1.a.0", Kind::GetResponse));
    store.ingest(record("us-east-1.b.0", "us-east-1.c.0", Kind::Chat));

    let graph = store.snapshot().graph(
        "shop",
        vec!["us-east-1.a.0".to_string(), "us-east-1.d.0".to_string()],
    );
    assert_eq!(graph.arch, "shop");
    assert_eq!(
        graph.nodes,
        vec!["us-east-1.a.0", "us-east-1.b.0", "us-east-1.d.0"]
    );
    assert_eq!(
        graph.edges,
        vec![GraphEdge {
            source: "us-east-1.a.0".to_string(),
            dest: "us-east-1.b.0".to_string(),
            count: 2,
        }]
    );

    let json = graph.to_json().unwrap();
    assert_eq!(ExportedGraph::from_json(&json).unwrap(), graph);
    assert!(ExportedGraph::from_json("{\"arch\": 1}").is_err());
}

#[test]
fn test_service_of() {
    assert_eq!(service_of("us-east-1.cart.3"), "cart");
    assert_eq!(service_of("cart"), "cart");
    assert_eq!(service_of("a.b"), "a.b");
}
