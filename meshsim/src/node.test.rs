use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::protocol::Kind;
use crate::system::{ActorSetup, System};
use crate::test_utils::{Probe, fast_config, name, test_system};

fn spawn_node(
    system: &System,
    instance: &str,
    service: ServiceDefinition,
    entry: bool,
    peers: Vec<Endpoint>,
) -> crate::system::Spawned {
    let spec = NodeSpec {
        name: name(instance),
        service: Arc::new(service),
        entry,
        config: system.config().clone(),
    };
    system
        .spawn(
            spec.name.clone(),
            Box::new(MeshNode::new(&spec)),
            ActorSetup {
                watch: Vec::new(),
                peers,
            },
        )
        .unwrap()
}

fn respond(store: &Probe, request: &Message, value: &str) -> Message {
    Message::new(
        Some(store.endpoint()),
        request.trace().copied(),
        Payload::GetResponse {
            key: "k".into(),
            value: Some(value.into()),
            degraded: false,
            answered: 0,
            expected: 0,
            elapsed: Duration::from_millis(1),
        },
    )
}

#[test_log::test(tokio::test)]
async fn test_leaf_answers_get_request() {
    let system = test_system(fast_config());
    let leaf = spawn_node(&system, "us-east-1.b.0", ServiceDefinition::new("b"), false, vec![]);
    let endpoint = leaf.endpoint();
    assert!(leaf.ready().await);

    let mut caller = Probe::new("us-east-1.a.0");
    let (request, trace) = caller.traced(Payload::GetRequest { key: "k".into() });
    endpoint.send(request).unwrap();

    let response = caller.expect(Kind::GetResponse).await;
    assert_eq!(response.trace(), Some(&trace));
    assert_eq!(response.sender(), Some(&endpoint));
    assert_matches!(
        response.payload(),
        Payload::GetResponse { value: Some(value), degraded: false, .. } if value == "us-east-1.b.0"
    );
}

#[test_log::test(tokio::test)]
async fn test_fan_out_aggregates_sub_responses() {
    let system = test_system(fast_config());
    let mut stores = vec![Probe::new("us-east-1.store.0"), Probe::new("us-east-1.store.1")];
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 2),
        false,
        stores.iter().map(Probe::endpoint).collect(),
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    let (request, trace) = caller.traced(Payload::GetRequest { key: "k".into() });
    endpoint.send(request).unwrap();

    for store in stores.iter_mut() {
        let sub_request = store.expect(Kind::GetRequest).await;
        let child = sub_request.trace().copied().unwrap();
        assert_eq!(child.trace, trace.trace);
        assert_eq!(child.parent, Some(trace.span));
        endpoint.send(respond(store, &sub_request, "v")).unwrap();
    }

    let response = caller.expect(Kind::GetResponse).await;
    assert_matches!(
        response.payload(),
        Payload::GetResponse { value: Some(value), degraded: false, answered: 2, expected: 2, .. } if value == "v"
    );

    let stats = endpoint.inspect().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.latency.count(), 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.degraded, 0);
    assert_eq!(stats.originated, 0);
    assert!(stats.end_to_end.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_stopped_dependency_yields_degraded_response() {
    let system = test_system(fast_config());
    let mut store = Probe::new("us-east-1.store.0");
    store.close();
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 1),
        false,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    let started = std::time::Instant::now();
    endpoint
        .send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();

    let response = caller.expect(Kind::GetResponse).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_matches!(
        response.payload(),
        Payload::GetResponse { value: None, degraded: true, answered: 0, expected: 1, .. }
    );
    assert!(endpoint.inspect().await.unwrap().dropped >= 1);
}

#[test_log::test(tokio::test)]
async fn test_partial_reply_keeps_what_arrived() {
    let system = test_system(fast_config());
    let mut fast = Probe::new("us-east-1.store.0");
    let mut slow = Probe::new("us-east-1.store.1");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 2),
        false,
        vec![fast.endpoint(), slow.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    endpoint
        .send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();

    let sub_request = fast.expect(Kind::GetRequest).await;
    endpoint.send(respond(&fast, &sub_request, "fast")).unwrap();
    slow.expect(Kind::GetRequest).await;

    let response = caller.expect(Kind::GetResponse).await;
    assert_matches!(
        response.payload(),
        Payload::GetResponse { value: Some(value), degraded: true, answered: 1, expected: 2, .. } if value == "fast"
    );
}

#[test_log::test(tokio::test)]
async fn test_empty_degraded_reply() {
    let system = test_system(crate::config::SimConfig {
        degraded: DegradedReply::Empty,
        ..fast_config()
    });
    let mut fast = Probe::new("us-east-1.store.0");
    let mut slow = Probe::new("us-east-1.store.1");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 2),
        false,
        vec![fast.endpoint(), slow.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    endpoint
        .send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();
    let sub_request = fast.expect(Kind::GetRequest).await;
    endpoint.send(respond(&fast, &sub_request, "fast")).unwrap();
    slow.expect(Kind::GetRequest).await;

    let response = caller.expect(Kind::GetResponse).await;
    assert_matches!(
        response.payload(),
        Payload::GetResponse { value: None, degraded: true, answered: 1, .. }
    );
}

#[test_log::test(tokio::test)]
async fn test_entry_originates_requests() {
    let system = test_system(fast_config());
    let mut store = Probe::new("us-east-1.store.0");
    let node = spawn_node(
        &system,
        "us-east-1.web.0",
        ServiceDefinition::new("web").depends_on("store", 1),
        true,
        vec![store.endpoint()],
    );
    assert!(node.ready().await);

    let hello = store.expect(Kind::Hello).await;
    assert_matches!(hello.payload(), Payload::Hello { name } if name.to_string() == "us-east-1.web.0");
    let request = store.expect(Kind::GetRequest).await;
    let trace = request.trace().copied().unwrap();
    assert_eq!(trace.parent, Some(trace.trace));
    store.expect(Kind::GetRequest).await;
}

#[test_log::test(tokio::test)]
async fn test_entry_counts_failed_requests() {
    let system = test_system(crate::config::SimConfig {
        fanout_timeout: Duration::from_millis(20),
        ..fast_config()
    });
    let mut store = Probe::new("us-east-1.store.0");
    store.close();
    let node = spawn_node(
        &system,
        "us-east-1.web.0",
        ServiceDefinition::new("web").depends_on("store", 1),
        true,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut stats = endpoint.inspect().await.unwrap();
    for _ in 0..100 {
        if stats.degraded >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        stats = endpoint.inspect().await.unwrap();
    }
    assert!(stats.degraded >= 2);
    assert_eq!(stats.completed, 0);
    assert!(stats.originated >= stats.degraded);
    assert_eq!(stats.end_to_end.count(), stats.degraded);
    assert!(stats.end_to_end.min().unwrap() >= Duration::from_millis(20));
    assert!(stats.dropped >= 1);
}

#[test_log::test(tokio::test)]
async fn test_put_forwards_and_replicate_stays_local() {
    let system = test_system(fast_config());
    let mut store = Probe::new("us-east-1.store.0");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 1),
        false,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);
    store.expect(Kind::Hello).await;

    let caller = Probe::new("us-east-1.web.0");
    endpoint
        .send(caller.message(Payload::Replicate {
            key: "k".into(),
            value: "1".into(),
        }))
        .unwrap();
    endpoint
        .send(caller.message(Payload::Put {
            key: "k".into(),
            value: "2".into(),
        }))
        .unwrap();
    // Same value again: nothing new to forward.
    endpoint
        .send(caller.message(Payload::Put {
            key: "k".into(),
            value: "2".into(),
        }))
        .unwrap();

    let forwarded = store.expect(Kind::Put).await;
    assert_matches!(forwarded.payload(), Payload::Put { value, .. } if value == "2");
    assert!(store.recv_within(Duration::from_millis(50)).await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_diagnostics_and_unknown_kinds() {
    let system = test_system(fast_config());
    let store = Probe::new("us-east-1.store.0");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 1),
        false,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    endpoint
        .send(caller.message(Payload::Unknown {
            kind: "Teleport".into(),
        }))
        .unwrap();
    endpoint
        .send(caller.message(Payload::Forget {
            name: store.endpoint().name().clone(),
        }))
        .unwrap();
    endpoint
        .send(caller.message(Payload::GoroutineCount))
        .unwrap();

    let reply = caller.expect(Kind::Metrics).await;
    let Payload::Metrics { report: Some(report) } = reply.payload() else {
        panic!("expected a metrics report");
    };
    assert_eq!(report.name, "us-east-1.api.0");
    assert_eq!(report.ignored, 1);
    assert_eq!(report.peers, 0);
    assert_eq!(report.received_by_kind.get(&Kind::Unknown), Some(&1));

    endpoint
        .send(caller.message(Payload::Metrics { report: None }))
        .unwrap();
    let reply = caller.expect(Kind::Metrics).await;
    assert_matches!(reply.payload(), Payload::Metrics { report: Some(_) });
}

#[test_log::test(tokio::test)]
async fn test_name_drop_greets_new_dependency() {
    let system = test_system(fast_config());
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 1),
        false,
        vec![],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut store = Probe::new("us-east-1.store.3");
    endpoint
        .send(Message::anonymous(Payload::NameDrop {
            service: "store".into(),
            peer: store.endpoint(),
        }))
        .unwrap();
    store.expect(Kind::Hello).await;
    assert_eq!(endpoint.inspect().await.unwrap().peers, 1);
}

#[test_log::test(tokio::test)]
async fn test_stop_answers_pending_requests_degraded() {
    let system = test_system(fast_config());
    let mut store = Probe::new("us-east-1.store.0");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api")
            .depends_on("store", 1)
            .timeout(Duration::from_secs(30)),
        false,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    let mut caller = Probe::new("us-east-1.web.0");
    endpoint
        .send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();
    store.expect(Kind::GetRequest).await;

    endpoint.stop();
    let response = caller.expect(Kind::GetResponse).await;
    assert_matches!(response.payload(), Payload::GetResponse { degraded: true, .. });
}

#[test]
fn test_new_node_takes_timeout_from_config() {
    let config = Arc::new(fast_config());
    let spec = NodeSpec {
        name: name("us-east-1.api.0"),
        service: Arc::new(ServiceDefinition::new("api")),
        entry: false,
        config,
    };
    let a = MeshNode::new(&spec);
    let b = MeshNode::new(&spec);
    assert_eq!(spec.seed(), spec.seed());
    assert_eq!(a.timeout, b.timeout);
    assert_eq!(a.timeout, Duration::from_millis(100));
    assert_eq!(a.setting("color"), None);
}

#[test_log::test(tokio::test)]
async fn test_inform_changes_settings() {
    let system = test_system(crate::config::SimConfig {
        fanout_timeout: Duration::from_secs(30),
        ..fast_config()
    });
    let mut store = Probe::new("us-east-1.store.0");
    let node = spawn_node(
        &system,
        "us-east-1.api.0",
        ServiceDefinition::new("api").depends_on("store", 1),
        false,
        vec![store.endpoint()],
    );
    let endpoint = node.endpoint();
    assert!(node.ready().await);

    endpoint
        .send(Message::anonymous(Payload::Inform {
            key: "timeout".into(),
            value: "10ms".into(),
        }))
        .unwrap();

    let mut caller = Probe::new("us-east-1.web.0");
    let started = std::time::Instant::now();
    endpoint
        .send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();
    store.expect(Kind::GetRequest).await;
    let response = caller.expect(Kind::GetResponse).await;
    assert_matches!(response.payload(), Payload::GetResponse { degraded: true, .. });
    assert!(started.elapsed() < Duration::from_secs(5));
}
