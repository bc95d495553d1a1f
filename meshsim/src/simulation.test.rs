use std::collections::{BTreeSet, HashMap};

use assert_matches::assert_matches;

use super::*;
use crate::actor::{Actor, async_trait};
use crate::architecture::ServiceDefinition;
use crate::config::OverflowPolicy;
use crate::context::Context;
use crate::node::NodeSpec;
use crate::test_utils::{Probe, fast_config, name};

fn scenario_config() -> SimConfig {
    SimConfig {
        duration: Duration::from_millis(300),
        collect: true,
        ..fast_config()
    }
}

fn a_to_b() -> ArchitectureDefinition {
    ArchitectureDefinition::new("ab")
        .service(ServiceDefinition::new("a").depends_on("b", 1))
        .service(ServiceDefinition::new("b"))
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[test_log::test(tokio::test)]
async fn test_a_to_b_records_request_response() {
    let simulation = Simulation::new(scenario_config()).unwrap();
    let report = simulation.run(&a_to_b()).await.unwrap();

    assert_eq!(report.spawned, 2);
    assert_eq!(report.stopped, 2);
    assert!(report.is_complete());
    assert!(report.edge_count("a", "b", Kind::GetRequest) >= 1);
    assert!(report.edge_count("b", "a", Kind::GetResponse) >= 1);

    let edge = report
        .graph
        .edges
        .iter()
        .find(|edge| edge.source == "us-east-1.a.0" && edge.dest == "us-east-1.b.0")
        .unwrap();
    assert!(edge.count >= 1);
    assert_eq!(report.graph.nodes, vec!["us-east-1.a.0", "us-east-1.b.0"]);

    for stats in &report.actors {
        assert_eq!(stats.state, Lifecycle::Stopped);
    }
    assert_eq!(report.snapshot.records.len() as u64, report.total_sent());
    assert!(report.snapshot.latency.contains_key(&Kind::GetResponse));
}

#[test_log::test(tokio::test)]
async fn test_shutdown_leaves_nothing_running() {
    let simulation = Simulation::new(scenario_config()).unwrap();
    let running = simulation.start(&a_to_b()).await.unwrap();
    assert_eq!(running.lifecycle_counts().get(&Lifecycle::Running), Some(&2));
    let system = running.system().clone();

    let report = running.shutdown().await;
    let counts = system.lifecycle_counts();
    assert_eq!(counts.get(&Lifecycle::Running), None);
    assert_eq!(counts.get(&Lifecycle::Draining), None);
    assert_eq!(counts.get(&Lifecycle::Stopped), Some(&2));
    assert!(system.registry().is_empty());
    assert_eq!(report.unfinished, Vec::<String>::new());
}

#[test_log::test(tokio::test)]
async fn test_population_scale_spawns_distinct_instances() {
    let config = SimConfig {
        population: 300,
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let definition = ArchitectureDefinition::new("solo").service(ServiceDefinition::new("solo"));
    let running = simulation.start(&definition).await.unwrap();

    let registered = running.registry().lookup("solo");
    assert_eq!(registered.len(), 3);
    let paths: BTreeSet<_> = registered.iter().map(|e| e.path().clone()).collect();
    assert_eq!(paths.len(), 3);
    assert_eq!(
        running.topology().names(),
        vec!["us-east-1.solo.0", "us-east-1.solo.1", "us-east-1.solo.2"]
    );

    let report = running.shutdown().await;
    assert_eq!(report.spawned, 3);
}

#[test_log::test(tokio::test)]
async fn test_regions_replicate_every_service() {
    let config = SimConfig {
        regions: Some(3),
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let running = simulation.start(&a_to_b()).await.unwrap();
    assert_eq!(running.registry().lookup("a").len(), 3);
    assert_eq!(running.registry().lookup("b").len(), 3);
    running.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_stopped_downstream_yields_degraded_response() {
    let config = SimConfig {
        request_interval: Duration::from_secs(60),
        fanout_timeout: Duration::from_millis(200),
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let running = simulation.start(&a_to_b()).await.unwrap();

    let b = name("us-east-1.b.0");
    running.stop_instance(&b).unwrap();
    let b_endpoint = running.topology().endpoint(&b).unwrap().clone();
    assert!(wait_for(|| b_endpoint.is_closed()).await);

    let mut caller = Probe::new("us-east-1.client.0");
    let a = running.topology().endpoint(&name("us-east-1.a.0")).unwrap().clone();
    let started = std::time::Instant::now();
    a.send(caller.message(Payload::GetRequest { key: "k".into() }))
        .unwrap();

    let response = caller.expect(Kind::GetResponse).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_matches!(response.payload(), Payload::GetResponse { degraded: true, .. });
    running.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_stopped_downstream_shows_in_caller_stats() {
    let config = SimConfig {
        request_interval: Duration::from_millis(20),
        fanout_timeout: Duration::from_millis(30),
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let running = simulation.start(&a_to_b()).await.unwrap();
    running.stop_instance(&name("us-east-1.b.0")).unwrap();

    let report = running.run_for(Duration::from_millis(300)).await;
    let a = report
        .actors
        .iter()
        .find(|stats| stats.name == "us-east-1.a.0")
        .unwrap();
    assert!(a.degraded > 0);
    assert!(a.originated >= a.completed + a.degraded);
    assert_eq!(a.end_to_end.count(), a.completed + a.degraded);
}

#[test_log::test(tokio::test)]
async fn test_region_replicas_stay_in_their_region() {
    let config = SimConfig {
        regions: Some(2),
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let report = simulation.run(&a_to_b()).await.unwrap();

    assert!(!report.graph.edges.is_empty());
    for edge in &report.graph.edges {
        let source: InstanceName = edge.source.parse().unwrap();
        let dest: InstanceName = edge.dest.parse().unwrap();
        assert_eq!(source.region(), dest.region(), "{} -> {}", edge.source, edge.dest);
    }
    for region in ["us-east-1", "us-west-2"] {
        let caller = format!("{region}.a.0");
        let callee = format!("{region}.b.0");
        assert!(
            report
                .graph
                .edges
                .iter()
                .any(|edge| edge.source == caller && edge.dest == callee),
            "no calls inside {region}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn test_stop_instance_is_idempotent() {
    let simulation = Simulation::new(scenario_config()).unwrap();
    let running = simulation.start(&a_to_b()).await.unwrap();
    let b = name("us-east-1.b.0");

    running.stop_instance(&b).unwrap();
    running.stop_instance(&b).unwrap();
    let system = running.system().clone();
    assert!(wait_for(|| system.lifecycle_counts().get(&Lifecycle::Stopped) == Some(&1)).await);
    running.stop_instance(&b).unwrap();
    assert!(running.registry().lookup("b").is_empty());

    assert_matches!(
        running.stop_instance(&name("us-east-1.ghost.0")),
        Err(SimulationError::UnknownInstance(_))
    );

    let report = running.shutdown().await;
    assert_eq!(report.stopped, 2);
    let b_stats = report.actors.iter().find(|s| s.name == "us-east-1.b.0").unwrap();
    assert!(b_stats.received_by_kind.get(&Kind::Stop).copied().unwrap_or_default() >= 1);
    assert_eq!(b_stats.state, Lifecycle::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_malformed_definition_aborts_before_spawn() {
    let simulation = Simulation::new(scenario_config()).unwrap();
    let definition = ArchitectureDefinition::new("broken")
        .service(ServiceDefinition::new("a").depends_on("nowhere", 1));
    assert_matches!(
        simulation.start(&definition).await.err(),
        Some(SimulationError::Architecture(ArchitectureError::UnknownService { service, from }))
            if service == "nowhere" && from == "a"
    );

    let definition = ArchitectureDefinition::new("zero").service(ServiceDefinition::new("a").count(0));
    assert_matches!(
        simulation.run(&definition).await,
        Err(SimulationError::Architecture(ArchitectureError::ZeroCount(_)))
    );

    let config = SimConfig {
        population: 0,
        ..scenario_config()
    };
    assert_matches!(
        Simulation::new(config).err(),
        Some(SimulationError::Config(ConfigError::ZeroPopulation))
    );
}

#[test_log::test(tokio::test)]
async fn test_reload_rebuilds_exported_mesh() {
    let config = SimConfig {
        regions: Some(2),
        ..scenario_config()
    };
    let simulation = Simulation::new(config).unwrap();
    let report = simulation.run(&a_to_b()).await.unwrap();
    let json = report.graph.to_json().unwrap();

    let graph = ExportedGraph::from_json(&json).unwrap();
    let reloaded = simulation.reload(&graph).await.unwrap();
    assert_eq!(reloaded.spawned, 4);
    assert_eq!(reloaded.graph.nodes, report.graph.nodes);
    assert!(reloaded.edge_count("a", "b", Kind::GetRequest) >= 1);
    assert!(reloaded.is_complete());
}

#[test_log::test(tokio::test)]
async fn test_filtered_flows_use_service_names() {
    let config = SimConfig {
        filter: true,
        ..scenario_config()
    };
    let report = Simulation::new(config).unwrap().run(&a_to_b()).await.unwrap();
    let edge = report.snapshot.edge("a", "b").unwrap();
    assert!(edge.count_of(Kind::GetRequest) >= 1);
    assert!(report.snapshot.records.iter().all(|r| !r.source.contains('.')));
}

#[test_log::test(tokio::test)]
async fn test_drop_oldest_accounts_for_every_flow() {
    let config = SimConfig {
        flow_capacity: 1,
        overflow: OverflowPolicy::DropOldest,
        request_interval: Duration::from_millis(1),
        ..scenario_config()
    };
    let report = Simulation::new(config).unwrap().run(&a_to_b()).await.unwrap();
    assert_eq!(
        report.snapshot.records.len() as u64 + report.snapshot.dropped,
        report.total_sent()
    );
}

#[test_log::test(tokio::test)]
async fn test_disabled_collection_records_nothing() {
    let config = SimConfig {
        collect: false,
        ..scenario_config()
    };
    let report = Simulation::new(config).unwrap().run(&a_to_b()).await.unwrap();
    assert!(report.snapshot.records.is_empty());
    assert!(report.total_sent() > 0);
    assert!(report.is_complete());
}

#[test_log::test(tokio::test)]
async fn test_live_pulls_and_inform() {
    let simulation = Simulation::new(scenario_config()).unwrap();
    let mut running = simulation.start(&a_to_b()).await.unwrap();

    let a = name("us-east-1.a.0");
    running.inform(&a, "chat", "5ms").unwrap();
    assert_eq!(running.inform_all("color", "blue"), 2);
    assert_matches!(
        running.inform(&name("us-east-1.ghost.0"), "chat", "5ms"),
        Err(SimulationError::UnknownInstance(_))
    );

    assert!(wait_for(|| !running.snapshot().records.is_empty()).await);
    let stats = running.actor_stats().await;
    assert_eq!(stats.len(), 2);

    let added = running.scale_out("b", "us-east-1").await.unwrap();
    assert_eq!(added.name().to_string(), "us-east-1.b.1");
    assert_eq!(running.registry().lookup("b").len(), 2);

    let report = running.shutdown().await;
    assert_eq!(report.spawned, 3);
    assert!(report.graph.nodes.contains(&"us-east-1.b.1".to_string()));
}

/// Sends a numbered burst of chats to every known `tally` instance on start.
struct Burst;

const BURST: u64 = 200;

#[async_trait]
impl Actor for Burst {
    async fn started(&mut self, ctx: &mut Context) {
        let targets: Vec<_> = ctx.peers().of("tally").to_vec();
        for seq in 0..BURST {
            for target in &targets {
                ctx.send(target, Payload::Chat { text: seq.to_string() }, None);
            }
        }
    }

    async fn handle(&mut self, _ctx: &mut Context, _message: Message) {}
}

/// Counts chats that arrive out of order per sender as ignored.
#[derive(Default)]
struct Tally {
    last: HashMap<String, u64>,
}

#[async_trait]
impl Actor for Tally {
    async fn handle(&mut self, ctx: &mut Context, message: Message) {
        let (Some(sender), Payload::Chat { text }) = (message.sender(), message.payload()) else {
            return;
        };
        let Ok(seq) = text.parse::<u64>() else {
            ctx.note_ignored();
            return;
        };
        let expected = self.last.get(&sender.name().to_string()).map_or(0, |last| last + 1);
        if seq != expected {
            ctx.note_ignored();
        }
        self.last.insert(sender.name().to_string(), seq);
    }
}

#[test_log::test(tokio::test)]
async fn test_fifo_per_sender_under_concurrent_load() {
    let catalog = Catalog::default()
        .with("burst", |_: &NodeSpec| Box::new(Burst) as Box<dyn Actor>)
        .with("tally", |_: &NodeSpec| Box::<Tally>::default() as Box<dyn Actor>);
    let definition = ArchitectureDefinition::new("fifo")
        .service(
            ServiceDefinition::new("burst")
                .package("burst")
                .count(8)
                .depends_on("tally", 1),
        )
        .service(ServiceDefinition::new("tally").package("tally"));
    let simulation = Simulation::new(scenario_config())
        .unwrap()
        .with_catalog(catalog);
    let running = simulation.start(&definition).await.unwrap();

    let tally = running.topology().endpoint(&name("us-east-1.tally.0")).unwrap().clone();
    let mut chats = 0;
    for _ in 0..200 {
        let stats = tally.inspect().await.unwrap();
        chats = stats.received_by_kind.get(&Kind::Chat).copied().unwrap_or_default();
        if chats == 8 * BURST {
            assert_eq!(stats.ignored, 0);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(chats, 8 * BURST);
    running.shutdown().await;
}
