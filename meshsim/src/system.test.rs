use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::actor::async_trait;
use crate::protocol::Payload;
use crate::test_utils::{Probe, fast_config, name, test_system};

/// Replies to every `Chat` with a `Chat` carrying the same text.
struct Echo;

#[async_trait]
impl Actor for Echo {
    async fn handle(&mut self, ctx: &mut Context, message: Message) {
        let (sender, trace, payload) = message.into_parts();
        match (sender, payload) {
            (Some(sender), Payload::Chat { text }) => {
                ctx.send(&sender, Payload::Chat { text }, trace);
            }
            _ => ctx.note_ignored(),
        }
    }
}

/// Answers chats only once it starts draining.
#[derive(Default)]
struct Deferred {
    waiting: Vec<Endpoint>,
}

#[async_trait]
impl Actor for Deferred {
    async fn handle(&mut self, _ctx: &mut Context, message: Message) {
        if let Some(sender) = message.sender() {
            self.waiting.push(sender.clone());
        }
    }

    async fn stopping(&mut self, ctx: &mut Context) {
        for waiting in std::mem::take(&mut self.waiting) {
            ctx.send(&waiting, Payload::Chat { text: "late".into() }, None);
        }
    }

    fn in_flight(&self) -> usize {
        self.waiting.len()
    }
}

#[test_log::test(tokio::test)]
async fn test_spawn_registers_and_runs() {
    let system = test_system(fast_config());
    let spawned = system
        .spawn(name("us-east-1.echo.0"), Box::new(Echo), ActorSetup::default())
        .unwrap();
    let endpoint = spawned.endpoint();
    assert!(spawned.ready().await);

    assert_eq!(system.registry().lookup("echo"), vec![endpoint.clone()]);
    assert_eq!(system.lifecycle_of(&endpoint), Some(Lifecycle::Running));

    let mut probe = Probe::new("us-east-1.probe.0");
    endpoint
        .send(probe.message(Payload::Chat { text: "hi".into() }))
        .unwrap();
    let reply = probe.expect(Kind::Chat).await;
    assert_matches!(reply.payload(), Payload::Chat { text } if text == "hi");
    assert_eq!(reply.sender(), Some(&endpoint));
}

#[test_log::test(tokio::test)]
async fn test_stop_drains_and_deregisters() {
    let system = test_system(fast_config());
    let spawned = system
        .spawn(
            name("us-east-1.deferred.0"),
            Box::<Deferred>::default(),
            ActorSetup::default(),
        )
        .unwrap();
    let endpoint = spawned.endpoint();
    assert!(spawned.ready().await);

    let mut probe = Probe::new("us-east-1.probe.0");
    endpoint
        .send(probe.message(Payload::Chat { text: "q".into() }))
        .unwrap();
    // Inspection overtakes queued protocol traffic, so wait for the chat to land.
    let mut in_flight = 0;
    for _ in 0..50 {
        in_flight = endpoint.inspect().await.unwrap().in_flight;
        if in_flight == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(in_flight, 1);

    endpoint.stop();
    let reply = probe.expect(Kind::Chat).await;
    assert_matches!(reply.payload(), Payload::Chat { text } if text == "late");

    let report = system.shutdown(Duration::from_secs(1)).await;
    assert!(report.unfinished.is_empty());
    assert_eq!(report.stopped.len(), 1);
    assert_eq!(report.stopped[0].state, Lifecycle::Stopped);
    assert_eq!(report.stopped[0].sent, 1);
    assert!(system.registry().lookup("deferred").is_empty());
    assert!(endpoint.is_closed());
}

#[test_log::test(tokio::test)]
async fn test_stop_is_idempotent() {
    let system = test_system(fast_config());
    let spawned = system
        .spawn(name("us-east-1.echo.0"), Box::new(Echo), ActorSetup::default())
        .unwrap();
    let endpoint = spawned.endpoint();
    assert!(spawned.ready().await);

    endpoint.stop();
    endpoint.stop();
    let report = system.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.stopped.len(), 1);
    endpoint.stop();

    let counts = system.lifecycle_counts();
    assert_eq!(counts.get(&Lifecycle::Stopped), Some(&1));
    assert_eq!(counts.get(&Lifecycle::Running), None);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_stops_every_actor() {
    let system = test_system(fast_config());
    let mut waits = Vec::new();
    for index in 0..5 {
        let spawned = system
            .spawn(
                name(&format!("us-east-1.echo.{index}")),
                Box::new(Echo),
                ActorSetup::default(),
            )
            .unwrap();
        waits.push(spawned.ready());
    }
    for ready in waits {
        assert!(ready.await);
    }
    assert_eq!(system.registry().lookup("echo").len(), 5);
    assert_eq!(system.inspect_all().await.len(), 5);

    let report = system.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.stopped.len(), 5);
    assert!(system.registry().is_empty());
    assert!(system.endpoints().is_empty());

    assert_matches!(
        system
            .spawn(name("us-east-1.echo.9"), Box::new(Echo), ActorSetup::default())
            .err(),
        Some(SystemError::ShuttingDown(_))
    );
}

#[test_log::test(tokio::test)]
async fn test_send_to_stopped_actor_is_dropped() {
    let system = test_system(fast_config());
    let target = system
        .spawn(name("us-east-1.echo.0"), Box::new(Echo), ActorSetup::default())
        .unwrap();
    let target_endpoint = target.endpoint();
    assert!(target.ready().await);

    let mut probe = Probe::new("us-east-1.probe.0");
    let sender = system
        .spawn(
            name("us-east-1.echo.1"),
            Box::new(Echo),
            ActorSetup::default(),
        )
        .unwrap();
    let sender_endpoint = sender.endpoint();
    assert!(sender.ready().await);

    target_endpoint.stop();
    while !target_endpoint.is_closed() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Ask the sender to echo to the stopped target by impersonating it.
    let mut forged = Message::new(
        Some(target_endpoint.clone()),
        None,
        Payload::Chat { text: "x".into() },
    );
    sender_endpoint.send(forged.clone()).unwrap();
    forged = probe.message(Payload::Chat { text: "y".into() });
    sender_endpoint.send(forged).unwrap();
    probe.expect(Kind::Chat).await;

    let stats = sender_endpoint.inspect().await.unwrap();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.sent, 1);
}

#[test_log::test(tokio::test)]
async fn test_polling_discovers_peers() {
    let system = test_system(fast_config());
    let watcher = system
        .spawn(
            name("us-east-1.echo.0"),
            Box::new(Echo),
            ActorSetup {
                watch: vec!["store".into()],
                peers: Vec::new(),
            },
        )
        .unwrap();
    let watcher_endpoint = watcher.endpoint();
    assert!(watcher.ready().await);
    assert_eq!(watcher_endpoint.inspect().await.unwrap().peers, 0);

    let store = Probe::new("us-east-1.store.0");
    system.registry().register("store", &store.endpoint()).unwrap();

    let mut peers = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        peers = watcher_endpoint.inspect().await.unwrap().peers;
        if peers == 1 {
            break;
        }
    }
    assert_eq!(peers, 1);
}
