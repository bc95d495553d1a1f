use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::actor::{Lifecycle, LifecycleCell, Timer};
use crate::config::SimConfig;
use crate::endpoint::Endpoint;
use crate::metrics::{ActorStats, LatencyHistogram};
use crate::path::{ActorPath, InstanceName};
use crate::protocol::{Kind, Message, Payload, TraceContext};
use crate::recorder::{FlowRecord, FlowSink};
use crate::registry::{Listing, Registry};

/// An actor's local view of the registry: known peers keyed by service name.
#[derive(Debug, Default, Clone)]
pub struct Peers {
    by_service: BTreeMap<String, Vec<Endpoint>>,
}

impl Peers {
    /// Add a peer under its own service name. Returns whether it was new.
    pub fn insert(&mut self, peer: Endpoint) -> bool {
        let known = self.by_service.entry(peer.service().to_string()).or_default();
        if known.contains(&peer) {
            return false;
        }
        known.push(peer);
        true
    }

    /// Drop every peer with the given instance name.
    pub fn remove(&mut self, name: &InstanceName) -> Vec<Endpoint> {
        let Some(known) = self.by_service.get_mut(name.service()) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) =
            known.drain(..).partition(|peer| peer.name() == name);
        *known = kept;
        removed
    }

    /// Replace the peers of `service`, returning the ones not known before.
    pub fn replace(&mut self, service: &str, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        let previous = self.by_service.insert(service.to_string(), endpoints.clone());
        let previous = previous.unwrap_or_default();
        endpoints
            .into_iter()
            .filter(|peer| !previous.contains(peer))
            .collect()
    }

    /// Drop peers whose actors have stopped accepting messages.
    pub fn prune_closed(&mut self, service: &str) {
        if let Some(known) = self.by_service.get_mut(service) {
            known.retain(|peer| !peer.is_closed());
        }
    }

    pub fn of(&self, service: &str) -> &[Endpoint] {
        self.by_service
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, peer: &Endpoint) -> bool {
        self.of(peer.service()).contains(peer)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.by_service.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.by_service.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_service.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    received: u64,
    dropped: u64,
    ignored: u64,
    completed: u64,
    degraded: u64,
    originated: u64,
    received_by_kind: BTreeMap<Kind, u64>,
}

/// The runtime state of one actor, handed to it on every callback.
///
/// The context gives actors access to:
/// - Their own name and endpoint
/// - Their peer view, refreshed from the registry
/// - Message sending, with counting, message logging and flow capture
/// - Timers that fire on the actor's own execution unit
pub struct Context {
    name: InstanceName,
    endpoint: Endpoint,
    registry: Registry,
    config: Arc<SimConfig>,
    sink: FlowSink,
    cancellation: CancellationToken,
    lifecycle: LifecycleCell,
    peers: Peers,
    forgotten: HashSet<ActorPath>,
    watch: Vec<String>,
    counters: Counters,
    latency: LatencyHistogram,
    end_to_end: LatencyHistogram,
    timers: DelayQueue<Timer>,
    flows: Vec<FlowRecord>,
}

impl Context {
    pub(crate) fn new(
        endpoint: Endpoint,
        registry: Registry,
        config: Arc<SimConfig>,
        sink: FlowSink,
        cancellation: CancellationToken,
        lifecycle: LifecycleCell,
    ) -> Self {
        Context {
            name: endpoint.name().clone(),
            endpoint,
            registry,
            config,
            sink,
            cancellation,
            lifecycle,
            peers: Peers::default(),
            forgotten: HashSet::new(),
            watch: Vec::new(),
            counters: Counters::default(),
            latency: LatencyHistogram::new(),
            end_to_end: LatencyHistogram::new(),
            timers: DelayQueue::new(),
            flows: Vec::new(),
        }
    }

    pub fn name(&self) -> &InstanceName {
        &self.name
    }

    pub fn service(&self) -> &str {
        self.name.service()
    }

    /// Access the actor's endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn is_draining(&self) -> bool {
        self.lifecycle.get() >= Lifecycle::Draining
    }

    pub(crate) fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.set(state);
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Services whose registry listing this actor follows.
    pub fn watched(&self) -> &[String] {
        &self.watch
    }

    pub(crate) fn set_watched(&mut self, services: Vec<String>) {
        self.watch = services;
    }

    /// Learn about a peer. Returns whether it was new.
    pub fn add_peer(&mut self, peer: Endpoint) -> bool {
        if peer == self.endpoint {
            return false;
        }
        self.forgotten.remove(peer.path());
        self.peers.insert(peer)
    }

    /// Forget a peer; registry refreshes will not bring it back.
    pub fn forget_peer(&mut self, name: &InstanceName) -> bool {
        let removed = self.peers.remove(name);
        for peer in &removed {
            self.forgotten.insert(peer.path().clone());
        }
        !removed.is_empty()
    }

    /// Refresh watched services from the registry right now.
    pub fn refresh_peers(&mut self) -> Vec<Endpoint> {
        let listings = self.registry.lookup_many(&self.watch);
        self.apply_listings(listings)
    }

    /// Merge registry listings into the peer view, returning newly learned peers.
    ///
    /// Only peers in this actor's region are taken. An empty listing is treated
    /// as a transient miss: the current view is kept, minus peers that have stopped.
    pub(crate) fn apply_listings(&mut self, listings: Vec<Listing>) -> Vec<Endpoint> {
        let mut added = Vec::new();
        for listing in listings {
            let endpoints: Vec<_> = listing
                .endpoints
                .into_iter()
                .filter(|peer| {
                    *peer != self.endpoint
                        && peer.name().region() == self.name.region()
                        && !self.forgotten.contains(peer.path())
                })
                .collect();
            if endpoints.is_empty() {
                self.peers.prune_closed(&listing.service);
                continue;
            }
            added.extend(self.peers.replace(&listing.service, endpoints));
        }
        added
    }

    /// Send a protocol message stamped with this actor as the sender.
    ///
    /// Returns `false` when the destination has already stopped; the message is
    /// dropped and counted, never surfaced as an error.
    pub fn send(&mut self, to: &Endpoint, payload: Payload, trace: Option<TraceContext>) -> bool {
        if self.lifecycle.get() == Lifecycle::Stopped {
            return false;
        }
        let message = Message::new(Some(self.endpoint.clone()), trace, payload);
        let kind = message.kind();
        let duration = message.duration();

        if self.config.msglog {
            tracing::info!(target: "meshsim::msglog", from=%self.name, to=%to.name(), %kind, "message");
        }

        if to.send(message).is_err() {
            self.counters.dropped += 1;
            tracing::trace!(from=%self.name, to=%to.name(), %kind, "destination stopped, message dropped");
            return false;
        }

        self.counters.sent += 1;
        if self.sink.is_enabled() {
            let (source, dest) = if self.config.filter {
                (self.name.service().to_string(), to.service().to_string())
            } else {
                (self.name.to_string(), to.name().to_string())
            };
            self.flows.push(FlowRecord {
                source,
                dest,
                kind,
                timestamp: chrono::Utc::now(),
                duration,
                trace,
            });
        }
        true
    }

    /// Schedule `timer` to fire on this actor after `delay`.
    pub fn schedule(&mut self, timer: Timer, delay: Duration) -> delay_queue::Key {
        self.timers.insert(timer, delay)
    }

    /// Cancel a scheduled timer. Cancelling a fired timer is a no-op.
    pub fn cancel_timer(&mut self, key: &delay_queue::Key) {
        let _ = self.timers.try_remove(key);
    }

    pub(crate) async fn next_timer(&mut self) -> Option<Timer> {
        self.timers.next().await.map(|expired| expired.into_inner())
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latency.record(latency);
    }

    /// Record how long a request this actor originated took to finish.
    pub fn record_end_to_end(&mut self, latency: Duration) {
        self.end_to_end.record(latency);
    }

    /// Count a request this actor has answered.
    pub fn note_completed(&mut self, degraded: bool) {
        if degraded {
            self.counters.degraded += 1;
        } else {
            self.counters.completed += 1;
        }
    }

    pub fn note_originated(&mut self) {
        self.counters.originated += 1;
    }

    pub(crate) fn note_received(&mut self, kind: Kind) {
        self.counters.received += 1;
        *self.counters.received_by_kind.entry(kind).or_default() += 1;
    }

    /// Count a message this actor chose not to act on.
    pub fn note_ignored(&mut self) {
        self.counters.ignored += 1;
    }

    /// Hand buffered flow records to the recorder.
    pub(crate) async fn flush_flows(&mut self) {
        if self.flows.is_empty() {
            return;
        }
        let flows = std::mem::take(&mut self.flows);
        self.sink.emit_all(flows).await;
    }

    /// Current counters of this actor.
    pub fn stats(&self, in_flight: usize) -> ActorStats {
        ActorStats {
            name: self.name.to_string(),
            service: self.name.service().to_string(),
            state: self.lifecycle.get(),
            sent: self.counters.sent,
            received: self.counters.received,
            dropped: self.counters.dropped,
            ignored: self.counters.ignored,
            in_flight,
            completed: self.counters.completed,
            degraded: self.counters.degraded,
            originated: self.counters.originated,
            peers: self.peers.len(),
            received_by_kind: self.counters.received_by_kind.clone(),
            latency: self.latency.clone(),
            end_to_end: self.end_to_end.clone(),
        }
    }
}
