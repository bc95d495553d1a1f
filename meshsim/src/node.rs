//! The standard service behaviour every architecture instance runs by default.
//!
//! A [`MeshNode`] answers `GetRequest`s after a simulated processing delay,
//! fanning them out to its dependencies first when it has any, and degrades
//! gracefully when sub-requests do not come back in time.
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tokio_util::time::delay_queue;

use crate::actor::{Actor, Timer, async_trait};
use crate::architecture::{EdgeDefinition, LatencyModel, ServiceDefinition};
use crate::config::{DegradedReply, SimConfig, parse_degraded, parse_duration};
use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::id::Id;
use crate::path::InstanceName;
use crate::protocol::{Message, Payload, TraceContext};

#[cfg(test)]
#[path = "node.test.rs"]
mod tests;

/// Everything a catalog factory needs to build the actor for one instance.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: InstanceName,
    pub service: Arc<ServiceDefinition>,
    /// Whether the instance originates requests.
    pub entry: bool,
    pub config: Arc<SimConfig>,
}

impl NodeSpec {
    /// A per-instance seed: stable for a given run seed and instance name.
    pub fn seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.to_string().hash(&mut hasher);
        self.config.seed ^ hasher.finish()
    }
}

/// A request this node is serving or originated.
struct Pending {
    /// Who gets the response. `None` for requests this node originated.
    caller: Option<Endpoint>,
    trace: TraceContext,
    key: String,
    received_at: Instant,
    expected: u32,
    answered: u32,
    value: Option<String>,
    expiry: Option<delay_queue::Key>,
}

/// A sub-request this node fanned out.
struct Outstanding {
    parent: Id,
    sent_at: Instant,
}

pub struct MeshNode {
    dependencies: Vec<EdgeDefinition>,
    entry: bool,
    latency: LatencyModel,
    timeout: Duration,
    degraded: DegradedReply,
    request_interval: Duration,
    originate_timer: Option<delay_queue::Key>,
    rng: ChaCha8Rng,
    pending: HashMap<Id, Pending>,
    outstanding: HashMap<Id, Outstanding>,
    store: HashMap<String, String>,
    overrides: BTreeMap<String, String>,
    originated: u64,
}

impl MeshNode {
    pub fn new(spec: &NodeSpec) -> Self {
        let timeout = spec
            .service
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(spec.config.fanout_timeout);
        Self {
            dependencies: spec.service.dependencies.clone(),
            entry: spec.entry,
            latency: spec.service.latency.clone(),
            timeout,
            degraded: spec.config.degraded,
            request_interval: spec.config.request_interval,
            originate_timer: None,
            rng: ChaCha8Rng::seed_from_u64(spec.seed()),
            pending: HashMap::new(),
            outstanding: HashMap::new(),
            store: HashMap::new(),
            overrides: spec.config.keyvals.clone(),
            originated: 0,
        }
    }

    /// Stored value for `key`, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.store.get(key).map(String::as_str)
    }

    /// The latest value set for a free-form key, through config or `Inform`.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Requests this node originated so far.
    pub fn originated(&self) -> u64 {
        self.originated
    }

    fn is_dependency(&self, service: &str) -> bool {
        self.dependencies.iter().any(|edge| edge.service == service)
    }

    /// Up to `fanout` randomly chosen known peers for every dependency edge.
    fn pick_targets(&mut self, ctx: &Context) -> Vec<Endpoint> {
        let mut targets = Vec::new();
        for edge in &self.dependencies {
            let known = ctx.peers().of(&edge.service);
            targets.extend(known.choose_multiple(&mut self.rng, edge.fanout).cloned());
        }
        targets
    }

    fn greet(&self, ctx: &mut Context, peers: &[Endpoint]) {
        let name = ctx.name().clone();
        for peer in peers {
            if self.is_dependency(peer.service()) {
                ctx.send(peer, Payload::Hello { name: name.clone() }, None);
            }
        }
    }

    fn schedule_originate(&mut self, ctx: &mut Context) {
        if let Some(key) = self.originate_timer.take() {
            ctx.cancel_timer(&key);
        }
        self.originate_timer = Some(ctx.schedule(Timer::Originate, self.request_interval));
    }

    fn accept(&mut self, ctx: &mut Context, caller: Option<Endpoint>, trace: TraceContext, key: String) {
        let span = trace.span;
        let delay = self.latency.sample(&mut self.rng);
        self.pending.insert(
            span,
            Pending {
                caller,
                trace,
                key,
                received_at: Instant::now(),
                expected: 0,
                answered: 0,
                value: None,
                expiry: None,
            },
        );
        ctx.schedule(Timer::Process(span), delay);
    }

    /// Processing finished: answer directly or fan out and wait.
    fn process(&mut self, ctx: &mut Context, span: Id) {
        if !self.pending.contains_key(&span) {
            return;
        }
        if self.dependencies.is_empty() {
            let value = self.local_value(ctx, span);
            self.complete(ctx, span, value, false);
            return;
        }

        let targets = self.pick_targets(ctx);
        let Some(pending) = self.pending.get(&span) else {
            return;
        };
        let (trace, key) = (pending.trace, pending.key.clone());

        let mut expected = 0;
        for target in &targets {
            let child = trace.child();
            self.outstanding.insert(
                child.span,
                Outstanding {
                    parent: span,
                    sent_at: Instant::now(),
                },
            );
            // A stopped target stays outstanding and is settled by the expiry timer.
            ctx.send(target, Payload::GetRequest { key: key.clone() }, Some(child));
            expected += 1;
        }

        if expected == 0 {
            tracing::debug!(%key, "no known peers for any dependency, replying degraded");
            self.complete(ctx, span, None, true);
            return;
        }

        let expiry = ctx.schedule(Timer::Expire(span), self.timeout);
        if let Some(pending) = self.pending.get_mut(&span) {
            pending.expected = expected;
            pending.expiry = Some(expiry);
        }
    }

    fn local_value(&self, ctx: &Context, span: Id) -> Option<String> {
        let key = &self.pending.get(&span)?.key;
        Some(
            self.store
                .get(key)
                .cloned()
                .unwrap_or_else(|| ctx.name().to_string()),
        )
    }

    fn collect(&mut self, ctx: &mut Context, trace: Option<TraceContext>, value: Option<String>) {
        let Some(trace) = trace else {
            ctx.note_ignored();
            return;
        };
        let Some(outstanding) = self.outstanding.remove(&trace.span) else {
            tracing::trace!(span=%trace.span, "late response discarded");
            return;
        };
        ctx.record_latency(outstanding.sent_at.elapsed());

        let parent = outstanding.parent;
        let Some(pending) = self.pending.get_mut(&parent) else {
            return;
        };
        pending.answered += 1;
        if pending.value.is_none() {
            pending.value = value;
        }
        if pending.answered >= pending.expected {
            let value = pending.value.take();
            self.complete(ctx, parent, value, false);
        }
    }

    fn expire(&mut self, ctx: &mut Context, span: Id) {
        let Some(pending) = self.pending.get_mut(&span) else {
            return;
        };
        pending.expiry = None;
        tracing::debug!(
            key = %pending.key,
            answered = pending.answered,
            expected = pending.expected,
            "fan-out timed out, replying degraded"
        );
        let value = match self.degraded {
            DegradedReply::Partial => pending.value.take(),
            DegradedReply::Empty => None,
        };
        self.complete(ctx, span, value, true);
    }

    fn complete(&mut self, ctx: &mut Context, span: Id, value: Option<String>, degraded: bool) {
        let Some(pending) = self.pending.remove(&span) else {
            return;
        };
        if let Some(expiry) = &pending.expiry {
            ctx.cancel_timer(expiry);
        }
        self.outstanding.retain(|_, outstanding| outstanding.parent != span);
        ctx.note_completed(degraded);

        let Some(caller) = pending.caller else {
            ctx.record_end_to_end(pending.received_at.elapsed());
            tracing::trace!(key = %pending.key, degraded, elapsed = ?pending.received_at.elapsed(), "request completed");
            return;
        };
        let response = Payload::GetResponse {
            key: pending.key,
            value,
            degraded,
            answered: pending.answered,
            expected: pending.expected,
            elapsed: pending.received_at.elapsed(),
        };
        ctx.send(&caller, response, Some(pending.trace));
    }

    fn originate(&mut self, ctx: &mut Context) {
        self.originate_timer = None;
        if ctx.is_draining() {
            return;
        }
        self.originated += 1;
        ctx.note_originated();
        let key = format!("{}-{}", ctx.name(), self.originated);
        self.accept(ctx, None, TraceContext::root(), key);
        self.schedule_originate(ctx);
    }

    fn put(&mut self, ctx: &mut Context, key: String, value: String, trace: Option<TraceContext>) {
        if self.store.get(&key) == Some(&value) {
            return;
        }
        self.store.insert(key.clone(), value.clone());
        for target in self.pick_targets(ctx) {
            let child = trace.map(|trace| trace.child());
            ctx.send(
                &target,
                Payload::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
                child,
            );
        }
    }

    fn inform(&mut self, ctx: &mut Context, key: String, value: String) {
        match key.as_str() {
            "chat" => match parse_duration(&value) {
                Some(interval) if !interval.is_zero() => {
                    self.request_interval = interval;
                    if self.entry && self.originate_timer.is_some() {
                        self.schedule_originate(ctx);
                    }
                }
                _ => tracing::warn!(%key, %value, "invalid request interval"),
            },
            "timeout" => match parse_duration(&value) {
                Some(timeout) => self.timeout = timeout,
                None => tracing::warn!(%key, %value, "invalid timeout"),
            },
            "degraded" => match parse_degraded(&key, &value) {
                Ok(degraded) => self.degraded = degraded,
                Err(err) => tracing::warn!(%err, "invalid degraded reply mode"),
            },
            "latency" => match parse_duration(&value) {
                Some(latency) => {
                    self.latency = LatencyModel::Fixed {
                        ms: latency.as_millis() as u64,
                    }
                }
                None => tracing::warn!(%key, %value, "invalid latency"),
            },
            _ => {}
        }
        self.overrides.insert(key, value);
    }

    fn reply_stats(&self, ctx: &mut Context, sender: Option<Endpoint>) {
        let Some(sender) = sender else {
            return;
        };
        let report = ctx.stats(self.pending.len());
        ctx.send(
            &sender,
            Payload::Metrics {
                report: Some(Box::new(report)),
            },
            None,
        );
    }
}

#[async_trait]
impl Actor for MeshNode {
    async fn started(&mut self, ctx: &mut Context) {
        let peers: Vec<_> = ctx.peers().iter().cloned().collect();
        self.greet(ctx, &peers);
        if self.entry && !self.dependencies.is_empty() {
            self.schedule_originate(ctx);
        }
    }

    async fn handle(&mut self, ctx: &mut Context, message: Message) {
        let (sender, trace, payload) = message.into_parts();
        match payload {
            Payload::Hello { name } => {
                if let Some(sender) = sender {
                    tracing::trace!(peer = %name, "hello");
                    ctx.add_peer(sender);
                }
            }
            Payload::NameDrop { service, peer } => {
                if ctx.add_peer(peer.clone()) && self.is_dependency(&service) {
                    self.greet(ctx, &[peer]);
                }
            }
            Payload::Inform { key, value } => self.inform(ctx, key, value),
            Payload::GetRequest { key } if ctx.is_draining() => {
                if let Some(sender) = sender {
                    ctx.note_completed(true);
                    let response = Payload::GetResponse {
                        key,
                        value: None,
                        degraded: true,
                        answered: 0,
                        expected: 0,
                        elapsed: Duration::ZERO,
                    };
                    ctx.send(&sender, response, trace);
                }
            }
            Payload::GetRequest { key } => {
                let trace = trace.unwrap_or_else(TraceContext::root);
                self.accept(ctx, sender, trace, key);
            }
            Payload::GetResponse { value, .. } => self.collect(ctx, trace, value),
            Payload::Put { key, value } => self.put(ctx, key, value, trace),
            Payload::Replicate { key, value } => {
                self.store.insert(key, value);
            }
            Payload::Chat { text } => {
                tracing::debug!(%text, "chat");
                let added = ctx.refresh_peers();
                self.greet(ctx, &added);
            }
            Payload::Forget { name } => {
                if ctx.forget_peer(&name) {
                    tracing::debug!(peer = %name, "forgot peer");
                }
            }
            Payload::GoroutineCount | Payload::Metrics { report: None } => {
                self.reply_stats(ctx, sender);
            }
            Payload::Metrics { report: Some(report) } => {
                tracing::debug!(from = %report.name, received = report.received, "metrics report");
            }
            Payload::Stop => {}
            Payload::Unknown { kind } => {
                tracing::warn!(%kind, "ignoring message of unknown kind");
                ctx.note_ignored();
            }
        }
    }

    async fn timer(&mut self, ctx: &mut Context, timer: Timer) {
        match timer {
            Timer::Process(span) => self.process(ctx, span),
            Timer::Expire(span) => self.expire(ctx, span),
            Timer::Originate => self.originate(ctx),
            Timer::Custom(_) => {}
        }
    }

    async fn discovered(&mut self, ctx: &mut Context, added: Vec<Endpoint>) {
        self.greet(ctx, &added);
    }

    async fn stopping(&mut self, ctx: &mut Context) {
        let spans: Vec<_> = self.pending.keys().copied().collect();
        for span in spans {
            let value = match self.degraded {
                DegradedReply::Partial => self.pending.get_mut(&span).and_then(|p| p.value.take()),
                DegradedReply::Empty => None,
            };
            self.complete(ctx, span, value, true);
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
