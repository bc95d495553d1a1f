//! The actor system: spawning, supervision and the shutdown barrier.
//!
//! This module contains the runtime every actor executes in, which is responsible for:
//! - Registering the actor with the name registry on start
//! - Running its message loop, timers and periodic registry polling
//! - Draining it on `Stop` or the global shutdown: deregistering, handling what
//!   is already queued, delivering in-flight responses and flushing flows
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::{Actor, Lifecycle, LifecycleCell, Timer};
use crate::config::SimConfig;
use crate::context::Context;
use crate::endpoint::{Command, Endpoint};
use crate::id::Id;
use crate::mailbox::{MailboxSender, PrioritizedMailbox};
use crate::metrics::ActorStats;
use crate::path::{ActorPath, InstanceName};
use crate::protocol::{Kind, Message};
use crate::recorder::FlowSink;
use crate::registry::{Listing, Registry, RegistryError};

#[cfg(test)]
#[path = "system.test.rs"]
mod tests;

/// Errors that can occur during actor system operations
#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    /// The system has begun shutting down and accepts no new actors.
    #[error("system is shutting down, cannot spawn {0}")]
    ShuttingDown(String),

    #[error("failed to register {name}: {source}")]
    Registration {
        name: String,
        #[source]
        source: RegistryError,
    },
}

/// What an actor knows when it starts.
#[derive(Debug, Default, Clone)]
pub struct ActorSetup {
    /// Services whose registry listings the actor follows.
    pub watch: Vec<String>,
    /// Peers known before the first registry poll.
    pub peers: Vec<Endpoint>,
}

/// The outcome of the shutdown barrier.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Final counters of every actor that reached `Stopped`.
    pub stopped: Vec<ActorStats>,
    /// Actors that did not drain within the grace period.
    pub unfinished: Vec<String>,
}

struct SupervisorEntry {
    endpoint: Endpoint,
    lifecycle: LifecycleCell,
    handle: Option<JoinHandle<ActorStats>>,
}

/// Internal state of the actor system
///
/// Maintains:
/// - Registry of all supervised actors
/// - The flow sink handed to new actors, released on shutdown
struct SystemContext {
    supervisors: HashMap<Id, SupervisorEntry>,
    sink: Option<FlowSink>,
    shutting_down: bool,
}

/// The actor system that manages actor lifecycles.
///
/// The System is the main entry point for:
/// - Creating new actors
/// - Observing their lifecycle and counters
/// - Handling system shutdown
#[derive(Clone)]
pub struct System {
    config: Arc<SimConfig>,
    registry: Registry,
    root_cancellation: CancellationToken,
    context: Arc<RwLock<SystemContext>>,
}

impl System {
    pub fn new(config: Arc<SimConfig>, registry: Registry, sink: FlowSink) -> Self {
        Self {
            config,
            registry,
            root_cancellation: CancellationToken::new(),
            context: Arc::new(RwLock::new(SystemContext {
                supervisors: HashMap::new(),
                sink: Some(sink),
                shutting_down: false,
            })),
        }
    }

    pub fn config(&self) -> &Arc<SimConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate an inbox for an actor that has not been built yet.
    ///
    /// The endpoint is usable immediately; messages queue until the actor starts.
    pub fn prepare(&self, name: InstanceName) -> Supervisor<Uninitialized> {
        Supervisor::construct(name)
    }

    /// Prepare and start an actor in one step.
    pub fn spawn(
        &self,
        name: InstanceName,
        actor: Box<dyn Actor>,
        setup: ActorSetup,
    ) -> Result<Spawned, SystemError> {
        self.prepare(name).start_within(self, actor, setup)
    }

    /// Endpoints of every actor that has not stopped, ordered by path.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self
            .context
            .read()
            .supervisors
            .values()
            .filter(|entry| entry.lifecycle.get() != Lifecycle::Stopped)
            .map(|entry| entry.endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// The endpoint of the live actor with the given name.
    pub fn find(&self, name: &InstanceName) -> Option<Endpoint> {
        self.context
            .read()
            .supervisors
            .values()
            .find(|entry| entry.endpoint.name() == name && entry.lifecycle.get() != Lifecycle::Stopped)
            .map(|entry| entry.endpoint.clone())
    }

    pub fn lifecycle_of(&self, endpoint: &Endpoint) -> Option<Lifecycle> {
        self.context
            .read()
            .supervisors
            .get(&endpoint.path().instance_id)
            .map(|entry| entry.lifecycle.get())
    }

    /// Number of actors in each lifecycle state.
    pub fn lifecycle_counts(&self) -> BTreeMap<Lifecycle, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.context.read().supervisors.values() {
            *counts.entry(entry.lifecycle.get()).or_default() += 1;
        }
        counts
    }

    /// Number of actors ever spawned in this system.
    pub fn len(&self) -> usize {
        self.context.read().supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull counters from every live actor.
    pub async fn inspect_all(&self) -> Vec<ActorStats> {
        let mut stats = Vec::new();
        for endpoint in self.endpoints() {
            match endpoint.inspect().await {
                Ok(actor_stats) => stats.push(actor_stats),
                Err(err) => tracing::debug!(endpoint=%endpoint.name(), %err, "inspection skipped"),
            }
        }
        stats
    }

    /// Broadcast the global shutdown and wait for every actor to stop.
    ///
    /// Actors that have not drained by the end of `grace` are aborted, removed from
    /// the registry and reported as unfinished.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let handles: Vec<_> = {
            let mut context = self.context.write();
            context.shutting_down = true;
            context.sink = None;
            context
                .supervisors
                .values_mut()
                .filter_map(|entry| {
                    let handle = entry.handle.take()?;
                    Some((entry.endpoint.clone(), entry.lifecycle.clone(), handle))
                })
                .collect()
        };

        tracing::info!(actors = handles.len(), "broadcasting shutdown");
        self.root_cancellation.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for (endpoint, lifecycle, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(stats)) => report.stopped.push(stats),
                Ok(Err(err)) => {
                    tracing::warn!(actor=%endpoint.name(), %err, "actor task failed");
                    self.abandon(&endpoint, &lifecycle);
                    report.unfinished.push(endpoint.name().to_string());
                }
                Err(_) => {
                    tracing::warn!(actor=%endpoint.name(), "actor did not drain within the grace period");
                    abort.abort();
                    self.abandon(&endpoint, &lifecycle);
                    report.unfinished.push(endpoint.name().to_string());
                }
            }
        }
        report.stopped.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }

    fn abandon(&self, endpoint: &Endpoint, lifecycle: &LifecycleCell) {
        self.registry.deregister(endpoint);
        lifecycle.set(Lifecycle::Stopped);
    }

    fn attach(
        &self,
        path: &ActorPath,
        endpoint: Endpoint,
    ) -> Result<(FlowSink, CancellationToken, LifecycleCell), SystemError> {
        let mut context = self.context.write();
        let sink = match (&context.sink, context.shutting_down) {
            (Some(sink), false) => sink.clone(),
            _ => return Err(SystemError::ShuttingDown(path.name.to_string())),
        };
        let lifecycle = LifecycleCell::new();
        context.supervisors.insert(
            path.instance_id,
            SupervisorEntry {
                endpoint,
                lifecycle: lifecycle.clone(),
                handle: None,
            },
        );
        Ok((sink, self.root_cancellation.child_token(), lifecycle))
    }

    fn set_handle(&self, id: Id, handle: JoinHandle<ActorStats>) {
        if let Some(entry) = self.context.write().supervisors.get_mut(&id) {
            entry.handle = Some(handle);
        }
    }
}

pub trait State {}

/// A supervisor whose inbox exists but whose actor has not started.
pub struct Uninitialized {
    mailbox: PrioritizedMailbox<Command>,
}

impl State for Uninitialized {}

/// A supervisor whose actor task is running.
pub struct Initialized {
    lifecycle: LifecycleCell,
}

impl State for Initialized {}

pub struct Supervisor<S: State> {
    path: Arc<ActorPath>,
    sender: MailboxSender<Command>,
    state: S,
}

impl<S: State> Supervisor<S> {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.sender.clone(), self.path.clone())
    }

    pub fn name(&self) -> &InstanceName {
        &self.path.name
    }
}

impl Supervisor<Uninitialized> {
    pub fn construct(name: InstanceName) -> Supervisor<Uninitialized> {
        let path = Arc::new(ActorPath::fresh(name));
        let (sender, mailbox) = PrioritizedMailbox::channel();
        Supervisor {
            path,
            sender,
            state: Uninitialized { mailbox },
        }
    }

    /// Start the actor on its own task within `system`.
    pub fn start_within(
        self,
        system: &System,
        actor: Box<dyn Actor>,
        setup: ActorSetup,
    ) -> Result<Spawned, SystemError> {
        let endpoint = self.endpoint();
        let (sink, cancellation, lifecycle) = system.attach(&self.path, endpoint.clone())?;

        let mut ctx = Context::new(
            endpoint.clone(),
            system.registry.clone(),
            system.config.clone(),
            sink,
            cancellation,
            lifecycle.clone(),
        );
        ctx.set_watched(setup.watch);
        for peer in setup.peers {
            ctx.add_peer(peer);
        }

        let runtime = SupervisorRuntime {
            actor,
            mailbox: self.state.mailbox,
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(runtime.run(ctx, ready_tx));
        system.set_handle(self.path.instance_id, handle);

        let supervisor = Supervisor {
            path: self.path,
            sender: self.sender,
            state: Initialized { lifecycle },
        };
        Ok(Spawned {
            supervisor,
            ready: ready_rx,
        })
    }
}

impl Supervisor<Initialized> {
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle.get()
    }
}

/// A freshly started actor.
pub struct Spawned {
    supervisor: Supervisor<Initialized>,
    ready: oneshot::Receiver<bool>,
}

impl Spawned {
    pub fn endpoint(&self) -> Endpoint {
        self.supervisor.endpoint()
    }

    pub fn supervisor(&self) -> &Supervisor<Initialized> {
        &self.supervisor
    }

    /// Wait until the actor registered and is running. `false` when it never will.
    pub async fn ready(self) -> bool {
        self.ready.await.unwrap_or(false)
    }
}

enum Event {
    Shutdown,
    Command(Command),
    Timer(Timer),
    Poll(Vec<Listing>),
}

struct SupervisorRuntime {
    actor: Box<dyn Actor>,
    mailbox: PrioritizedMailbox<Command>,
}

impl SupervisorRuntime {
    #[tracing::instrument(name = "actor", skip_all, fields(name = %ctx.name()))]
    async fn run(mut self, mut ctx: Context, ready: oneshot::Sender<bool>) -> ActorStats {
        if let Err(err) = ctx.registry().register(ctx.service(), ctx.endpoint()) {
            tracing::error!(%err, "registration failed, actor will not start");
            self.mailbox.close();
            ctx.set_lifecycle(Lifecycle::Stopped);
            let _ = ready.send(false);
            return ctx.stats(0);
        }
        ctx.set_lifecycle(Lifecycle::Running);
        let _ = ready.send(true);
        tracing::debug!(peers = ctx.peers().len(), "running");

        self.actor.started(&mut ctx).await;
        ctx.flush_flows().await;

        let mut polling = ctx
            .registry()
            .poll_many(ctx.watched().to_vec(), ctx.config().poll_interval);
        polling.defer();
        let polls = !ctx.watched().is_empty();
        let cancellation = ctx.cancellation();

        loop {
            let event = tokio::select! {
                _ = cancellation.cancelled() => Event::Shutdown,
                command = self.mailbox.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Shutdown,
                },
                Some(timer) = ctx.next_timer() => Event::Timer(timer),
                Some(listings) = polling.next(), if polls => Event::Poll(listings),
            };

            match event {
                Event::Shutdown => {
                    tracing::debug!("shutdown received");
                    break;
                }
                Event::Command(Command::Inspect(tx)) => {
                    let _ = tx.send(ctx.stats(self.actor.in_flight()));
                }
                Event::Command(Command::Deliver(message)) if message.kind() == Kind::Stop => {
                    ctx.note_received(Kind::Stop);
                    tracing::debug!("stop received");
                    break;
                }
                Event::Command(Command::Deliver(message)) => {
                    self.deliver(&mut ctx, message).await;
                }
                Event::Timer(timer) => self.actor.timer(&mut ctx, timer).await,
                Event::Poll(listings) => {
                    let added = ctx.apply_listings(listings);
                    if !added.is_empty() {
                        self.actor.discovered(&mut ctx, added).await;
                    }
                }
            }
            ctx.flush_flows().await;
        }

        self.drain(ctx).await
    }

    async fn deliver(&mut self, ctx: &mut Context, message: Message) {
        ctx.note_received(message.kind());
        self.actor.handle(ctx, message).await;
    }

    async fn drain(mut self, mut ctx: Context) -> ActorStats {
        ctx.set_lifecycle(Lifecycle::Draining);
        ctx.registry().deregister(ctx.endpoint());
        self.mailbox.close();

        for command in self.mailbox.drain() {
            match command {
                Command::Inspect(tx) => {
                    let _ = tx.send(ctx.stats(self.actor.in_flight()));
                }
                Command::Deliver(message) if message.kind() == Kind::Stop => {
                    ctx.note_received(Kind::Stop);
                }
                Command::Deliver(message) => self.deliver(&mut ctx, message).await,
            }
        }

        self.actor.stopping(&mut ctx).await;
        ctx.flush_flows().await;
        ctx.set_lifecycle(Lifecycle::Stopped);
        self.actor.stopped(&mut ctx).await;

        let stats = ctx.stats(self.actor.in_flight());
        tracing::debug!(sent = stats.sent, received = stats.received, "stopped");
        stats
    }
}
