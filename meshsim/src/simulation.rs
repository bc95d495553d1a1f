//! The simulation controller.
//!
//! A [`Simulation`] owns the validated run parameters and the package catalog.
//! Starting it brings up the recorder, then the topology; the returned
//! [`RunningSimulation`] can be observed and poked while it runs, and its
//! [`shutdown`](RunningSimulation::shutdown) is the barrier that only returns
//! once every actor has stopped and the recorder has flushed.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::actor::Lifecycle;
use crate::architecture::{ArchitectureDefinition, ArchitectureError};
use crate::config::{ConfigError, SimConfig};
use crate::endpoint::Endpoint;
use crate::metrics::ActorStats;
use crate::path::InstanceName;
use crate::protocol::{Kind, Message, Payload};
use crate::recorder::{ExportedGraph, FlowSnapshot, Recorder};
use crate::registry::Registry;
use crate::system::{System, SystemError};
use crate::topology::{Blueprint, Catalog, Topology, TopologyError};

#[cfg(test)]
#[path = "simulation.test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid architecture: {0}")]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error("no instance named {0}")]
    UnknownInstance(String),
}

/// What a finished run leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub arch: String,
    /// Actors spawned over the whole run, including scaled out ones.
    pub spawned: usize,
    /// Actors that reached `Stopped` before the grace period ended.
    pub stopped: usize,
    /// Actors that had to be abandoned at the shutdown barrier.
    pub unfinished: Vec<String>,
    /// Final counters per actor, sorted by name.
    pub actors: Vec<ActorStats>,
    pub snapshot: FlowSnapshot,
    pub graph: ExportedGraph,
    /// Whether the recorder drained its queue before the grace period ended.
    pub recorder_flushed: bool,
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Messages of `kind` recorded from any instance of `source` to any instance of `dest`.
    pub fn edge_count(&self, source: &str, dest: &str, kind: Kind) -> u64 {
        self.snapshot.service_edge_count(source, dest, kind)
    }

    /// Successful sends counted by all actors.
    pub fn total_sent(&self) -> u64 {
        self.actors.iter().map(|stats| stats.sent).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.unfinished.is_empty() && self.recorder_flushed
    }
}

/// Validated run parameters plus the catalog used to build actors.
pub struct Simulation {
    config: Arc<SimConfig>,
    catalog: Catalog,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            catalog: Catalog::default(),
        })
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Build the mesh for `definition` and leave it running.
    ///
    /// A malformed definition is rejected before anything is spawned.
    pub async fn start(
        &self,
        definition: &ArchitectureDefinition,
    ) -> Result<RunningSimulation, SimulationError> {
        let blueprint = Blueprint::from_definition(definition, &self.config)?;
        self.launch(blueprint).await
    }

    /// Rebuild the mesh of a previously exported run and leave it running.
    pub async fn start_reload(
        &self,
        graph: &ExportedGraph,
    ) -> Result<RunningSimulation, SimulationError> {
        let blueprint = Blueprint::from_graph(graph)?;
        self.launch(blueprint).await
    }

    /// Start, run for the configured duration, and shut down.
    pub async fn run(
        &self,
        definition: &ArchitectureDefinition,
    ) -> Result<SimulationReport, SimulationError> {
        let running = self.start(definition).await?;
        Ok(running.run_for(self.config.duration).await)
    }

    /// Like [`Simulation::run`], starting from an exported graph.
    pub async fn reload(&self, graph: &ExportedGraph) -> Result<SimulationReport, SimulationError> {
        let running = self.start_reload(graph).await?;
        Ok(running.run_for(self.config.duration).await)
    }

    #[tracing::instrument(skip_all, fields(arch = %self.config.arch, instances = blueprint.len()))]
    async fn launch(&self, blueprint: Blueprint) -> Result<RunningSimulation, SimulationError> {
        self.catalog.check(&blueprint)?;

        let (mut recorder, sink) = Recorder::start(&self.config);
        let system = System::new(self.config.clone(), Registry::new(), sink);
        let arch = blueprint.definition().name.clone();

        let topology = match Topology::build(&system, blueprint, self.catalog.clone()).await {
            Ok(topology) => topology,
            Err(err) => {
                tracing::error!(%err, "topology build failed, tearing down");
                system.shutdown(self.config.shutdown_grace).await;
                recorder.finish(self.config.shutdown_grace).await;
                return Err(err.into());
            }
        };
        tracing::info!(actors = topology.len(), "simulation started");

        Ok(RunningSimulation {
            arch,
            config: self.config.clone(),
            system,
            topology,
            recorder,
            started_at: Instant::now(),
        })
    }
}

/// A mesh that is running. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the actors running until the runtime stops.
pub struct RunningSimulation {
    arch: String,
    config: Arc<SimConfig>,
    system: System,
    topology: Topology,
    recorder: Recorder,
    started_at: Instant,
}

impl RunningSimulation {
    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn registry(&self) -> &Registry {
        self.system.registry()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// A point-in-time copy of every flow recorded so far.
    pub fn snapshot(&self) -> FlowSnapshot {
        self.recorder.snapshot()
    }

    /// The call graph recorded so far.
    pub fn graph(&self) -> ExportedGraph {
        self.snapshot().graph(&self.arch, self.topology.names())
    }

    /// Pull the current counters of every live actor.
    pub async fn actor_stats(&self) -> Vec<ActorStats> {
        self.system.inspect_all().await
    }

    pub fn lifecycle_counts(&self) -> BTreeMap<Lifecycle, usize> {
        self.system.lifecycle_counts()
    }

    fn endpoint(&self, instance: &InstanceName) -> Result<&Endpoint, SimulationError> {
        self.topology
            .endpoint(instance)
            .ok_or_else(|| SimulationError::UnknownInstance(instance.to_string()))
    }

    /// Change a running parameter of one instance.
    pub fn inform(
        &self,
        instance: &InstanceName,
        key: &str,
        value: &str,
    ) -> Result<(), SimulationError> {
        let message = Message::anonymous(Payload::Inform {
            key: key.to_string(),
            value: value.to_string(),
        });
        if self.endpoint(instance)?.send(message).is_err() {
            tracing::debug!(%instance, "inform sent to a stopped instance");
        }
        Ok(())
    }

    /// Change a running parameter of every live instance. Returns how many got it.
    pub fn inform_all(&self, key: &str, value: &str) -> usize {
        self.system
            .endpoints()
            .iter()
            .filter(|endpoint| {
                let message = Message::anonymous(Payload::Inform {
                    key: key.to_string(),
                    value: value.to_string(),
                });
                endpoint.send(message).is_ok()
            })
            .count()
    }

    /// Ask one instance to stop. Stopping a stopped instance has no effect.
    pub fn stop_instance(&self, instance: &InstanceName) -> Result<(), SimulationError> {
        self.endpoint(instance)?.stop();
        Ok(())
    }

    /// Add an instance of `service` in `region` to the running mesh.
    pub async fn scale_out(
        &mut self,
        service: &str,
        region: &str,
    ) -> Result<Endpoint, SimulationError> {
        Ok(self.topology.scale_out(&self.system, service, region).await?)
    }

    /// Let the mesh run for `duration`, then shut it down.
    pub async fn run_for(self, duration: Duration) -> SimulationReport {
        tracing::info!(?duration, "running");
        tokio::time::sleep(duration).await;
        self.shutdown().await
    }

    /// Stop every actor, then flush the recorder. Returns once both are done or
    /// the grace period has run out.
    #[tracing::instrument(skip_all, fields(arch = %self.arch))]
    pub async fn shutdown(mut self) -> SimulationReport {
        let grace = self.config.shutdown_grace;
        let shutdown = self.system.shutdown(grace).await;
        if !shutdown.unfinished.is_empty() {
            tracing::warn!(
                unfinished = shutdown.unfinished.len(),
                "reporting completion with actors that did not drain"
            );
        }

        let recorder_flushed = self.recorder.finish(grace).await;
        let snapshot = self.recorder.snapshot();
        let graph = snapshot.graph(&self.arch, self.topology.names());
        let report = SimulationReport {
            arch: self.arch.clone(),
            spawned: self.system.len(),
            stopped: shutdown.stopped.len(),
            unfinished: shutdown.unfinished,
            actors: shutdown.stopped,
            snapshot,
            graph,
            recorder_flushed,
            elapsed: self.started_at.elapsed(),
        };
        tracing::info!(
            spawned = report.spawned,
            stopped = report.stopped,
            flows = report.snapshot.records.len(),
            elapsed = ?report.elapsed,
            "simulation finished"
        );
        report
    }
}
