//! Turning an architecture into running actors.
//!
//! A [`Blueprint`] is the deterministic list of instances a run will spawn, derived
//! either from an [`ArchitectureDefinition`] or from a previously exported graph.
//! [`Topology::build`] spawns it in two phases: every inbox is allocated first so
//! each instance can start with its dependencies already known, then the actors
//! are constructed through the [`Catalog`] and started.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::architecture::{
    ArchitectureDefinition, ArchitectureError, DEFAULT_PACKAGE, EdgeDefinition, ServiceDefinition,
};
use crate::actor::Actor;
use crate::config::SimConfig;
use crate::endpoint::Endpoint;
use crate::node::{MeshNode, NodeSpec};
use crate::path::{InstanceName, PathError, region_name};
use crate::protocol::{Message, Payload};
use crate::recorder::ExportedGraph;
use crate::system::{ActorSetup, System, SystemError};

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error("exported node '{node}' is not an instance name: {source}")]
    InvalidNode {
        node: String,
        #[source]
        source: PathError,
    },
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("unknown region '{0}'")]
    UnknownRegion(String),
    #[error("instance {0} did not start")]
    NotStarted(String),
}

/// Builds the actor for one instance of a package.
pub trait NodeFactory: Send + Sync {
    fn build(&self, spec: &NodeSpec) -> Box<dyn Actor>;
}

impl<F> NodeFactory for F
where
    F: Fn(&NodeSpec) -> Box<dyn Actor> + Send + Sync,
{
    fn build(&self, spec: &NodeSpec) -> Box<dyn Actor> {
        self(spec)
    }
}

/// Package name to actor factory. The `node` package is always available.
#[derive(Clone)]
pub struct Catalog {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl Default for Catalog {
    fn default() -> Self {
        let mut catalog = Self {
            factories: HashMap::new(),
        };
        catalog.register(DEFAULT_PACKAGE, |spec: &NodeSpec| {
            Box::new(MeshNode::new(spec)) as Box<dyn Actor>
        });
        catalog
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package: impl Into<String>, factory: impl NodeFactory + 'static) {
        self.factories.insert(package.into(), Arc::new(factory));
    }

    pub fn with(mut self, package: impl Into<String>, factory: impl NodeFactory + 'static) -> Self {
        self.register(package, factory);
        self
    }

    pub fn contains(&self, package: &str) -> bool {
        self.factories.contains_key(package)
    }

    /// Every package the blueprint uses must be known before anything is spawned.
    pub fn check(&self, blueprint: &Blueprint) -> Result<(), ArchitectureError> {
        for service in &blueprint.definition.services {
            if !self.contains(&service.package) {
                return Err(ArchitectureError::UnknownPackage {
                    service: service.name.clone(),
                    package: service.package.clone(),
                });
            }
        }
        Ok(())
    }

    fn build(&self, spec: &NodeSpec) -> Result<Box<dyn Actor>, ArchitectureError> {
        let factory = self.factories.get(&spec.service.package).ok_or_else(|| {
            ArchitectureError::UnknownPackage {
                service: spec.service.name.clone(),
                package: spec.service.package.clone(),
            }
        })?;
        Ok(factory.build(spec))
    }
}

/// One instance to spawn.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub name: InstanceName,
    pub service: Arc<ServiceDefinition>,
    pub entry: bool,
    /// Instances this one is wired to at start. `None` means every instance of
    /// every dependency.
    pub calls: Option<Vec<InstanceName>>,
}

/// The instances of a run, sorted by name.
#[derive(Debug, Clone)]
pub struct Blueprint {
    definition: ArchitectureDefinition,
    instances: Vec<InstancePlan>,
}

impl Blueprint {
    /// Scale and replicate a validated definition.
    ///
    /// Each service gets `max(1, count × population / 100)` instances in each of
    /// the configured regions.
    pub fn from_definition(
        definition: &ArchitectureDefinition,
        config: &SimConfig,
    ) -> Result<Self, ArchitectureError> {
        definition.validate()?;
        let regions = config.regions.unwrap_or(definition.regions);
        if regions == 0 {
            return Err(ArchitectureError::ZeroRegions);
        }

        let mut instances = Vec::new();
        for service in &definition.services {
            let entry = definition.is_entry(service);
            let service = Arc::new(service.clone());
            let count = config.scaled_count(service.count);
            for region in 0..regions {
                let region = region_name(region);
                for index in 0..count {
                    instances.push(InstancePlan {
                        name: InstanceName::new(region.as_str(), service.name.as_str(), index),
                        service: service.clone(),
                        entry,
                        calls: None,
                    });
                }
            }
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));

        let mut definition = definition.clone();
        definition.regions = regions;
        Ok(Self {
            definition,
            instances,
        })
    }

    /// Recreate the instance set of an exported run.
    ///
    /// Every node becomes an instance wired to the instances it called. A
    /// service's fan-out width toward another is the largest number of distinct
    /// instances of the callee any one of its instances called.
    pub fn from_graph(graph: &ExportedGraph) -> Result<Self, TopologyError> {
        let parse = |node: &str| {
            node.parse::<InstanceName>()
                .map_err(|source| TopologyError::InvalidNode {
                    node: node.to_string(),
                    source,
                })
        };

        let mut nodes = BTreeSet::new();
        for node in &graph.nodes {
            nodes.insert(parse(node)?);
        }
        let mut calls: BTreeMap<InstanceName, BTreeSet<InstanceName>> = BTreeMap::new();
        for edge in &graph.edges {
            let source = parse(&edge.source)?;
            let dest = parse(&edge.dest)?;
            if source == dest {
                continue;
            }
            nodes.insert(source.clone());
            nodes.insert(dest.clone());
            calls.entry(source).or_default().insert(dest);
        }

        // service -> callee service -> widest per-instance fan-out
        let mut fanouts: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
        let mut called: BTreeSet<&str> = BTreeSet::new();
        for (source, dests) in &calls {
            let mut widths: BTreeMap<&str, usize> = BTreeMap::new();
            for dest in dests {
                if dest.service() != source.service() {
                    called.insert(dest.service());
                }
                *widths.entry(dest.service()).or_default() += 1;
            }
            let service = fanouts.entry(source.service()).or_default();
            for (dest, width) in widths {
                let widest = service.entry(dest).or_default();
                *widest = (*widest).max(width);
            }
        }

        let mut counts: BTreeMap<&str, BTreeMap<&str, u32>> = BTreeMap::new();
        for node in &nodes {
            *counts
                .entry(node.service())
                .or_default()
                .entry(node.region())
                .or_default() += 1;
        }
        let regions: BTreeSet<&str> = nodes.iter().map(InstanceName::region).collect();

        let mut definition = ArchitectureDefinition::new(graph.arch.as_str()).regions(regions.len().max(1));
        for (service, per_region) in &counts {
            let count = per_region.values().copied().max().unwrap_or(1);
            let dependencies = fanouts
                .get(service)
                .map(|widths| {
                    widths
                        .iter()
                        .map(|(callee, fanout)| EdgeDefinition {
                            service: callee.to_string(),
                            fanout: *fanout,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let mut service_definition = ServiceDefinition::new(*service).count(count);
            service_definition.dependencies = dependencies;
            service_definition.entry = Some(!called.contains(service));
            definition.services.push(service_definition);
        }
        definition.validate()?;

        let services: BTreeMap<String, Arc<ServiceDefinition>> = definition
            .services
            .iter()
            .map(|service| (service.name.clone(), Arc::new(service.clone())))
            .collect();
        let mut instances = Vec::new();
        for node in nodes {
            let service = services
                .get(node.service())
                .cloned()
                .ok_or_else(|| TopologyError::UnknownService(node.service().to_string()))?;
            let wired = calls
                .get(&node)
                .map(|dests| dests.iter().cloned().collect())
                .unwrap_or_default();
            instances.push(InstancePlan {
                entry: service.entry.unwrap_or(false),
                service,
                name: node,
                calls: Some(wired),
            });
        }

        Ok(Self {
            definition,
            instances,
        })
    }

    pub fn definition(&self) -> &ArchitectureDefinition {
        &self.definition
    }

    pub fn instances(&self) -> &[InstancePlan] {
        &self.instances
    }

    pub fn names(&self) -> impl Iterator<Item = &InstanceName> {
        self.instances.iter().map(|plan| &plan.name)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances planned for `service` across all regions.
    pub fn count_of(&self, service: &str) -> usize {
        self.instances
            .iter()
            .filter(|plan| plan.name.service() == service)
            .count()
    }
}

/// The running mesh built from a blueprint.
pub struct Topology {
    blueprint: Blueprint,
    catalog: Catalog,
    endpoints: BTreeMap<InstanceName, Endpoint>,
}

impl Topology {
    /// Spawn every planned instance and wait until all of them are registered.
    #[tracing::instrument(skip_all, fields(arch = %blueprint.definition().name, instances = blueprint.len()))]
    pub async fn build(
        system: &System,
        blueprint: Blueprint,
        catalog: Catalog,
    ) -> Result<Self, TopologyError> {
        catalog.check(&blueprint)?;

        let supervisors: Vec<_> = blueprint
            .instances
            .iter()
            .map(|plan| (plan, system.prepare(plan.name.clone())))
            .collect();
        let endpoints: BTreeMap<InstanceName, Endpoint> = supervisors
            .iter()
            .map(|(plan, supervisor)| (plan.name.clone(), supervisor.endpoint()))
            .collect();
        let mut by_service: BTreeMap<(&str, &str), Vec<Endpoint>> = BTreeMap::new();
        for (name, endpoint) in &endpoints {
            by_service
                .entry((name.region(), name.service()))
                .or_default()
                .push(endpoint.clone());
        }

        let mut started = Vec::with_capacity(supervisors.len());
        for (plan, supervisor) in supervisors {
            let peers = match &plan.calls {
                Some(calls) => calls
                    .iter()
                    .filter_map(|name| endpoints.get(name).cloned())
                    .collect(),
                None => plan
                    .service
                    .dependency_names()
                    .flat_map(|service| {
                        by_service
                            .get(&(plan.name.region(), service))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect(),
            };
            let setup = ActorSetup {
                watch: plan.service.dependency_names().map(str::to_string).collect(),
                peers,
            };
            let spec = NodeSpec {
                name: plan.name.clone(),
                service: plan.service.clone(),
                entry: plan.entry,
                config: system.config().clone(),
            };
            let actor = catalog.build(&spec)?;
            started.push((plan.name.clone(), supervisor.start_within(system, actor, setup)?));
        }

        for (name, spawned) in started {
            if !spawned.ready().await {
                return Err(TopologyError::NotStarted(name.to_string()));
            }
        }
        tracing::info!(actors = endpoints.len(), "topology running");

        Ok(Self {
            blueprint,
            catalog,
            endpoints,
        })
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Every instance name ever spawned, including dynamic ones, sorted.
    pub fn names(&self) -> Vec<String> {
        self.endpoints.keys().map(ToString::to_string).collect()
    }

    pub fn endpoint(&self, name: &InstanceName) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&InstanceName, &Endpoint)> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Spawn one more instance of `service` in `region` while the mesh runs.
    ///
    /// The new instance learns its dependencies from the registry and is
    /// introduced to every live instance of the services that call it.
    #[tracing::instrument(skip(self, system))]
    pub async fn scale_out(
        &mut self,
        system: &System,
        service: &str,
        region: &str,
    ) -> Result<Endpoint, TopologyError> {
        let definition = self
            .blueprint
            .definition
            .find(service)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownService(service.to_string()))?;
        if !self.endpoints.keys().any(|name| name.region() == region) {
            return Err(TopologyError::UnknownRegion(region.to_string()));
        }

        let index = self
            .endpoints
            .keys()
            .filter(|name| name.region() == region && name.service() == service)
            .map(|name| name.index() + 1)
            .max()
            .unwrap_or(0);
        let name = InstanceName::new(region, service, index);

        let peers = definition
            .dependency_names()
            .flat_map(|dependency| system.registry().lookup(dependency))
            .filter(|peer| peer.name().region() == region)
            .collect();
        let setup = ActorSetup {
            watch: definition.dependency_names().map(str::to_string).collect(),
            peers,
        };
        let spec = NodeSpec {
            name: name.clone(),
            entry: self.blueprint.definition.is_entry(&definition),
            service: Arc::new(definition),
            config: system.config().clone(),
        };
        let actor = self.catalog.build(&spec)?;
        let spawned = system.spawn(name.clone(), actor, setup)?;
        let endpoint = spawned.endpoint();
        if !spawned.ready().await {
            return Err(TopologyError::NotStarted(name.to_string()));
        }
        self.endpoints.insert(name.clone(), endpoint.clone());

        for dependent in self.blueprint.definition.dependents_of(service) {
            let callers = system.registry().lookup(dependent);
            for caller in callers.iter().filter(|caller| caller.name().region() == region) {
                let introduction = Payload::NameDrop {
                    service: service.to_string(),
                    peer: endpoint.clone(),
                };
                if caller.send(Message::anonymous(introduction)).is_err() {
                    tracing::trace!(caller = %caller.name(), "caller stopped before introduction");
                }
            }
        }
        tracing::info!(instance = %name, "scaled out");
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::recorder::GraphEdge;
    use crate::test_utils::{fast_config, test_system};

    fn a_to_b() -> ArchitectureDefinition {
        ArchitectureDefinition::new("ab")
            .service(ServiceDefinition::new("a").depends_on("b", 1))
            .service(ServiceDefinition::new("b").count(2))
    }

    #[test]
    fn test_blueprint_counts_scale_with_population_and_regions() {
        for (population, regions) in [(100, 1), (300, 1), (50, 2), (250, 3), (1, 4)] {
            let config = SimConfig {
                population,
                regions: Some(regions),
                ..Default::default()
            };
            let blueprint = Blueprint::from_definition(&a_to_b(), &config).unwrap();
            for (service, base) in [("a", 1), ("b", 2)] {
                assert_eq!(
                    blueprint.count_of(service),
                    config.scaled_count(base) * regions,
                    "population {population}, regions {regions}, service {service}"
                );
            }
        }
    }

    #[test]
    fn test_blueprint_names_are_deterministic() {
        let config = SimConfig {
            regions: Some(2),
            ..Default::default()
        };
        let first: Vec<_> = Blueprint::from_definition(&a_to_b(), &config)
            .unwrap()
            .names()
            .map(ToString::to_string)
            .collect();
        let second: Vec<_> = Blueprint::from_definition(&a_to_b(), &config)
            .unwrap()
            .names()
            .map(ToString::to_string)
            .collect();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                "us-east-1.a.0",
                "us-east-1.b.0",
                "us-east-1.b.1",
                "us-west-2.a.0",
                "us-west-2.b.0",
                "us-west-2.b.1",
            ]
        );
    }

    #[test]
    fn test_blueprint_rejects_malformed_definition() {
        let definition = ArchitectureDefinition::new("broken")
            .service(ServiceDefinition::new("a").depends_on("missing", 1));
        assert_matches!(
            Blueprint::from_definition(&definition, &SimConfig::default()),
            Err(ArchitectureError::UnknownService { .. })
        );
    }

    #[test]
    fn test_blueprint_from_graph() {
        let graph = ExportedGraph {
            arch: "ab".into(),
            nodes: vec![
                "us-east-1.a.0".into(),
                "us-east-1.b.0".into(),
                "us-east-1.b.1".into(),
                "us-east-1.c.0".into(),
            ],
            edges: vec![
                GraphEdge {
                    source: "us-east-1.a.0".into(),
                    dest: "us-east-1.b.0".into(),
                    count: 4,
                },
                GraphEdge {
                    source: "us-east-1.a.0".into(),
                    dest: "us-east-1.b.1".into(),
                    count: 2,
                },
                GraphEdge {
                    source: "us-east-1.b.1".into(),
                    dest: "us-east-1.c.0".into(),
                    count: 1,
                },
            ],
        };
        let blueprint = Blueprint::from_graph(&graph).unwrap();
        assert_eq!(blueprint.len(), 4);

        let definition = blueprint.definition();
        let a = definition.find("a").unwrap();
        assert_eq!(a.dependencies[0].fanout, 2);
        assert_eq!(a.entry, Some(true));
        assert_eq!(definition.find("b").unwrap().entry, Some(false));
        assert_eq!(definition.find("b").unwrap().count, 2);

        let a0 = &blueprint.instances()[0];
        assert_eq!(a0.name.to_string(), "us-east-1.a.0");
        assert!(a0.entry);
        assert_eq!(a0.calls.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_blueprint_from_filtered_graph_fails() {
        let graph = ExportedGraph {
            arch: "ab".into(),
            nodes: vec!["a".into()],
            edges: vec![],
        };
        assert_matches!(
            Blueprint::from_graph(&graph),
            Err(TopologyError::InvalidNode { node, .. }) if node == "a"
        );
    }

    #[test]
    fn test_catalog_rejects_unknown_package() {
        let definition = ArchitectureDefinition::new("pkg")
            .service(ServiceDefinition::new("a").package("kafka"));
        let blueprint = Blueprint::from_definition(&definition, &SimConfig::default()).unwrap();
        assert_matches!(
            Catalog::default().check(&blueprint),
            Err(ArchitectureError::UnknownPackage { package, .. }) if package == "kafka"
        );
        let catalog = Catalog::default().with("kafka", |spec: &NodeSpec| {
            Box::new(MeshNode::new(spec)) as Box<dyn Actor>
        });
        catalog.check(&blueprint).unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_build_registers_every_instance() {
        let config = SimConfig {
            population: 300,
            ..fast_config()
        };
        let system = test_system(config.clone());
        let definition = ArchitectureDefinition::new("solo").service(ServiceDefinition::new("solo"));
        let blueprint = Blueprint::from_definition(&definition, &config).unwrap();
        let topology = Topology::build(&system, blueprint, Catalog::default())
            .await
            .unwrap();

        assert_eq!(topology.len(), 3);
        let registered = system.registry().lookup("solo");
        assert_eq!(registered.len(), 3);
        let distinct: BTreeSet<_> = registered.iter().map(|e| e.path().clone()).collect();
        assert_eq!(distinct.len(), 3);
        system.shutdown(config.shutdown_grace).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_build_unknown_package_spawns_nothing() {
        let system = test_system(fast_config());
        let definition = ArchitectureDefinition::new("pkg")
            .service(ServiceDefinition::new("a").package("kafka"));
        let blueprint = Blueprint::from_definition(&definition, system.config()).unwrap();
        assert_matches!(
            Topology::build(&system, blueprint, Catalog::default()).await.err(),
            Some(TopologyError::Architecture(ArchitectureError::UnknownPackage { .. }))
        );
        assert!(system.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_scale_out_introduces_new_instance() {
        let config = fast_config();
        let system = test_system(config.clone());
        let blueprint = Blueprint::from_definition(&a_to_b(), &config).unwrap();
        let mut topology = Topology::build(&system, blueprint, Catalog::default())
            .await
            .unwrap();
        assert_eq!(topology.len(), 3);

        let endpoint = topology.scale_out(&system, "b", "us-east-1").await.unwrap();
        assert_eq!(endpoint.name().to_string(), "us-east-1.b.2");
        assert_eq!(system.registry().lookup("b").len(), 3);
        assert_eq!(topology.len(), 4);

        assert_matches!(
            topology.scale_out(&system, "z", "us-east-1").await,
            Err(TopologyError::UnknownService(_))
        );
        assert_matches!(
            topology.scale_out(&system, "b", "mars-1").await,
            Err(TopologyError::UnknownRegion(_))
        );

        let caller = topology.endpoint(&"us-east-1.a.0".parse().unwrap()).unwrap().clone();
        let mut peers = 0;
        for _ in 0..50 {
            peers = caller.inspect().await.unwrap().peers;
            if peers == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(peers, 3);
        system.shutdown(config.shutdown_grace).await;
    }
}
