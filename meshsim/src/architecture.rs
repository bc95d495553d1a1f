//! Declarative architecture definitions.
//!
//! An [`ArchitectureDefinition`] names the services of a mesh, how many instances
//! each has before population scaling, which services each one calls and how
//! widely it fans out. Definitions are read once, validated, and never mutated.
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const DEFAULT_PACKAGE: &str = "node";

#[derive(Debug, thiserror::Error)]
pub enum ArchitectureError {
    #[error("architecture defines no services")]
    Empty,
    #[error("region replication factor must be at least 1")]
    ZeroRegions,
    #[error("service '{0}' is defined more than once")]
    DuplicateService(String),
    #[error("invalid service name '{0}': names must be non-empty and contain no '.'")]
    InvalidName(String),
    #[error("service '{0}' has an instance count of zero")]
    ZeroCount(String),
    #[error("service '{from}' depends on unknown service '{service}'")]
    UnknownService { service: String, from: String },
    #[error("edge '{from}' -> '{service}' has a fan-out width of zero")]
    ZeroFanout { service: String, from: String },
    #[error("service '{service}' uses unknown package '{package}'")]
    UnknownPackage { service: String, package: String },
    #[error("malformed architecture definition: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How long an instance takes to process one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum LatencyModel {
    Fixed { ms: u64 },
    Uniform { min_ms: u64, max_ms: u64 },
    Exponential { mean_ms: u64 },
}

impl Default for LatencyModel {
    fn default() -> Self {
        LatencyModel::Fixed { ms: 1 }
    }
}

impl LatencyModel {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            LatencyModel::Fixed { ms } => Duration::from_millis(ms),
            LatencyModel::Uniform { min_ms, max_ms } if min_ms >= max_ms => {
                Duration::from_millis(min_ms)
            }
            LatencyModel::Uniform { min_ms, max_ms } => {
                Duration::from_millis(rng.gen_range(min_ms..=max_ms))
            }
            LatencyModel::Exponential { mean_ms: 0 } => Duration::ZERO,
            LatencyModel::Exponential { mean_ms } => match Exp::new(1.0 / mean_ms as f64) {
                Ok(exp) => Duration::from_micros((exp.sample(rng) * 1000.0) as u64),
                Err(_) => Duration::from_millis(mean_ms),
            },
        }
    }
}

/// An outbound call edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub service: String,
    /// How many instances of `service` each request is fanned out to.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

fn default_fanout() -> usize {
    1
}

fn default_count() -> u32 {
    1
}

fn default_regions() -> usize {
    1
}

fn default_package() -> String {
    DEFAULT_PACKAGE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    /// The catalog entry that builds this service's actors.
    #[serde(default = "default_package")]
    pub package: String,
    /// Instances per region before population scaling.
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub dependencies: Vec<EdgeDefinition>,
    /// Whether instances originate requests. Defaults to "nothing calls this service".
    #[serde(default)]
    pub entry: Option<bool>,
    #[serde(default)]
    pub latency: LatencyModel,
    /// Overrides the configured fan-out timeout for this service.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: default_package(),
            count: 1,
            dependencies: Vec::new(),
            entry: None,
            latency: LatencyModel::default(),
            timeout_ms: None,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>, fanout: usize) -> Self {
        self.dependencies.push(EdgeDefinition {
            service: service.into(),
            fanout,
        });
        self
    }

    pub fn entry(mut self, entry: bool) -> Self {
        self.entry = Some(entry);
        self
    }

    pub fn latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|edge| edge.service.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Region replication factor.
    #[serde(default = "default_regions")]
    pub regions: usize,
    pub services: Vec<ServiceDefinition>,
}

impl ArchitectureDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            regions: 1,
            services: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn regions(mut self, regions: usize) -> Self {
        self.regions = regions;
        self
    }

    pub fn service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    /// Parse and validate a JSON definition.
    pub fn from_json(json: &str) -> Result<Self, ArchitectureError> {
        let definition: Self = serde_json::from_str(json)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn find(&self, service: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|definition| definition.name == service)
    }

    /// Services that call `service`, sorted.
    pub fn dependents_of(&self, service: &str) -> Vec<&str> {
        let mut dependents: Vec<_> = self
            .services
            .iter()
            .filter(|definition| definition.dependency_names().any(|dep| dep == service))
            .map(|definition| definition.name.as_str())
            .collect();
        dependents.sort();
        dependents
    }

    /// Whether instances of `service` originate requests.
    pub fn is_entry(&self, service: &ServiceDefinition) -> bool {
        service.entry.unwrap_or_else(|| {
            !self.services.iter().any(|caller| {
                caller.name != service.name
                    && caller.dependency_names().any(|dep| dep == service.name)
            })
        })
    }

    /// Check every reference and count before anything is spawned.
    pub fn validate(&self) -> Result<(), ArchitectureError> {
        if self.services.is_empty() {
            return Err(ArchitectureError::Empty);
        }
        if self.regions == 0 {
            return Err(ArchitectureError::ZeroRegions);
        }

        let mut names = BTreeSet::new();
        for service in &self.services {
            if service.name.is_empty() || service.name.contains('.') {
                return Err(ArchitectureError::InvalidName(service.name.clone()));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ArchitectureError::DuplicateService(service.name.clone()));
            }
            if service.count == 0 {
                return Err(ArchitectureError::ZeroCount(service.name.clone()));
            }
        }

        for service in &self.services {
            for edge in &service.dependencies {
                if !names.contains(edge.service.as_str()) {
                    return Err(ArchitectureError::UnknownService {
                        service: edge.service.clone(),
                        from: service.name.clone(),
                    });
                }
                if edge.fanout == 0 {
                    return Err(ArchitectureError::ZeroFanout {
                        service: edge.service.clone(),
                        from: service.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Base instance count per service, keyed by name.
    pub fn counts(&self) -> BTreeMap<&str, u32> {
        self.services
            .iter()
            .map(|service| (service.name.as_str(), service.count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn chain() -> ArchitectureDefinition {
        ArchitectureDefinition::new("chain")
            .service(ServiceDefinition::new("a").depends_on("b", 1))
            .service(ServiceDefinition::new("b").depends_on("c", 2))
            .service(ServiceDefinition::new("c").count(3))
    }

    #[test]
    fn test_validate_accepts_chain() {
        let definition = chain();
        definition.validate().unwrap();
        assert!(definition.is_entry(definition.find("a").unwrap()));
        assert!(!definition.is_entry(definition.find("c").unwrap()));
        assert_eq!(definition.dependents_of("c"), vec!["b"]);
    }

    #[test]
    fn test_validate_rejects_unknown_service() {
        let definition = ArchitectureDefinition::new("broken")
            .service(ServiceDefinition::new("a").depends_on("ghost", 1));
        assert_matches!(
            definition.validate(),
            Err(ArchitectureError::UnknownService { service, from }) if service == "ghost" && from == "a"
        );
    }

    #[test]
    fn test_validate_rejects_bad_counts_and_names() {
        let zero = ArchitectureDefinition::new("zero").service(ServiceDefinition::new("a").count(0));
        assert_matches!(zero.validate(), Err(ArchitectureError::ZeroCount(name)) if name == "a");

        let dotted = ArchitectureDefinition::new("dotted").service(ServiceDefinition::new("a.b"));
        assert_matches!(dotted.validate(), Err(ArchitectureError::InvalidName(_)));

        let duplicate = ArchitectureDefinition::new("dup")
            .service(ServiceDefinition::new("a"))
            .service(ServiceDefinition::new("a"));
        assert_matches!(duplicate.validate(), Err(ArchitectureError::DuplicateService(_)));

        let fanout = ArchitectureDefinition::new("fanout")
            .service(ServiceDefinition::new("a").depends_on("b", 0))
            .service(ServiceDefinition::new("b"));
        assert_matches!(fanout.validate(), Err(ArchitectureError::ZeroFanout { .. }));

        assert_matches!(
            ArchitectureDefinition::new("empty").validate(),
            Err(ArchitectureError::Empty)
        );
        assert_matches!(chain().regions(0).validate(), Err(ArchitectureError::ZeroRegions));
    }

    #[test]
    fn test_from_json_defaults() {
        let definition = ArchitectureDefinition::from_json(
            r#"{
                "name": "shop",
                "regions": 2,
                "services": [
                    {"name": "web", "dependencies": [{"service": "cart"}]},
                    {"name": "cart", "count": 2, "latency": {"model": "uniform", "min_ms": 1, "max_ms": 5}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.regions, 2);
        let web = definition.find("web").unwrap();
        assert_eq!(web.package, DEFAULT_PACKAGE);
        assert_eq!(web.count, 1);
        assert_eq!(web.dependencies[0].fanout, 1);
        assert_eq!(
            definition.find("cart").unwrap().latency,
            LatencyModel::Uniform { min_ms: 1, max_ms: 5 }
        );
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert_matches!(
            ArchitectureDefinition::from_json("{\"name\": 1}"),
            Err(ArchitectureError::Parse(_))
        );
        assert_matches!(
            ArchitectureDefinition::from_json(
                r#"{"name": "x", "services": [{"name": "a", "dependencies": [{"service": "b"}]}]}"#
            ),
            Err(ArchitectureError::UnknownService { .. })
        );
    }

    #[test]
    fn test_latency_models() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(
            LatencyModel::Fixed { ms: 4 }.sample(&mut rng),
            Duration::from_millis(4)
        );
        for _ in 0..100 {
            let sample = LatencyModel::Uniform { min_ms: 2, max_ms: 6 }.sample(&mut rng);
            assert!(sample >= Duration::from_millis(2) && sample <= Duration::from_millis(6));
        }
        assert_eq!(
            LatencyModel::Exponential { mean_ms: 0 }.sample(&mut rng),
            Duration::ZERO
        );
        let total: Duration = (0..1000)
            .map(|_| LatencyModel::Exponential { mean_ms: 10 }.sample(&mut rng))
            .sum();
        let mean = total / 1000;
        assert!(mean > Duration::from_millis(5) && mean < Duration::from_millis(20));
    }
}
