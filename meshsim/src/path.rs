use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::id::Id;

/// Region names used when replicating an architecture, in order.
pub const REGION_NAMES: [&str; 6] = [
    "us-east-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
];

/// Returns the name of the region at the given replica index.
pub fn region_name(index: usize) -> String {
    REGION_NAMES
        .get(index)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("region-{}", index))
}

/// The stable name of a simulated service instance.
///
/// Format: `region.service.index`, e.g. `us-east-1.api.0`. Service and region
/// names never contain a `.`, so the name can always be split back apart.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceName {
    region: Arc<str>,
    service: Arc<str>,
    index: usize,
}

impl InstanceName {
    pub fn new(region: impl Into<Arc<str>>, service: impl Into<Arc<str>>, index: usize) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            index,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.region, self.service, self.index)
    }
}

impl fmt::Debug for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid actor path format: {0}")]
    InvalidFormat(String),
    #[error("invalid scheme in actor path: {0}")]
    InvalidScheme(String),
    #[error("invalid instance id in actor path: {0}")]
    InvalidId(String),
    #[error("invalid instance name: {0}")]
    InvalidName(String),
}

impl FromStr for InstanceName {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (Some(region), Some(service), Some(index), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(PathError::InvalidName(s.to_string()));
        };
        if region.is_empty() || service.is_empty() {
            return Err(PathError::InvalidName(s.to_string()));
        }
        let index = index
            .parse()
            .map_err(|_| PathError::InvalidName(s.to_string()))?;
        Ok(InstanceName::new(region, service, index))
    }
}

impl TryFrom<String> for InstanceName {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceName> for String {
    fn from(name: InstanceName) -> Self {
        name.to_string()
    }
}

/// The address of one actor inbox in the mesh.
///
/// Format: `mesh://region/service/index#instance_id`. Two actors spawned with the same
/// instance name (e.g. after a reload) still have distinct paths.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ActorPath {
    /// The instance name of the actor.
    pub name: InstanceName,
    /// The unique instance identifier
    pub instance_id: Id,
}

impl ActorPath {
    const SCHEME: &'static str = "mesh";

    pub fn new(name: InstanceName, instance_id: Id) -> Self {
        Self { name, instance_id }
    }

    /// Create a path with a fresh instance id.
    pub fn fresh(name: InstanceName) -> Self {
        Self::new(name, Id::new())
    }
}

impl fmt::Display for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}#{}",
            Self::SCHEME,
            self.name.region(),
            self.name.service(),
            self.name.index(),
            self.instance_id
        )
    }
}

impl fmt::Debug for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for ActorPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| PathError::InvalidFormat(s.to_string()))?;
        if scheme != Self::SCHEME {
            return Err(PathError::InvalidScheme(scheme.to_string()));
        }

        let (location, id) = rest
            .split_once('#')
            .ok_or_else(|| PathError::InvalidFormat(s.to_string()))?;
        let parts: Vec<&str> = location.split('/').collect();
        if parts.len() != 3 {
            return Err(PathError::InvalidFormat(s.to_string()));
        }

        let name: InstanceName = format!("{}.{}.{}", parts[0], parts[1], parts[2]).parse()?;
        let instance_id = id
            .parse()
            .map_err(|_| PathError::InvalidId(id.to_string()))?;
        Ok(ActorPath::new(name, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        let name: InstanceName = "us-east-1.api.3".parse().unwrap();
        assert_eq!(name.region(), "us-east-1");
        assert_eq!(name.service(), "api");
        assert_eq!(name.index(), 3);
        assert_eq!(name.to_string(), "us-east-1.api.3");
    }

    #[test]
    fn test_invalid_instance_names() {
        assert!("api".parse::<InstanceName>().is_err());
        assert!("us-east-1.api".parse::<InstanceName>().is_err());
        assert!("us-east-1.api.x".parse::<InstanceName>().is_err());
        assert!("a.b.c.1".parse::<InstanceName>().is_err());
        assert!(".api.1".parse::<InstanceName>().is_err());
    }

    #[test]
    fn test_actor_path() {
        let path = ActorPath::fresh(InstanceName::new("eu-west-1", "store", 12));
        let parsed = ActorPath::from_str(&path.to_string()).unwrap();
        assert_eq!(path, parsed);
        assert_eq!(parsed.name.service(), "store");
    }

    #[test]
    fn test_actor_path_rejects_other_schemes() {
        let err = ActorPath::from_str("tcp://a/b/0#00000000-0000-0000-0000-000000000000")
            .unwrap_err();
        assert_eq!(err, PathError::InvalidScheme("tcp".into()));
    }

    #[test]
    fn test_region_names() {
        assert_eq!(region_name(0), "us-east-1");
        assert_eq!(region_name(5), "ap-southeast-2");
        assert_eq!(region_name(6), "region-6");
    }
}
