//! Commonly used simulator types and traits.
//!
//! Import this module to define an architecture, run it, or write a custom
//! service behaviour.

pub use super::actor::{
    async_trait, // Async trait macro
    Actor,       // Service behaviour trait
    Lifecycle,   // Starting, Running, Draining, Stopped
    Timer,       // Timers an actor can schedule
};
pub use super::architecture::{
    ArchitectureDefinition, // A whole architecture: services and regions
    ArchitectureError,
    LatencyModel,      // Per-service processing latency
    ServiceDefinition, // One service, its dependencies and instance count
};
pub use super::config::{DegradedReply, OverflowPolicy, SimConfig};
pub use super::context::Context; // Actor context for message handling
pub use super::endpoint::{Endpoint, SendError};
pub use super::id::Id;
pub use super::metrics::ActorStats;
pub use super::node::{MeshNode, NodeSpec};
pub use super::path::{ActorPath, InstanceName};
pub use super::protocol::{Kind, Message, Payload, TraceContext};
pub use super::recorder::{ExportedGraph, FlowRecord, FlowSnapshot};
pub use super::registry::{Listing, ListingUpdate, Registry};
pub use super::simulation::{RunningSimulation, Simulation, SimulationError, SimulationReport};
pub use super::system::{System, SystemError};
pub use super::topology::{Blueprint, Catalog, NodeFactory, Topology, TopologyError};
