//! An actor-mesh simulator for large microservice architectures.
//!
//! Every service instance of an architecture runs as its own actor, finds its
//! dependencies through a shared name registry and talks to them with a small
//! request/response protocol. A passive recorder observes every message so a
//! run can be summarised, exported as a call graph, and reloaded.
//!
//! ```no_run
//! use meshsim::prelude::*;
//!
//! # async fn run() -> Result<(), SimulationError> {
//! let definition = ArchitectureDefinition::new("shop")
//!     .service(ServiceDefinition::new("web").depends_on("cart", 2))
//!     .service(ServiceDefinition::new("cart").count(3));
//! let report = Simulation::new(SimConfig::default())?.run(&definition).await?;
//! println!("{} flows", report.snapshot.records.len());
//! # Ok(())
//! # }
//! ```
pub mod actor;
pub mod architecture;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod id;
pub mod logging;
mod mailbox;
pub mod metrics;
pub mod node;
pub mod path;
pub mod prelude;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod simulation;
pub mod system;
pub mod topology;

#[cfg(test)]
mod test_utils;
