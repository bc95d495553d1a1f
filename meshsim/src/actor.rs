//! Core actor traits and types for the mesh.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::context::Context;
use crate::id::Id;
use crate::protocol::Message;

pub use async_trait::async_trait;

/// The lifecycle of one actor.
///
/// `Starting → Running` once registered with the name registry,
/// `Running → Draining` on `Stop` or the global shutdown, and
/// `Draining → Stopped` once deregistered with in-flight responses delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Starting,
            1 => Lifecycle::Running,
            2 => Lifecycle::Draining,
            _ => Lifecycle::Stopped,
        }
    }
}

/// A lifecycle shared between an actor's run loop and its supervisor handle.
#[derive(Debug, Clone)]
pub(crate) struct LifecycleCell(Arc<AtomicU8>);

impl LifecycleCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Lifecycle::Starting as u8)))
    }

    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: Lifecycle) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A timer an actor scheduled on its own context.
///
/// Timers are owned by the actor's execution unit and never travel through the
/// inbox, so they never show up as protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Simulated processing of the request with this span has finished.
    Process(Id),
    /// The fan-out deadline of the request with this span has passed.
    Expire(Id),
    /// Time to originate a new request.
    Originate,
    /// Free for actors supplied by architecture catalogs.
    Custom(u64),
}

/// The core actor trait implemented by every simulated service.
///
/// Actors:
/// - Process messages one at a time
/// - Maintain private state
/// - Talk to other actors only through messages and the name registry
/// - Have a lifecycle managed by their supervisor
#[async_trait]
pub trait Actor: Send + 'static {
    /// Called once registered, before the first message is handled.
    async fn started(&mut self, _ctx: &mut Context) {}

    /// Handle one protocol message.
    async fn handle(&mut self, ctx: &mut Context, message: Message);

    /// Called when a timer scheduled through the context fires.
    async fn timer(&mut self, _ctx: &mut Context, _timer: Timer) {}

    /// Called after the periodic registry poll or a forced refresh added peers.
    async fn discovered(&mut self, _ctx: &mut Context, _added: Vec<crate::endpoint::Endpoint>) {}

    /// Called while draining, after queued messages were handled. Deliver any
    /// outstanding responses here.
    async fn stopping(&mut self, _ctx: &mut Context) {}

    /// Called after the actor has been deregistered and its flows flushed.
    async fn stopped(&mut self, _ctx: &mut Context) {}

    /// Requests in progress, reported in [`crate::metrics::ActorStats::in_flight`].
    fn in_flight(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_cell() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.get(), Lifecycle::Starting);
        let shared = cell.clone();
        shared.set(Lifecycle::Draining);
        assert_eq!(cell.get(), Lifecycle::Draining);
        assert!(Lifecycle::Running < Lifecycle::Stopped);
    }
}
