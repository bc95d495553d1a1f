//! The name registry: service discovery for the mesh.
//!
//! Maps a logical service name to the ordered set of live endpoints offering it.
//! Writers are immediately consistent; readers that want to follow changes
//! either poll at an interval of their choosing or subscribe to updates.
use futures::Stream;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::endpoint::Endpoint;
use crate::path::ActorPath;

#[cfg(test)]
#[path = "registry.test.rs"]
mod tests;

const SUBSCRIBER_BUFFER: usize = 256;

/// Errors returned by registry writes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The endpoint is already registered under a different service name.
    #[error("{endpoint} is already registered as '{existing}', cannot register as '{requested}'")]
    Conflict {
        endpoint: String,
        existing: String,
        requested: String,
    },
}

/// Updates sent to subscribers when endpoints are registered or deregistered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingUpdate {
    /// Indicates a new endpoint has been registered
    Registered(Endpoint),
    /// Indicates an endpoint has been deregistered
    Deregistered(Endpoint),
}

/// The endpoints registered under one service name at the time of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub service: String,
    pub endpoints: Vec<Endpoint>,
}

/// Internal type representing a subscription to registration updates
struct Subscriber {
    tx: mpsc::Sender<ListingUpdate>,
}

impl Subscriber {
    /// Creates a new subscriber with a channel for receiving updates
    fn new() -> (Self, mpsc::Receiver<ListingUpdate>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        (Self { tx }, rx)
    }

    /// Notifies the subscriber. A full subscriber misses the update.
    fn notify(&self, update: ListingUpdate) {
        if self.tx.try_send(update).is_err() {
            tracing::debug!("subscriber is full or closed, dropping listing update");
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct RegistryState {
    /// Service name -> endpoints in registration order
    registrations: HashMap<String, Vec<Endpoint>>,
    /// Actor path -> the one service name it is registered under
    owners: HashMap<ActorPath, String>,
    /// Service name -> subscribers
    subscriptions: HashMap<String, Vec<Subscriber>>,
}

impl RegistryState {
    fn notify(&mut self, service: &str, update: ListingUpdate) {
        if let Some(subscribers) = self.subscriptions.get_mut(service) {
            subscribers.retain(|subscriber| !subscriber.is_closed());
            for subscriber in subscribers.iter() {
                subscriber.notify(update.clone());
            }
        }
    }

    fn lookup(&self, service: &str) -> Vec<Endpoint> {
        self.registrations
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

/// Handle to the shared name registry. Clones share the same state.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` as offering `service`.
    ///
    /// Returns `Ok(false)` when the endpoint was already registered under the same
    /// name. An endpoint can only be registered under one name at a time.
    pub fn register(&self, service: &str, endpoint: &Endpoint) -> Result<bool, RegistryError> {
        let mut state = self.inner.write();
        if let Some(existing) = state.owners.get(endpoint.path()) {
            if existing == service {
                return Ok(false);
            }
            return Err(RegistryError::Conflict {
                endpoint: endpoint.name().to_string(),
                existing: existing.clone(),
                requested: service.to_string(),
            });
        }

        state
            .owners
            .insert(endpoint.path().clone(), service.to_string());
        state
            .registrations
            .entry(service.to_string())
            .or_default()
            .push(endpoint.clone());
        state.notify(service, ListingUpdate::Registered(endpoint.clone()));

        tracing::debug!(%service, endpoint=%endpoint.name(), "registered");
        Ok(true)
    }

    /// Remove `endpoint` from whichever service it is registered under.
    ///
    /// Returns whether anything was removed; deregistering twice is a no-op.
    pub fn deregister(&self, endpoint: &Endpoint) -> bool {
        let mut state = self.inner.write();
        let Some(service) = state.owners.remove(endpoint.path()) else {
            return false;
        };

        let emptied = match state.registrations.get_mut(&service) {
            Some(endpoints) => {
                endpoints.retain(|registered| registered != endpoint);
                endpoints.is_empty()
            }
            None => false,
        };
        if emptied {
            state.registrations.remove(&service);
        }
        state.notify(&service, ListingUpdate::Deregistered(endpoint.clone()));

        tracing::debug!(%service, endpoint=%endpoint.name(), "deregistered");
        true
    }

    /// All endpoints currently offering `service`. Unknown services yield an empty set.
    pub fn lookup(&self, service: &str) -> Vec<Endpoint> {
        self.inner.read().lookup(service)
    }

    /// Look up several services under one read lock.
    pub fn lookup_many(&self, services: &[String]) -> Vec<Listing> {
        let state = self.inner.read();
        services
            .iter()
            .map(|service| Listing {
                service: service.clone(),
                endpoints: state.lookup(service),
            })
            .collect()
    }

    /// The service name `endpoint` is registered under, if any.
    pub fn service_of(&self, endpoint: &Endpoint) -> Option<String> {
        self.inner.read().owners.get(endpoint.path()).cloned()
    }

    /// Names of every service with at least one registered endpoint, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<_> = self.inner.read().registrations.keys().cloned().collect();
        services.sort();
        services
    }

    /// Number of registered endpoints across all services.
    pub fn len(&self) -> usize {
        self.inner.read().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow registrations of `service`.
    ///
    /// The subscription first yields every current member as `Registered`, then
    /// live updates.
    pub fn subscribe(&self, service: &str) -> Subscription {
        let mut state = self.inner.write();
        let (subscriber, receiver) = Subscriber::new();
        let initial: VecDeque<_> = state.lookup(service).into_iter().collect();
        state
            .subscriptions
            .entry(service.to_string())
            .or_default()
            .push(subscriber);

        Subscription {
            service: service.to_string(),
            initial,
            receiver,
        }
    }

    /// A lazy, infinite sequence of listings for `service`, one per `interval`.
    pub fn poll(&self, service: &str, interval: Duration) -> Polling {
        self.poll_many(vec![service.to_string()], interval)
    }

    /// Like [`Registry::poll`], for several services at once.
    pub fn poll_many(&self, services: Vec<String>, interval: Duration) -> Polling {
        Polling::new(self.clone(), services, interval)
    }
}

/// A subscription to registration updates for one service name.
pub struct Subscription {
    /// The service this subscription is monitoring
    service: String,
    /// Queue of initial endpoints to yield as Registered events
    initial: VecDeque<Endpoint>,
    /// Channel for receiving ongoing subscription updates
    receiver: mpsc::Receiver<ListingUpdate>,
}

impl Subscription {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attempts to get the next update without blocking
    /// Returns None if no update is available
    pub fn some_next(&mut self) -> Option<ListingUpdate> {
        if let Some(endpoint) = self.initial.pop_front() {
            return Some(ListingUpdate::Registered(endpoint));
        }
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ListingUpdate;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        if let Some(endpoint) = self.initial.pop_front() {
            return Poll::Ready(Some(ListingUpdate::Registered(endpoint)));
        }

        self.receiver.poll_recv(cx)
    }
}

/// Periodic listings of a set of services.
///
/// The first listing is produced immediately. Missed ticks are skipped rather
/// than bunched, so a slow consumer never causes a burst of lookups.
pub struct Polling {
    registry: Registry,
    services: Vec<String>,
    interval: Interval,
}

impl Polling {
    fn new(registry: Registry, services: Vec<String>, period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            registry,
            services,
            interval,
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Produce the next listing right away and continue from there.
    pub fn restart(&mut self) {
        self.interval.reset_immediately();
    }

    /// Skip the immediate first listing; the next one arrives after a full period.
    pub fn defer(&mut self) {
        self.interval.reset();
    }
}

impl Stream for Polling {
    type Item = Vec<Listing>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match self.interval.poll_tick(cx) {
            Poll::Ready(_) => Poll::Ready(Some(self.registry.lookup_many(&self.services))),
            Poll::Pending => Poll::Pending,
        }
    }
}
