//! Simple test utilities for exercising actors from the outside.
//!
//! A [`Probe`] is an endpoint whose inbox is read directly by the test instead
//! of an actor, so tests can play the caller or the dependency of a real actor.
//!
//! ```ignore
//! let mut probe = Probe::new("us-east-1.probe.0");
//! target.send(probe.message(Payload::GetRequest { key: "k".into() })).unwrap();
//! let response = probe.expect(Kind::GetResponse).await;
//! ```
use std::sync::Arc;
use std::time::Duration;

use crate::config::SimConfig;
use crate::endpoint::{Command, Endpoint};
use crate::mailbox::PrioritizedMailbox;
use crate::path::{ActorPath, InstanceName};
use crate::protocol::{Kind, Message, Payload, TraceContext};
use crate::recorder::FlowSink;
use crate::registry::Registry;
use crate::system::System;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A hand-driven endpoint.
pub struct Probe {
    endpoint: Endpoint,
    mailbox: PrioritizedMailbox<Command>,
}

impl Probe {
    pub fn new(name: &str) -> Self {
        let name: InstanceName = name.parse().expect("probe names are region.service.index");
        let (sender, mailbox) = PrioritizedMailbox::channel();
        let endpoint = Endpoint::new(sender, Arc::new(ActorPath::fresh(name)));
        Self { endpoint, mailbox }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// A message sent from this probe.
    pub fn message(&self, payload: Payload) -> Message {
        Message::new(Some(self.endpoint.clone()), None, payload)
    }

    /// A traced message sent from this probe.
    pub fn traced(&self, payload: Payload) -> (Message, TraceContext) {
        let trace = TraceContext::root();
        (
            Message::new(Some(self.endpoint.clone()), Some(trace), payload),
            trace,
        )
    }

    /// The next protocol message, or `None` after a quiet period.
    pub async fn recv(&mut self) -> Option<Message> {
        self.recv_within(PROBE_TIMEOUT).await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.mailbox.recv()).await {
                Ok(Some(Command::Deliver(message))) => return Some(message),
                Ok(Some(Command::Inspect(_))) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Skip messages until one of `kind` arrives. Panics after a quiet period.
    pub async fn expect(&mut self, kind: Kind) -> Message {
        loop {
            match self.recv().await {
                Some(message) if message.kind() == kind => return message,
                Some(_) => continue,
                None => panic!("probe {} timed out waiting for {kind}", self.endpoint.name()),
            }
        }
    }

    /// Stop accepting messages, as a stopped actor would.
    pub fn close(&mut self) {
        self.mailbox.close();
    }
}

/// Config tuned for fast tests: short intervals, no flow capture.
pub fn fast_config() -> SimConfig {
    SimConfig {
        duration: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(2),
        request_interval: Duration::from_millis(10),
        fanout_timeout: Duration::from_millis(100),
        collect: false,
        ..Default::default()
    }
}

/// A system with a fresh registry and no flow capture.
pub fn test_system(config: SimConfig) -> System {
    System::new(Arc::new(config), Registry::new(), FlowSink::Disabled)
}

pub fn name(value: &str) -> InstanceName {
    value.parse().expect("valid instance name")
}
