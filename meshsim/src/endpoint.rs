//! Addressable handles to actor inboxes.
use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::mailbox::{MailboxSender, QoSLevel};
use crate::metrics::ActorStats;
use crate::path::{ActorPath, InstanceName};
use crate::protocol::{Message, Payload};

/// Errors that can occur when delivering to an endpoint
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Returned when trying to send a message to an actor whose mailbox has been closed
    #[error("actor mailbox has been closed")]
    MailboxClosed,
    /// Returned when the response channel was dropped before receiving the result
    #[error("actor response was dropped unexpectedly")]
    ResponseDropped,
}

/// Commands accepted by an actor's supervisor loop.
pub(crate) enum Command {
    /// A protocol message to hand to the actor.
    Deliver(Message),
    /// A diagnostic pull answered by the runtime with the actor's current counters.
    Inspect(oneshot::Sender<ActorStats>),
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Deliver(message) => write!(f, "Command::Deliver({})", message.kind()),
            Command::Inspect(_) => write!(f, "Command::Inspect"),
        }
    }
}

/// A handle to one actor's inbox.
///
/// Endpoints are cheap to clone and are the only addresses actors exchange.
/// Holding one allows sending messages but grants no control over the actor's
/// lifecycle. Equality, ordering and hashing follow the actor path.
#[derive(Clone)]
pub struct Endpoint {
    sender: MailboxSender<Command>,
    path: Arc<ActorPath>,
}

impl Endpoint {
    pub(crate) fn new(sender: MailboxSender<Command>, path: Arc<ActorPath>) -> Self {
        Self { sender, path }
    }

    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    pub fn name(&self) -> &InstanceName {
        &self.path.name
    }

    pub fn service(&self) -> &str {
        self.path.name.service()
    }

    /// Whether the actor behind this endpoint has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Deliver a message without waiting for it to be handled.
    ///
    /// Messages from one sender to one endpoint are handled in the order sent.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        self.sender
            .send(QoSLevel::Normal, Command::Deliver(message))
            .map_err(|_| SendError::MailboxClosed)
    }

    /// Ask the actor to stop. Stopping an already stopped actor has no effect.
    pub fn stop(&self) {
        if self.send(Message::anonymous(Payload::Stop)).is_err() {
            tracing::trace!(path=%self.path, "stop sent to a stopped actor");
        }
    }

    /// Pull the actor's current counters.
    pub async fn inspect(&self) -> Result<ActorStats, SendError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(QoSLevel::Control, Command::Inspect(tx))
            .map_err(|_| SendError::MailboxClosed)?;
        rx.await.map_err(|_| SendError::ResponseDropped)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .finish()
    }
}
