//! The message vocabulary shared by every actor in the mesh.
//!
//! A [`Message`] carries the replying address of its sender, an optional trace
//! context used to correlate requests with responses, and a [`Payload`]. The
//! payload is a closed set of variants, one per [`Kind`]; anything an actor does
//! not understand arrives as [`Payload::Unknown`] and is ignored.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::id::Id;
use crate::metrics::ActorStats;
use crate::path::InstanceName;

/// The wire-stable message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    Hello,
    NameDrop,
    Inform,
    GetRequest,
    GetResponse,
    Put,
    Replicate,
    Chat,
    Forget,
    Stop,
    GoroutineCount,
    Metrics,
    Unknown,
}

impl Kind {
    pub const ALL: [Kind; 13] = [
        Kind::Hello,
        Kind::NameDrop,
        Kind::Inform,
        Kind::GetRequest,
        Kind::GetResponse,
        Kind::Put,
        Kind::Replicate,
        Kind::Chat,
        Kind::Forget,
        Kind::Stop,
        Kind::GoroutineCount,
        Kind::Metrics,
        Kind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Hello => "Hello",
            Kind::NameDrop => "NameDrop",
            Kind::Inform => "Inform",
            Kind::GetRequest => "GetRequest",
            Kind::GetResponse => "GetResponse",
            Kind::Put => "Put",
            Kind::Replicate => "Replicate",
            Kind::Chat => "Chat",
            Kind::Forget => "Forget",
            Kind::Stop => "Stop",
            Kind::GoroutineCount => "GoroutineCount",
            Kind::Metrics => "Metrics",
            Kind::Unknown => "Unknown",
        }
    }

    /// Kinds that travel from a caller to one of its dependencies. These define
    /// the call graph of an exported run.
    pub fn is_call(&self) -> bool {
        matches!(self, Kind::Hello | Kind::GetRequest | Kind::Put)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Kind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .unwrap_or(Kind::Unknown))
    }
}

impl From<String> for Kind {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(Kind::Unknown)
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.as_str().to_string()
    }
}

/// Correlates a simulated request with its sub-requests and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    /// Shared by every hop of one originated request.
    pub trace: Id,
    /// Identifies this hop.
    pub span: Id,
    /// The span that caused this hop, if any.
    pub parent: Option<Id>,
}

impl TraceContext {
    /// Start a new trace.
    pub fn root() -> Self {
        let id = Id::new();
        Self {
            trace: id,
            span: id,
            parent: None,
        }
    }

    /// A new span within the same trace, caused by this one.
    pub fn child(&self) -> Self {
        Self {
            trace: self.trace,
            span: Id::new(),
            parent: Some(self.span),
        }
    }
}

/// The payload shape of each message kind.
#[derive(Debug, Clone)]
pub enum Payload {
    /// The sender announces itself under its instance name.
    Hello { name: InstanceName },
    /// The sender shares a peer that offers `service`.
    NameDrop { service: String, peer: Endpoint },
    /// A key/value update to a running parameter.
    Inform { key: String, value: String },
    GetRequest { key: String },
    GetResponse {
        key: String,
        value: Option<String>,
        /// The response was sent before every sub-request completed.
        degraded: bool,
        /// Sub-requests that answered in time.
        answered: u32,
        /// Sub-requests that were fanned out.
        expected: u32,
        /// Time spent serving the request at the responder.
        elapsed: Duration,
    },
    /// Store locally and forward along outbound edges.
    Put { key: String, value: String },
    /// Store locally only.
    Replicate { key: String, value: String },
    Chat { text: String },
    /// Drop the named peer from the local view.
    Forget { name: InstanceName },
    Stop,
    GoroutineCount,
    /// A diagnostic pull when `report` is empty, the answer otherwise.
    Metrics { report: Option<Box<ActorStats>> },
    /// A kind this engine does not know.
    Unknown { kind: String },
}

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Hello { .. } => Kind::Hello,
            Payload::NameDrop { .. } => Kind::NameDrop,
            Payload::Inform { .. } => Kind::Inform,
            Payload::GetRequest { .. } => Kind::GetRequest,
            Payload::GetResponse { .. } => Kind::GetResponse,
            Payload::Put { .. } => Kind::Put,
            Payload::Replicate { .. } => Kind::Replicate,
            Payload::Chat { .. } => Kind::Chat,
            Payload::Forget { .. } => Kind::Forget,
            Payload::Stop => Kind::Stop,
            Payload::GoroutineCount => Kind::GoroutineCount,
            Payload::Metrics { .. } => Kind::Metrics,
            Payload::Unknown { .. } => Kind::Unknown,
        }
    }
}

/// The unit of communication between actors. Immutable once sent.
#[derive(Debug, Clone)]
pub struct Message {
    sender: Option<Endpoint>,
    trace: Option<TraceContext>,
    payload: Payload,
}

impl Message {
    /// A message with no replying address, as sent by the controller.
    pub fn anonymous(payload: Payload) -> Self {
        Self {
            sender: None,
            trace: None,
            payload,
        }
    }

    pub(crate) fn new(
        sender: Option<Endpoint>,
        trace: Option<TraceContext>,
        payload: Payload,
    ) -> Self {
        Self {
            sender,
            trace,
            payload,
        }
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }

    pub fn sender(&self) -> Option<&Endpoint> {
        self.sender.as_ref()
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_parts(self) -> (Option<Endpoint>, Option<TraceContext>, Payload) {
        (self.sender, self.trace, self.payload)
    }

    /// The service or instance name carried by the message, if any.
    pub fn name(&self) -> Option<String> {
        match &self.payload {
            Payload::Hello { name } | Payload::Forget { name } => Some(name.to_string()),
            Payload::NameDrop { service, .. } => Some(service.clone()),
            Payload::Inform { key, .. }
            | Payload::GetRequest { key }
            | Payload::GetResponse { key, .. }
            | Payload::Put { key, .. }
            | Payload::Replicate { key, .. } => Some(key.clone()),
            _ => None,
        }
    }

    /// The integer carried by the message, if any.
    pub fn count(&self) -> Option<u64> {
        match &self.payload {
            Payload::GetResponse { answered, .. } => Some(u64::from(*answered)),
            Payload::Metrics {
                report: Some(stats),
            } => Some(stats.received),
            _ => None,
        }
    }

    /// The simulated processing time carried by the message, if any.
    pub fn duration(&self) -> Option<Duration> {
        match &self.payload {
            Payload::GetResponse { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        for kind in Kind::ALL {
            assert_eq!(kind.as_str().parse::<Kind>().unwrap(), kind);
        }
        assert_eq!("Teleport".parse::<Kind>().unwrap(), Kind::Unknown);
    }

    #[test]
    fn test_kind_serde_as_string() {
        let json = serde_json::to_string(&Kind::GetRequest).unwrap();
        assert_eq!(json, "\"GetRequest\"");
        let kind: Kind = serde_json::from_str("\"Whatever\"").unwrap();
        assert_eq!(kind, Kind::Unknown);
    }

    #[test]
    fn test_trace_child() {
        let root = TraceContext::root();
        let child = root.child();
        assert_eq!(child.trace, root.trace);
        assert_eq!(child.parent, Some(root.span));
        assert_ne!(child.span, root.span);
    }

    #[test]
    fn test_message_accessors() {
        let message = Message::anonymous(Payload::GetResponse {
            key: "k".into(),
            value: None,
            degraded: true,
            answered: 2,
            expected: 3,
            elapsed: Duration::from_millis(7),
        });
        assert_eq!(message.kind(), Kind::GetResponse);
        assert_eq!(message.name().as_deref(), Some("k"));
        assert_eq!(message.count(), Some(2));
        assert_eq!(message.duration(), Some(Duration::from_millis(7)));
        assert!(message.sender().is_none());
    }
}
