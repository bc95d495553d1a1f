//! Flow recording: a passive observer of mesh traffic.
//!
//! Actors buffer a [`FlowRecord`] for every message they send and flush the
//! buffer into a [`FlowSink`] once the handling step that produced them is done,
//! so observation never sits between two protocol sends. The [`Recorder`] task
//! drains the sink into an append-only log with running aggregates.
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{OverflowPolicy, SimConfig};
use crate::metrics::{HistogramSnapshot, LatencyHistogram};
use crate::protocol::{Kind, TraceContext};

#[cfg(test)]
#[path = "recorder.test.rs"]
mod tests;

/// One observed message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source: String,
    pub dest: String,
    pub kind: Kind,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub trace: Option<TraceContext>,
}

/// Where actors deliver their flow records.
///
/// The overflow behaviour is fixed when the recorder starts: `Blocking` waits for
/// queue space at flush time, `DropOldest` overwrites the oldest queued record
/// and the recorder counts the loss.
#[derive(Clone, Debug)]
pub enum FlowSink {
    Disabled,
    Blocking(mpsc::Sender<FlowRecord>),
    DropOldest(broadcast::Sender<FlowRecord>),
}

impl FlowSink {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, FlowSink::Disabled)
    }

    pub async fn emit(&self, record: FlowRecord) {
        match self {
            FlowSink::Disabled => {}
            FlowSink::Blocking(tx) => {
                if tx.send(record).await.is_err() {
                    tracing::trace!("recorder has finished, flow record discarded");
                }
            }
            FlowSink::DropOldest(tx) => {
                if tx.send(record).is_err() {
                    tracing::trace!("recorder has finished, flow record discarded");
                }
            }
        }
    }

    pub async fn emit_all(&self, records: impl IntoIterator<Item = FlowRecord>) {
        for record in records {
            self.emit(record).await;
        }
    }
}

/// Aggregates for one directed edge between two names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub source: String,
    pub dest: String,
    pub count: u64,
    pub by_kind: BTreeMap<Kind, u64>,
}

impl EdgeSummary {
    fn new(source: &str, dest: &str) -> Self {
        Self {
            source: source.to_string(),
            dest: dest.to_string(),
            count: 0,
            by_kind: BTreeMap::new(),
        }
    }

    pub fn count_of(&self, kind: Kind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }
}

#[derive(Default)]
struct FlowStore {
    records: Vec<FlowRecord>,
    edges: BTreeMap<(String, String), EdgeSummary>,
    latency: BTreeMap<Kind, LatencyHistogram>,
    dropped: u64,
}

impl FlowStore {
    fn ingest(&mut self, record: FlowRecord) {
        let edge = self
            .edges
            .entry((record.source.clone(), record.dest.clone()))
            .or_insert_with(|| EdgeSummary::new(&record.source, &record.dest));
        edge.count += 1;
        *edge.by_kind.entry(record.kind).or_default() += 1;

        if let Some(duration) = record.duration {
            self.latency.entry(record.kind).or_default().record(duration);
        }
        self.records.push(record);
    }

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            records: self.records.clone(),
            edges: self.edges.values().cloned().collect(),
            latency: self
                .latency
                .iter()
                .map(|(kind, histogram)| (*kind, histogram.snapshot()))
                .collect(),
            dropped: self.dropped,
            taken_at: Utc::now(),
        }
    }
}

/// A consistent point-in-time copy of everything recorded so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub records: Vec<FlowRecord>,
    pub edges: Vec<EdgeSummary>,
    pub latency: BTreeMap<Kind, HistogramSnapshot>,
    /// Records lost to the `DropOldest` overflow policy.
    pub dropped: u64,
    pub taken_at: DateTime<Utc>,
}

impl FlowSnapshot {
    pub fn edge(&self, source: &str, dest: &str) -> Option<&EdgeSummary> {
        self.edges
            .iter()
            .find(|edge| edge.source == source && edge.dest == dest)
    }

    /// Messages of `kind` observed between any instance of `source` and any
    /// instance of `dest`. Works for both instance and filtered service names.
    pub fn service_edge_count(&self, source: &str, dest: &str, kind: Kind) -> u64 {
        self.edges
            .iter()
            .filter(|edge| service_of(&edge.source) == source && service_of(&edge.dest) == dest)
            .map(|edge| edge.count_of(kind))
            .sum()
    }

    pub fn records_of(&self, kind: Kind) -> impl Iterator<Item = &FlowRecord> {
        self.records.iter().filter(move |record| record.kind == kind)
    }

    /// The call graph of the run: every node, plus one edge per caller/callee pair.
    pub fn graph(&self, arch: &str, nodes: impl IntoIterator<Item = String>) -> ExportedGraph {
        let mut names: BTreeSet<String> = nodes.into_iter().collect();
        let mut edges = Vec::new();
        for edge in &self.edges {
            let count: u64 = edge
                .by_kind
                .iter()
                .filter(|(kind, _)| kind.is_call())
                .map(|(_, count)| count)
                .sum();
            if count == 0 {
                continue;
            }
            names.insert(edge.source.clone());
            names.insert(edge.dest.clone());
            edges.push(GraphEdge {
                source: edge.source.clone(),
                dest: edge.dest.clone(),
                count,
            });
        }
        ExportedGraph {
            arch: arch.to_string(),
            nodes: names.into_iter().collect(),
            edges,
        }
    }
}

/// The service segment of an instance name, or the name itself once filtered.
pub(crate) fn service_of(name: &str) -> &str {
    let mut parts = name.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(service), Some(_), None) => service,
        _ => name,
    }
}

/// A format-agnostic call graph handed to exporters and read back by the reload path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedGraph {
    pub arch: String,
    pub nodes: Vec<String>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub dest: String,
    pub count: u64,
}

impl ExportedGraph {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The recorder task and its shared store.
pub struct Recorder {
    store: Arc<RwLock<FlowStore>>,
    cancellation: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Start the recorder task and return it with the sink actors write into.
    pub fn start(config: &SimConfig) -> (Self, FlowSink) {
        let store = Arc::new(RwLock::new(FlowStore::default()));
        let cancellation = CancellationToken::new();

        if !config.collect {
            let recorder = Self {
                store,
                cancellation,
                handle: None,
            };
            return (recorder, FlowSink::Disabled);
        }

        let capacity = config.flow_capacity.max(1);
        let (sink, handle) = match config.overflow {
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(capacity);
                let handle = tokio::spawn(ingest_blocking(rx, store.clone(), cancellation.clone()));
                (FlowSink::Blocking(tx), handle)
            }
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(capacity);
                let handle = tokio::spawn(ingest_lossy(rx, store.clone(), cancellation.clone()));
                (FlowSink::DropOldest(tx), handle)
            }
        };
        tracing::debug!(capacity, overflow=?config.overflow, "flow recorder started");

        let recorder = Self {
            store,
            cancellation,
            handle: Some(handle),
        };
        (recorder, sink)
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.store.read().snapshot()
    }

    /// Drain whatever is still queued and stop the task.
    ///
    /// Returns `false` when the task did not finish within `grace`.
    pub async fn finish(&mut self, grace: Duration) -> bool {
        self.cancellation.cancel();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(?grace, "flow recorder did not flush in time");
                abort.abort();
                false
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn ingest_blocking(
    mut rx: mpsc::Receiver<FlowRecord>,
    store: Arc<RwLock<FlowStore>>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                rx.close();
                while let Some(record) = rx.recv().await {
                    store.write().ingest(record);
                }
                break;
            }
            record = rx.recv() => match record {
                Some(record) => store.write().ingest(record),
                None => break,
            },
        }
    }
    tracing::debug!("flow recorder finished");
}

async fn ingest_lossy(
    mut rx: broadcast::Receiver<FlowRecord>,
    store: Arc<RwLock<FlowStore>>,
    cancellation: CancellationToken,
) {
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                loop {
                    match rx.try_recv() {
                        Ok(record) => store.write().ingest(record),
                        Err(TryRecvError::Lagged(missed)) => store.write().dropped += missed,
                        Err(_) => break,
                    }
                }
                break;
            }
            record = rx.recv() => match record {
                Ok(record) => store.write().ingest(record),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "flow recorder lagged, oldest records dropped");
                    store.write().dropped += missed;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("flow recorder finished");
}
