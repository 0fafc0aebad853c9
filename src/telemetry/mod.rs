//! Per-operation event republishing
//!
//! After a tracked operation updates its record, the owning module may
//! flatten the outcome into an [`IoEvent`] and hand it to an [`EventSink`].
//! Sinks are strictly best-effort: a failed publish is logged by the caller
//! and never touches the record state or the instrumented call.
//!
//! Two sinks ship:
//! - [`stream::StreamConnector`]: JSON lines over TCP, fed by a lock-free queue
//! - [`otlp::OtlpSink`]: OpenTelemetry spans (requires the `otlp` feature)

pub mod otlp;
pub mod stream;

use crate::identity::RecordId;
use crate::runtime::ModuleId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use stream::{ConnectionEvent, ConnectionObserver, ConnectorStats, StreamConnector};

/// Job-level fields stamped on every event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventOrigin {
    pub job_id: u64,
    pub rank: i64,
    pub uid: u32,
    pub producer: String,
    pub exe: String,
    /// Wall-clock job start (seconds since the epoch); event times are relative to it
    pub epoch: f64,
}

/// Data movement (`MOD`) or metadata (`MET`) operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "MOD")]
    Data,
    #[serde(rename = "MET")]
    Meta,
}

/// One accessed region of a data operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub off: i64,
    pub len: i64,
    pub start: f64,
    pub dur: f64,
    /// Cumulative time of this operation kind on the record
    pub total: f64,
    /// Wall-clock end of the operation (seconds since the epoch)
    pub timestamp: f64,
}

/// Flattened view of one tracked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoEvent {
    pub job_id: u64,
    pub rank: i64,
    pub uid: u32,
    pub producer: String,
    pub exe: String,
    pub file: String,
    pub record_id: RecordId,
    pub module: ModuleId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub op: String,
    /// Operation count on the record (opens for open/close)
    pub cnt: i64,
    pub max_byte: i64,
    pub switches: i64,
    pub flushes: i64,
    pub seg: Vec<Segment>,
}

impl IoEvent {
    pub fn new(
        origin: &EventOrigin,
        module: ModuleId,
        kind: EventKind,
        op: &str,
        record_id: RecordId,
        file: String,
    ) -> Self {
        IoEvent {
            job_id: origin.job_id,
            rank: origin.rank,
            uid: origin.uid,
            producer: origin.producer.clone(),
            exe: origin.exe.clone(),
            file,
            record_id,
            module,
            kind,
            op: op.to_string(),
            cnt: 0,
            max_byte: -1,
            switches: -1,
            flushes: -1,
            seg: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry queue full, event dropped")]
    QueueFull,

    #[error("telemetry endpoint not connected")]
    Disconnected,

    #[error("telemetry export failed: {0}")]
    Export(String),
}

/// Destination for flattened operation events
pub trait EventSink: Send + Sync {
    /// Hand an event over; must not block the instrumented call
    fn publish(&self, event: &IoEvent) -> Result<(), TelemetryError>;
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<IoEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IoEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: &IoEvent) -> Result<(), TelemetryError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Publishes every event to each inner sink
///
/// All sinks are tried; the first failure is reported.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &IoEvent) -> Result<(), TelemetryError> {
        let mut outcome = Ok(());
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}
