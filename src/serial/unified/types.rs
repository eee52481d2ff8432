//! State shared between the link manager and its reader/writer tasks
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, OwnedMutexGuard};

use crate::device::models::DeviceStatus;
use crate::device::DeviceError;
use crate::serial::protocol::{Command, Response};

/// Request ids wrap here, matching the unit's firmware counter
pub const REQUEST_ID_WRAP: u32 = 300_000;

/// Opcode plus optional port index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub method: String,
    pub port: Option<u8>,
}

impl CorrelationKey {
    pub fn new(method: &str, port: Option<u8>) -> Self {
        Self {
            method: method.to_string(),
            port,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}[{}]", self.method, port),
            None => f.write_str(&self.method),
        }
    }
}

pub type Responder = oneshot::Sender<Result<Response, DeviceError>>;

pub struct PendingRequest {
    pub id: u32,
    pub key: CorrelationKey,
    pub command: Command,
    pub started: Instant,
    pub responder: Responder,
}

/// Outstanding requests by id. Entries leave on fulfillment, timeout or
/// teardown, whichever comes first.
#[derive(Default)]
pub struct PendingTable {
    by_id: HashMap<u32, PendingRequest>,
}

impl PendingTable {
    pub fn insert(&mut self, request: PendingRequest) {
        if let Some(stale) = self.by_id.insert(request.id, request) {
            // only possible after a full id wrap with a request still parked
            log::warn!("Request id {} reused while {} was pending", stale.id, stale.key);
        }
    }

    pub fn take(&mut self, id: u32) -> Option<PendingRequest> {
        self.by_id.remove(&id)
    }

    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.by_id.drain().map(|(_, request)| request).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// One async gate per correlation key. Holding the guard is the right to
/// have a request for that key on the wire.
#[derive(Default)]
pub struct KeyGates {
    gates: Mutex<HashMap<CorrelationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyGates {
    pub async fn acquire(&self, key: &CorrelationKey) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock();
            // an unshared gate has no holder and no waiter
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            gates.entry(key.clone()).or_default().clone()
        };
        gate.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.gates.lock().len()
    }
}

#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU32,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }
}

impl RequestIds {
    pub fn next(&self) -> u32 {
        let result = self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id + 1 >= REQUEST_ID_WRAP { 0 } else { id + 1 })
        });
        // the closure never returns None
        match result {
            Ok(id) | Err(id) => id,
        }
    }
}

/// Encoded frame handed to the writer task
#[derive(Debug)]
pub struct OutboundFrame {
    pub id: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOrigin {
    Reader,
    Writer,
}

impl fmt::Display for IoOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOrigin::Reader => f.write_str("reader"),
            IoOrigin::Writer => f.write_str("writer"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    IoFailure {
        generation: u64,
        origin: IoOrigin,
        reason: String,
    },
}

/// Everything the reader task writes and callers read
pub struct LinkShared {
    pub pending: Mutex<PendingTable>,
    pub status: watch::Sender<DeviceStatus>,
    pub metrics: watch::Sender<MetricsSnapshot>,
}

impl LinkShared {
    pub fn new() -> Self {
        let (status, _) = watch::channel(DeviceStatus::default());
        let (metrics, _) = watch::channel(MetricsSnapshot::default());
        Self {
            pending: Mutex::new(PendingTable::default()),
            status,
            metrics,
        }
    }

    pub fn update_metrics(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        self.metrics.send_modify(f);
    }
}

impl Default for LinkShared {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub frames_written: u64,
    pub frames_decoded: u64,
    pub corrupt_frames: u64,
    /// Bytes discarded while hunting for a start marker
    pub noise_bytes: u64,
    pub status_pushes: u64,
    pub orphan_responses: u64,
    pub command_completed: u64,
    pub command_timeouts: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub command_last_latency_ms: Option<u64>,
    pub command_min_latency_ms: Option<u64>,
    pub command_max_latency_ms: Option<u64>,
    pub command_avg_latency_ms: Option<f64>,
    pub command_ema_latency_ms: Option<f64>,
    pub command_latency_samples: u64,
}

impl MetricsSnapshot {
    pub fn record_latency(&mut self, latency_ms: u64) {
        self.command_completed += 1;
        self.command_last_latency_ms = Some(latency_ms);
        self.command_min_latency_ms = Some(self.command_min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.command_max_latency_ms = Some(self.command_max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        self.command_latency_samples += 1;

        let samples = self.command_latency_samples;
        self.command_avg_latency_ms = Some(match self.command_avg_latency_ms {
            Some(avg) if samples > 1 => (avg * (samples as f64 - 1.0) + latency_ms as f64) / samples as f64,
            _ => latency_ms as f64,
        });
        self.command_ema_latency_ms = Some(match self.command_ema_latency_ms {
            Some(prev) => prev * 0.8 + latency_ms as f64 * 0.2,
            None => latency_ms as f64,
        });
    }
}
