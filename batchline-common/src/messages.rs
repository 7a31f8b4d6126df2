//! Structured bodies exchanged as `obj` payloads: handshake and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::ProtocolTag;

/// First frame sent by a client on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Unique client identity, used as `origin_id` on every frame.
    pub identity: String,
    /// Protocol the client will encode requests with.
    pub protocol: ProtocolTag,
    pub client_version: String,
}

/// Server answer to [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAck {
    pub identity: String,
    pub server_version: String,
    pub protocol: ProtocolTag,
}

/// Lifecycle of a worker host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Binding the device and loading the model.
    Starting,
    /// Waiting for work.
    Ready,
    /// Running inference.
    Busy,
    /// Finishing its current batch before exiting.
    Draining,
    Dead,
}

impl WorkerState {
    /// Alive and past startup.
    pub fn is_serving(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self, WorkerState::Dead)
    }
}

/// Per-worker entry in the server status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: u64,
    pub device_id: i32,
    pub state: WorkerState,
    pub expanded: bool,
    pub started_at: DateTime<Utc>,
    pub batches_processed: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Pool-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PoolSummary {
    pub workers: Vec<WorkerSummary>,
    pub baseline_workers: usize,
    pub expanded_workers: usize,
    pub busy_workers: usize,
    pub serving_workers: usize,
}

/// Answer to a status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_version: String,
    pub protocol: ProtocolTag,
    pub batch_size: usize,
    pub batch_group_timeout_ms: u64,
    pub num_worker: usize,
    pub num_worker_expanded: usize,
    pub device_map: Vec<i32>,
    pub device_to_expand: Vec<i32>,
    pub connected_clients: usize,
    pub requests_received: u64,
    pub partitions_dispatched: u64,
    pub pending_partitions: usize,
    pub pool: PoolSummary,
}

/// Local view a client keeps of itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub identity: String,
    pub server_url: String,
    pub protocol: ProtocolTag,
    pub client_version: String,
    pub num_request: u64,
    pub num_pending_request: usize,
    pub pending_request: Vec<u64>,
    pub max_concurrency: usize,
    pub timeout_ms: u64,
}
