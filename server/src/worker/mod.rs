//! Worker hosts: the tasks that run inference.
//!
//! A worker host binds one device, prepares its environment and model through
//! the [`InferenceWorker`] hooks, then repeatedly pulls a [`WorkGroup`] from
//! the router, runs `predict` once on all of its items and sends one
//! [`PartitionResult`] per partition to the sink.

mod echo;
mod host;

pub use echo::{EchoModel, EchoWorker};
pub use host::{run_worker, WorkerContext, WorkerEvent, WorkerEventKind};

use std::path::Path;

use async_trait::async_trait;

use batchline_common::{ErrorBody, Payload};

/// Errors raised by inference hooks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Environment setup failed: {0}")]
    Setup(String),

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Inference failed: {0}")]
    Predict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model-specific behaviour plugged into every worker host.
///
/// `setup_env` and `load_model` run once per worker at startup; a failure in
/// either is fatal to that worker only. `predict` receives every item of a
/// group at once and must return exactly one output per input, in order.
///
/// Hooks run on the async runtime and must not block it. CPU-bound or
/// synchronous model code belongs in `tokio::task::spawn_blocking`;
/// otherwise the worker stops heartbeating and is marked dead once
/// `heartbeat_timeout_ms` passes.
#[async_trait]
pub trait InferenceWorker: Send + Sync + 'static {
    /// Per-worker environment produced by `setup_env`.
    type Env: Send + 'static;
    /// Loaded model shared by every `predict` call of one worker.
    type Model: Send + Sync + 'static;

    async fn setup_env(&self, device_id: i32, tmp_dir: &Path) -> Result<Self::Env, HookError>;

    async fn load_model(
        &self,
        env: Self::Env,
        model_dir: &Path,
        model_name: &str,
        tmp_dir: &Path,
    ) -> Result<Self::Model, HookError>;

    async fn predict(
        &self,
        model: &Self::Model,
        inputs: Vec<Payload>,
    ) -> Result<Vec<Payload>, HookError>;
}

/// Routing information of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub origin_id: String,
    pub request_id: u64,
    pub partition_index: u32,
}

/// One partition handed to a worker.
#[derive(Debug, Clone)]
pub struct PartitionWork {
    pub key: PartitionKey,
    /// Individual inference items of this partition.
    pub items: Vec<Payload>,
}

impl PartitionWork {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// Partitions coalesced into one `predict` call.
#[derive(Debug, Default)]
pub struct WorkGroup {
    pub partitions: Vec<PartitionWork>,
}

impl WorkGroup {
    pub fn item_count(&self) -> usize {
        self.partitions.iter().map(PartitionWork::item_count).sum()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Outcome of one partition, sent by a worker to the sink.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub key: PartitionKey,
    pub outcome: Result<Vec<Payload>, ErrorBody>,
}
