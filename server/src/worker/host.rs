//! Worker host task.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use batchline_common::{ErrorBody, ErrorKind};

use super::{HookError, InferenceWorker, PartitionResult, WorkGroup};
use crate::router::RouterHandle;
use crate::sink::SinkHandle;

/// Everything a worker host needs, handed over by the pool manager.
pub struct WorkerContext {
    pub worker_id: u64,
    pub device_id: i32,
    pub tmp_dir: PathBuf,
    pub model_dir: PathBuf,
    pub model_name: String,
    pub heartbeat_interval: Duration,
    pub router: RouterHandle,
    pub sink: SinkHandle,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Cancelled by the pool manager to drain this worker.
    pub cancel: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, kind: WorkerEventKind) {
        let _ = self.events.send(WorkerEvent {
            worker_id: self.worker_id,
            kind,
        });
    }
}

/// State report from a worker host to the pool manager.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker_id: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// Environment and model are ready.
    Started,
    StartFailed(String),
    /// Waiting for a group.
    Idle,
    /// Running `predict`.
    Busy,
    /// A group was processed and its results handed to the sink.
    BatchDone,
    Heartbeat,
    /// The task ended; carries the reason when it did not end normally.
    Exited(Option<String>),
}

/// Drive `fut` to completion, emitting a heartbeat every tick while it runs.
async fn with_heartbeat<F: Future>(ctx: &WorkerContext, ticker: &mut Interval, fut: F) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = ticker.tick() => ctx.emit(WorkerEventKind::Heartbeat),
        }
    }
}

/// Run one worker host until it is cancelled or its peers go away.
pub async fn run_worker<W: InferenceWorker>(worker: Arc<W>, ctx: WorkerContext) {
    let mut ticker = interval(ctx.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let model = match with_heartbeat(&ctx, &mut ticker, start(worker.as_ref(), &ctx)).await {
        Ok(model) => model,
        Err(e) => {
            tracing::error!(
                worker_id = ctx.worker_id,
                device_id = ctx.device_id,
                "Worker failed to start: {}",
                e
            );
            ctx.emit(WorkerEventKind::StartFailed(e.to_string()));
            return;
        }
    };

    tracing::info!(
        worker_id = ctx.worker_id,
        device_id = ctx.device_id,
        "Worker ready"
    );
    ctx.emit(WorkerEventKind::Started);

    'serve: loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        ctx.emit(WorkerEventKind::Idle);
        let (tx, mut rx) = oneshot::channel();
        if ctx.router.pull(ctx.worker_id, tx).await.is_err() {
            break;
        }

        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            group = with_heartbeat(&ctx, &mut ticker, &mut rx) => Some(group),
        };
        let group = match received {
            Some(Ok(group)) => group,
            Some(Err(_)) => break,
            // Closing makes the router hand a later group to someone else; a
            // group it already sent is still ours to run.
            None => {
                rx.close();
                match rx.try_recv() {
                    Ok(group) => group,
                    Err(_) => break,
                }
            }
        };
        if group.is_empty() {
            continue;
        }

        ctx.emit(WorkerEventKind::Busy);
        tracing::debug!(
            worker_id = ctx.worker_id,
            partitions = group.len(),
            items = group.item_count(),
            "Running batch"
        );

        let model = &model;
        let results = with_heartbeat(&ctx, &mut ticker, process_group(worker.as_ref(), model, group)).await;
        for result in results {
            if ctx.sink.deliver(result).await.is_err() {
                break 'serve;
            }
        }
        ctx.emit(WorkerEventKind::BatchDone);
    }

    tracing::info!(worker_id = ctx.worker_id, "Worker exiting");
}

async fn start<W: InferenceWorker>(worker: &W, ctx: &WorkerContext) -> Result<W::Model, HookError> {
    tokio::fs::create_dir_all(&ctx.tmp_dir).await?;
    let env = worker.setup_env(ctx.device_id, &ctx.tmp_dir).await?;
    worker
        .load_model(env, &ctx.model_dir, &ctx.model_name, &ctx.tmp_dir)
        .await
}

/// Run `predict` once on every item of the group and split the outputs back
/// into per-partition results.
async fn process_group<W: InferenceWorker>(
    worker: &W,
    model: &W::Model,
    group: WorkGroup,
) -> Vec<PartitionResult> {
    let mut keys = Vec::with_capacity(group.len());
    let mut counts = Vec::with_capacity(group.len());
    let mut inputs = Vec::with_capacity(group.item_count());
    for partition in group.partitions {
        keys.push(partition.key);
        counts.push(partition.items.len());
        inputs.extend(partition.items);
    }
    let total = inputs.len();

    let error = match worker.predict(model, inputs).await {
        Ok(outputs) if outputs.len() == total => {
            let mut outputs = outputs.into_iter();
            return keys
                .into_iter()
                .zip(counts)
                .map(|(key, n)| PartitionResult {
                    key,
                    outcome: Ok(outputs.by_ref().take(n).collect()),
                })
                .collect();
        }
        Ok(outputs) => ErrorBody::new(
            ErrorKind::Inference,
            format!("predict returned {} outputs for {} inputs", outputs.len(), total),
        ),
        Err(e) => ErrorBody::new(ErrorKind::Inference, e.to_string()),
    };

    tracing::warn!("Batch of {} items failed: {}", total, error.message);
    keys.into_iter()
        .map(|key| PartitionResult {
            key,
            outcome: Err(error.clone()),
        })
        .collect()
}
