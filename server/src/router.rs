//! Frontend router: partitions requests and hands groups to idle workers.
//!
//! Dispatch is pull-based. An idle worker sends a pull carrying a oneshot
//! sender; the router answers it with the next ready group from the
//! [`BatchQueue`]. A worker that stopped waiting simply dropped its receiver,
//! so the group goes to the next waiting worker without ever having been
//! delivered twice.

use std::collections::{HashSet, VecDeque};
use std::future::pending;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use batchline_common::{Envelope, ErrorBody, ErrorKind, Payload};

use crate::batch_queue::{BatchQueue, BatchQueueConfig};
use crate::pool::UtilizationSample;
use crate::sink::{Registration, ReplyTx, SinkHandle};
use crate::worker::{PartitionKey, PartitionWork, WorkGroup};

/// Errors from the router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No worker available")]
    NoWorkers,
    #[error("Too many pending partitions (limit {0})")]
    QueueFull(usize),
    #[error("Router is not running")]
    Closed,
}

impl RouterError {
    pub fn to_body(&self) -> ErrorBody {
        let kind = match self {
            RouterError::NoWorkers | RouterError::QueueFull(_) => ErrorKind::WorkerUnavailable,
            RouterError::Closed => ErrorKind::Internal,
        };
        ErrorBody::new(kind, self.to_string())
    }
}

/// A decoded client request.
#[derive(Debug)]
pub struct InferenceRequest {
    pub origin_id: String,
    pub request_id: u64,
    pub payload: Payload,
    /// Where the final reply for this request goes.
    pub reply_to: ReplyTx,
}

/// Router counters reported in the server status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterStats {
    pub requests_received: u64,
    pub partitions_dispatched: u64,
    pub pending_partitions: usize,
    pub waiting_workers: usize,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub queue: BatchQueueConfig,
    pub max_pending_partitions: usize,
}

enum RouterCommand {
    Submit(InferenceRequest),
    Pull {
        worker_id: u64,
        reply: oneshot::Sender<WorkGroup>,
    },
    Stats(oneshot::Sender<RouterStats>),
}

/// Cloneable sender side of the router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    pub async fn submit(&self, request: InferenceRequest) -> Result<(), RouterError> {
        self.tx
            .send(RouterCommand::Submit(request))
            .await
            .map_err(|_| RouterError::Closed)
    }

    /// Ask for the next group; it is sent on `reply` once one is ready.
    pub async fn pull(&self, worker_id: u64, reply: oneshot::Sender<WorkGroup>) -> Result<(), RouterError> {
        self.tx
            .send(RouterCommand::Pull { worker_id, reply })
            .await
            .map_err(|_| RouterError::Closed)
    }

    /// Handle with no router behind it; every pull's reply sender comes out
    /// of the returned channel.
    #[cfg(test)]
    pub(crate) fn pulls_for_tests() -> (Self, mpsc::UnboundedReceiver<oneshot::Sender<WorkGroup>>) {
        let (tx, mut rx) = mpsc::channel(8);
        let (pulls_tx, pulls) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let RouterCommand::Pull { reply, .. } = cmd {
                    if pulls_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
        });
        (Self { tx }, pulls)
    }

    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Stats(tx))
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }
}

pub struct FrontendRouter {
    queue: BatchQueue,
    max_pending_partitions: usize,
    sink: SinkHandle,
    samples: watch::Receiver<UtilizationSample>,
    waiting: VecDeque<(u64, oneshot::Sender<WorkGroup>)>,
    rx: mpsc::Receiver<RouterCommand>,
    stats: RouterStats,
}

impl FrontendRouter {
    pub fn new(
        config: RouterConfig,
        sink: SinkHandle,
        samples: watch::Receiver<UtilizationSample>,
    ) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::channel(1024);
        let router = Self {
            queue: BatchQueue::new(config.queue),
            max_pending_partitions: config.max_pending_partitions,
            sink,
            samples,
            waiting: VecDeque::new(),
            rx,
            stats: RouterStats::default(),
        };
        (router, RouterHandle { tx })
    }

    /// Run the router loop until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut pool_alive = true;

        loop {
            // Without a waiting worker a ready group just stays queued.
            let deadline = if self.waiting.is_empty() {
                None
            } else {
                self.queue.next_deadline()
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                changed = self.samples.changed(), if pool_alive => {
                    if changed.is_err() {
                        pool_alive = false;
                    }
                }
                _ = wait_until(deadline) => {}
            }

            self.fail_if_no_workers().await;
            self.dispatch();
        }

        tracing::debug!("Router stopped with {} queued partitions", self.queue.len());
    }

    async fn handle(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Submit(request) => self.submit(request).await,
            RouterCommand::Pull { worker_id, reply } => {
                self.waiting.push_back((worker_id, reply));
            }
            RouterCommand::Stats(tx) => {
                let mut stats = self.stats.clone();
                stats.pending_partitions = self.queue.len();
                stats.waiting_workers = self.waiting.iter().filter(|(_, tx)| !tx.is_closed()).count();
                let _ = tx.send(stats);
            }
        }
    }

    async fn submit(&mut self, request: InferenceRequest) {
        self.stats.requests_received += 1;
        let InferenceRequest {
            origin_id,
            request_id,
            payload,
            reply_to,
        } = request;

        let sequence_len = payload.sequence_len();
        if sequence_len == Some(0) {
            let reply = Envelope::reply(&origin_id, request_id, &payload)
                .unwrap_or_else(|e| Envelope::error(&origin_id, request_id, &ErrorBody::from(&e)));
            let _ = reply_to.send(reply);
            return;
        }

        if self.samples.borrow().alive_workers == 0 {
            reject(&reply_to, &origin_id, request_id, &RouterError::NoWorkers);
            return;
        }

        let class = payload.protocol();
        let batch_size = self.queue.config().batch_size.max(1);
        let partitions = sequence_len.map_or(1, |len| len.div_ceil(batch_size));
        if partitions > self.max_pending_partitions.saturating_sub(self.queue.len()) {
            tracing::warn!(
                "Rejecting request {}#{}: {} partitions queued",
                origin_id,
                request_id,
                self.queue.len()
            );
            reject(
                &reply_to,
                &origin_id,
                request_id,
                &RouterError::QueueFull(self.max_pending_partitions),
            );
            return;
        }

        let chunks = payload.chunks(batch_size);
        let batched = sequence_len.is_some();
        let registration = Registration {
            origin_id: origin_id.clone(),
            request_id,
            expected: chunks.len() as u32,
            batched,
            reply_to: reply_to.clone(),
        };
        if self.sink.register(registration).await.is_err() {
            reject(&reply_to, &origin_id, request_id, &RouterError::Closed);
            return;
        }

        tracing::debug!(
            "Request {}#{} split into {} partitions",
            origin_id,
            request_id,
            chunks.len()
        );

        let now = Instant::now();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let work = PartitionWork {
                key: PartitionKey {
                    origin_id: origin_id.clone(),
                    request_id,
                    partition_index: index as u32,
                },
                items: chunk.into_items(batched),
            };
            self.queue.push(class, work, now);
        }
    }

    /// Hand ready groups to waiting workers, oldest pull first.
    fn dispatch(&mut self) {
        self.waiting.retain(|(_, tx)| !tx.is_closed());
        let now = Instant::now();

        while !self.waiting.is_empty() {
            let Some(mut ready) = self.queue.take_ready(now) else {
                break;
            };
            loop {
                let Some((worker_id, reply)) = self.waiting.pop_front() else {
                    self.queue.requeue(ready);
                    return;
                };
                let partitions = ready.group.len();
                let items = ready.group.item_count();
                match reply.send(ready.group) {
                    Ok(()) => {
                        self.stats.partitions_dispatched += partitions as u64;
                        tracing::debug!(
                            "Dispatched {} partitions ({} items) to worker {}",
                            partitions,
                            items,
                            worker_id
                        );
                        break;
                    }
                    Err(group) => {
                        tracing::debug!(
                            "Worker {} stopped waiting, handing group to the next worker",
                            worker_id
                        );
                        ready.group = group;
                    }
                }
            }
        }
    }

    /// Fail every queued request once no worker is left to run it.
    async fn fail_if_no_workers(&mut self) {
        if self.queue.is_empty() || self.samples.borrow().alive_workers > 0 {
            return;
        }

        let mut failed = HashSet::new();
        for work in self.queue.drain() {
            failed.insert((work.key.origin_id, work.key.request_id));
        }
        tracing::error!("No live workers, failing {} queued requests", failed.len());

        let body = RouterError::NoWorkers.to_body();
        for (origin_id, request_id) in failed {
            if self.sink.fail(origin_id, request_id, body.clone()).await.is_err() {
                break;
            }
        }
    }
}

fn reject(reply_to: &ReplyTx, origin_id: &str, request_id: u64, error: &RouterError) {
    let _ = reply_to.send(Envelope::error(origin_id, request_id, &error.to_body()));
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
