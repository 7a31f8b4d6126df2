//! Pool manager: owns every worker handle and its state transitions.
//!
//! Workers report through [`WorkerEvent`]s; the manager folds them into
//! [`WorkerSummary`] entries, marks silent workers dead and publishes a
//! [`UtilizationSample`] on a watch channel after every change. Expansion and
//! squeeze requests arrive as [`PoolCommand`]s.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use batchline_common::{PoolSummary, WorkerState, WorkerSummary};

use crate::config::Config;
use crate::router::RouterHandle;
use crate::sink::SinkHandle;
use crate::worker::{run_worker, InferenceWorker, WorkerContext, WorkerEvent, WorkerEventKind};

/// Load snapshot read by the router and the autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilizationSample {
    /// Workers not yet dead, including starting and draining ones.
    pub alive_workers: usize,
    /// Workers ready or busy.
    pub serving_workers: usize,
    pub busy_workers: usize,
    /// Expanded workers that are alive and not draining.
    pub expanded_workers: usize,
}

impl UtilizationSample {
    /// Busy workers over serving workers, `0.0` when none serve.
    pub fn busy_ratio(&self) -> f64 {
        if self.serving_workers == 0 {
            0.0
        } else {
            self.busy_workers as f64 / self.serving_workers as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_worker: usize,
    pub device_map: Vec<i32>,
    pub tmp_folder: PathBuf,
    pub model_dir: PathBuf,
    pub model_name: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            num_worker: config.workers.num_worker,
            device_map: config.workers.device_map.clone(),
            tmp_folder: config.workers.tmp_folder.clone(),
            model_dir: config.workers.model_dir.clone(),
            model_name: config.workers.model_name.clone(),
            heartbeat_interval: config.workers.heartbeat_interval(),
            heartbeat_timeout: config.workers.heartbeat_timeout(),
        }
    }

    /// Device of baseline worker `index`.
    pub fn device_for(&self, index: usize) -> i32 {
        if self.device_map.is_empty() {
            -1
        } else {
            self.device_map[index % self.device_map.len()]
        }
    }
}

/// Errors from the pool manager.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker {worker_id} failed to start on device {device_id}: {reason}")]
    StartFailed {
        worker_id: u64,
        device_id: i32,
        reason: String,
    },

    #[error("Pool manager is not running")]
    Closed,
}

pub enum PoolCommand {
    /// Start one expanded worker; answered once it is ready or failed.
    Expand {
        device_id: i32,
        done: oneshot::Sender<Result<u64, PoolError>>,
    },
    /// Drain every expanded worker; answered with how many were drained.
    Squeeze { done: oneshot::Sender<usize> },
    Snapshot(oneshot::Sender<PoolSummary>),
}

/// Cloneable handle to the pool manager.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolCommand>,
    samples: watch::Receiver<UtilizationSample>,
}

impl PoolHandle {
    #[cfg(test)]
    pub(crate) fn from_parts(tx: mpsc::Sender<PoolCommand>, samples: watch::Receiver<UtilizationSample>) -> Self {
        Self { tx, samples }
    }

    pub async fn expand(&self, device_id: i32) -> Result<u64, PoolError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Expand { device_id, done })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    pub async fn squeeze(&self) -> Result<usize, PoolError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Squeeze { done })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    pub async fn snapshot(&self) -> Result<PoolSummary, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Snapshot(tx))
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Latest published sample.
    pub fn sample(&self) -> UtilizationSample {
        *self.samples.borrow()
    }

    pub fn samples(&self) -> watch::Receiver<UtilizationSample> {
        self.samples.clone()
    }
}

struct WorkerEntry {
    summary: WorkerSummary,
    last_heartbeat: Instant,
    cancel: CancellationToken,
    abort: AbortHandle,
    /// Pending expansion waiting for this worker to start.
    starting: Option<oneshot::Sender<Result<u64, PoolError>>>,
}

impl WorkerEntry {
    fn state(&self) -> WorkerState {
        self.summary.state
    }

    fn set_state(&mut self, state: WorkerState) {
        // Draining and dead are terminal for state reports.
        match (self.summary.state, state) {
            (WorkerState::Dead, _) => {}
            (WorkerState::Draining, WorkerState::Ready | WorkerState::Busy) => {}
            _ => self.summary.state = state,
        }
    }
}

enum Answer {
    Start(oneshot::Sender<Result<u64, PoolError>>, Result<u64, PoolError>),
    Squeeze(oneshot::Sender<usize>, usize),
}

pub struct PoolManager<W: InferenceWorker> {
    config: PoolConfig,
    worker: Arc<W>,
    router: RouterHandle,
    sink: SinkHandle,
    workers: BTreeMap<u64, WorkerEntry>,
    next_worker_id: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: mpsc::Receiver<PoolCommand>,
    samples: watch::Sender<UtilizationSample>,
    answers: Vec<Answer>,
    cancel: CancellationToken,
}

impl<W: InferenceWorker> PoolManager<W> {
    /// Create the manager and spawn the baseline workers.
    ///
    /// The first sample is published before this returns, so the router sees
    /// the starting workers as alive.
    pub fn new(
        config: PoolConfig,
        worker: Arc<W>,
        router: RouterHandle,
        sink: SinkHandle,
        samples: watch::Sender<UtilizationSample>,
        cancel: CancellationToken,
    ) -> (Self, PoolHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, commands) = mpsc::channel(64);
        let handle = PoolHandle {
            tx,
            samples: samples.subscribe(),
        };

        let mut manager = Self {
            config,
            worker,
            router,
            sink,
            workers: BTreeMap::new(),
            next_worker_id: 0,
            events_tx,
            events_rx,
            commands,
            samples,
            answers: Vec::new(),
            cancel,
        };
        for index in 0..manager.config.num_worker {
            let device_id = manager.config.device_for(index);
            manager.spawn_worker(device_id, false);
        }
        manager.publish();

        (manager, handle)
    }

    pub async fn run(mut self) {
        let mut check = interval(self.config.heartbeat_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some(cmd) = self.commands.recv() => self.on_command(cmd),
                _ = check.tick() => {
                    self.check_heartbeats(Instant::now());
                }
            }
            self.publish();
            self.flush_answers();
        }

        for entry in self.workers.values_mut() {
            entry.cancel.cancel();
        }
        tracing::info!("Pool manager stopped");
    }

    fn spawn_worker(&mut self, device_id: i32, expanded: bool) -> u64 {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let cancel = self.cancel.child_token();
        let ctx = WorkerContext {
            worker_id,
            device_id,
            tmp_dir: self.config.tmp_folder.join(format!("worker-{}", worker_id)),
            model_dir: self.config.model_dir.clone(),
            model_name: self.config.model_name.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            router: self.router.clone(),
            sink: self.sink.clone(),
            events: self.events_tx.clone(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(run_worker(self.worker.clone(), ctx));
        let abort = task.abort_handle();

        // Supervise the task so a panic is reported instead of taking the pool down.
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(()) => None,
                Err(e) if e.is_panic() => Some(panic_message(e.into_panic())),
                Err(_) => Some("worker task aborted".to_string()),
            };
            let _ = events.send(WorkerEvent {
                worker_id,
                kind: WorkerEventKind::Exited(reason),
            });
        });

        tracing::debug!(worker_id, device_id, expanded, "Spawned worker");
        self.workers.insert(
            worker_id,
            WorkerEntry {
                summary: WorkerSummary {
                    worker_id,
                    device_id,
                    state: WorkerState::Starting,
                    expanded,
                    started_at: Utc::now(),
                    batches_processed: 0,
                    last_error: None,
                },
                last_heartbeat: Instant::now(),
                cancel,
                abort,
                starting: None,
            },
        );
        worker_id
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let worker_id = event.worker_id;
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        entry.last_heartbeat = Instant::now();
        let device_id = entry.summary.device_id;
        let mut start_result = None;
        let mut remove = false;

        match event.kind {
            WorkerEventKind::Started => {
                entry.set_state(WorkerState::Ready);
                start_result = Some(Ok(worker_id));
            }
            WorkerEventKind::StartFailed(reason) => {
                entry.set_state(WorkerState::Dead);
                entry.summary.last_error = Some(reason.clone());
                start_result = Some(Err(PoolError::StartFailed {
                    worker_id,
                    device_id,
                    reason,
                }));
            }
            WorkerEventKind::Idle => entry.set_state(WorkerState::Ready),
            WorkerEventKind::Busy => entry.set_state(WorkerState::Busy),
            WorkerEventKind::BatchDone => entry.summary.batches_processed += 1,
            WorkerEventKind::Heartbeat => {}
            WorkerEventKind::Exited(reason) => {
                if let Some(reason) = &reason {
                    if entry.state().is_alive() {
                        tracing::error!(worker_id, "Worker died: {}", reason);
                    }
                }
                entry.set_state(WorkerState::Dead);
                if entry.summary.last_error.is_none() {
                    entry.summary.last_error = reason.clone();
                }
                start_result = Some(Err(PoolError::StartFailed {
                    worker_id,
                    device_id,
                    reason: reason.unwrap_or_else(|| "worker exited".to_string()),
                }));
                // Expanded slots are transient; baseline entries stay for status.
                remove = entry.summary.expanded;
            }
        }

        if let Some(result) = start_result {
            self.answer_start(worker_id, result);
        }
        if remove {
            self.workers.remove(&worker_id);
        }
    }

    /// Queue the answer of a pending expansion, if the worker has one.
    fn answer_start(&mut self, worker_id: u64, result: Result<u64, PoolError>) {
        if let Some(done) = self.workers.get_mut(&worker_id).and_then(|e| e.starting.take()) {
            self.answers.push(Answer::Start(done, result));
        }
    }

    /// Send queued answers; called after the sample reflecting them is published.
    fn flush_answers(&mut self) {
        for answer in self.answers.drain(..) {
            match answer {
                Answer::Start(done, result) => {
                    let _ = done.send(result);
                }
                Answer::Squeeze(done, drained) => {
                    let _ = done.send(drained);
                }
            }
        }
    }

    fn on_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Expand { device_id, done } => {
                let worker_id = self.spawn_worker(device_id, true);
                tracing::info!(worker_id, device_id, "Expanding worker pool");
                if let Some(entry) = self.workers.get_mut(&worker_id) {
                    entry.starting = Some(done);
                }
            }
            PoolCommand::Squeeze { done } => {
                let mut drained = 0;
                for entry in self.workers.values_mut() {
                    let state = entry.state();
                    if entry.summary.expanded && state.is_alive() && state != WorkerState::Draining {
                        entry.set_state(WorkerState::Draining);
                        entry.cancel.cancel();
                        drained += 1;
                    }
                }
                tracing::info!("Squeezing worker pool: draining {} expanded workers", drained);
                self.answers.push(Answer::Squeeze(done, drained));
            }
            PoolCommand::Snapshot(tx) => {
                let _ = tx.send(self.summary());
            }
        }
    }

    /// Mark workers dead that have been silent longer than the heartbeat timeout.
    fn check_heartbeats(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.config.heartbeat_timeout;
        let mut stale = vec![];

        for (id, entry) in self.workers.iter_mut() {
            if !entry.state().is_alive() {
                continue;
            }
            let silent = now.saturating_duration_since(entry.last_heartbeat);
            if silent > timeout {
                tracing::warn!(
                    "Marking worker {} dead (no heartbeat for {}ms)",
                    id,
                    silent.as_millis()
                );
                entry.abort.abort();
                entry.set_state(WorkerState::Dead);
                entry.summary.last_error = Some("heartbeat timeout".to_string());
                stale.push(*id);
            }
        }

        for id in &stale {
            let device_id = self.workers.get(id).map_or(-1, |e| e.summary.device_id);
            self.answer_start(
                *id,
                Err(PoolError::StartFailed {
                    worker_id: *id,
                    device_id,
                    reason: "heartbeat timeout".to_string(),
                }),
            );
        }
        stale
    }

    fn sample(&self) -> UtilizationSample {
        let mut sample = UtilizationSample::default();
        for entry in self.workers.values() {
            let state = entry.state();
            if state.is_alive() {
                sample.alive_workers += 1;
                if entry.summary.expanded && state != WorkerState::Draining {
                    sample.expanded_workers += 1;
                }
            }
            if state.is_serving() {
                sample.serving_workers += 1;
            }
            if state == WorkerState::Busy {
                sample.busy_workers += 1;
            }
        }
        sample
    }

    fn publish(&self) {
        let next = self.sample();
        self.samples.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn summary(&self) -> PoolSummary {
        let sample = self.sample();
        PoolSummary {
            workers: self.workers.values().map(|e| e.summary.clone()).collect(),
            baseline_workers: self
                .workers
                .values()
                .filter(|e| !e.summary.expanded && e.state().is_alive())
                .count(),
            expanded_workers: sample.expanded_workers,
            busy_workers: sample.busy_workers,
            serving_workers: sample.serving_workers,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}
