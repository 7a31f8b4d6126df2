//! Autoscaler: grows and shrinks the expanded part of the worker pool.
//!
//! Every poll the controller records the pool busy ratio in a sliding window.
//! A ratio above the threshold for `duration_expand` adds one worker on the
//! next expansion device; a ratio at or below it for `duration_squeeze`
//! drains every expanded worker at once. Baseline workers are never touched.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ScalingConfig;
use crate::pool::{PoolError, PoolHandle};

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Upper bound on expanded workers; `0` disables the autoscaler.
    pub max_expanded: usize,
    pub device_to_expand: Vec<i32>,
    pub busy_util_threshold: f64,
    pub duration_expand: Duration,
    pub duration_squeeze: Duration,
    pub poll_interval: Duration,
}

impl AutoscalerConfig {
    pub fn from_config(config: &ScalingConfig) -> Self {
        Self {
            max_expanded: config.num_worker_expanded,
            device_to_expand: config.device_to_expand.clone(),
            busy_util_threshold: config.busy_util_threshold,
            duration_expand: Duration::from_millis(config.duration_expand_ms),
            duration_squeeze: Duration::from_millis(config.duration_squeeze_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    fn horizon(&self) -> Duration {
        self.duration_expand.max(self.duration_squeeze)
    }
}

/// Owned autoscaler with an explicit lifecycle.
pub struct Autoscaler {
    config: AutoscalerConfig,
    pool: PoolHandle,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Autoscaler {
    pub fn new(config: AutoscalerConfig, pool: PoolHandle) -> Self {
        Self {
            config,
            pool,
            cancel: None,
            task: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.max_expanded > 0 && !self.config.device_to_expand.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the control loop. Does nothing when disabled or already running.
    pub fn start(&mut self) {
        if !self.is_enabled() {
            tracing::info!("Autoscaler disabled");
            return;
        }
        if self.is_running() {
            return;
        }

        tracing::info!(
            max_expanded = self.config.max_expanded,
            threshold = self.config.busy_util_threshold,
            "Autoscaler started"
        );
        let cancel = CancellationToken::new();
        let control = ControlLoop::new(self.config.clone(), self.pool.clone());
        self.task = Some(tokio::spawn(control.run(cancel.clone())));
        self.cancel = Some(cancel);
    }

    /// Stop the control loop and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::info!("Autoscaler stopped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operation {
    Expand(i32),
    Squeeze,
}

struct ControlLoop {
    config: AutoscalerConfig,
    pool: PoolHandle,
    window: VecDeque<(Instant, f64)>,
    cursor: usize,
    in_flight: Option<JoinHandle<Result<(), PoolError>>>,
}

impl ControlLoop {
    fn new(config: AutoscalerConfig, pool: PoolHandle) -> Self {
        Self {
            config,
            pool,
            window: VecDeque::new(),
            cursor: 0,
            in_flight: None,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(Instant::now()).await,
            }
        }

        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }

    async fn tick(&mut self, now: Instant) {
        if self.in_flight.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        if let Some(task) = self.in_flight.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Autoscaler operation failed: {}", e),
                Err(e) => tracing::warn!("Autoscaler operation aborted: {}", e),
            }
            // Each operation needs a fresh sustained period.
            self.window.clear();
        }

        let sample = self.pool.sample();
        self.record(now, sample.busy_ratio());

        if let Some(op) = self.evaluate(now, sample.expanded_workers) {
            self.launch(op);
        }
    }

    /// Append a sample, keeping the newest one that is at least `horizon` old
    /// so a condition can be seen holding for the whole horizon.
    fn record(&mut self, now: Instant, ratio: f64) {
        self.window.push_back((now, ratio));
        let horizon = self.config.horizon();
        while let Some((at, _)) = self.window.get(1) {
            if now.saturating_duration_since(*at) >= horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// True when every sample of the last `duration` satisfies `pred`.
    fn sustained(&self, now: Instant, duration: Duration, pred: impl Fn(f64) -> bool) -> bool {
        let mut since = None;
        for (at, ratio) in self.window.iter().rev() {
            if !pred(*ratio) {
                break;
            }
            since = Some(*at);
        }
        since.is_some_and(|since| now.saturating_duration_since(since) >= duration)
    }

    fn evaluate(&self, now: Instant, expanded: usize) -> Option<Operation> {
        let threshold = self.config.busy_util_threshold;

        if expanded < self.config.max_expanded
            && self.sustained(now, self.config.duration_expand, |r| r > threshold)
        {
            let devices = &self.config.device_to_expand;
            let device_id = devices[self.cursor % devices.len()];
            return Some(Operation::Expand(device_id));
        }

        if expanded > 0 && self.sustained(now, self.config.duration_squeeze, |r| r <= threshold) {
            return Some(Operation::Squeeze);
        }

        None
    }

    fn launch(&mut self, op: Operation) {
        let pool = self.pool.clone();
        let task = match op {
            Operation::Expand(device_id) => {
                self.cursor += 1;
                tracing::info!(device_id, "Autoscaler expanding pool");
                tokio::spawn(async move { pool.expand(device_id).await.map(|_| ()) })
            }
            Operation::Squeeze => {
                self.cursor = 0;
                tracing::info!("Autoscaler squeezing pool");
                tokio::spawn(async move { pool.squeeze().await.map(|_| ()) })
            }
        };
        self.in_flight = Some(task);
    }
}
