//! Built-in worker that returns its inputs unchanged.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use batchline_common::Payload;

use super::{HookError, InferenceWorker};

#[derive(Debug, Default)]
struct EchoStats {
    calls: AtomicUsize,
    items: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

/// Echo worker used by the default binary and by tests.
///
/// Clones share their call counters, so a test can keep one clone and hand
/// another to the server.
#[derive(Debug, Clone, Default)]
pub struct EchoWorker {
    delay: Duration,
    stats: Arc<EchoStats>,
}

/// Model loaded by [`EchoWorker`].
#[derive(Debug, Clone)]
pub struct EchoModel {
    pub device_id: i32,
    pub name: String,
}

impl EchoWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `predict` call.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Number of `predict` calls so far.
    pub fn calls(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }

    /// Number of items predicted so far.
    pub fn items(&self) -> usize {
        self.stats.items.load(Ordering::SeqCst)
    }

    /// Item count of every `predict` call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.stats
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn model_for_tests(&self) -> EchoModel {
        EchoModel {
            device_id: -1,
            name: "echo".to_string(),
        }
    }
}

#[async_trait]
impl InferenceWorker for EchoWorker {
    type Env = i32;
    type Model = EchoModel;

    async fn setup_env(&self, device_id: i32, _tmp_dir: &Path) -> Result<i32, HookError> {
        Ok(device_id)
    }

    async fn load_model(
        &self,
        device_id: i32,
        _model_dir: &Path,
        model_name: &str,
        _tmp_dir: &Path,
    ) -> Result<EchoModel, HookError> {
        tracing::debug!("Loaded echo model '{}' on device {}", model_name, device_id);
        Ok(EchoModel {
            device_id,
            name: model_name.to_string(),
        })
    }

    async fn predict(&self, _model: &EchoModel, inputs: Vec<Payload>) -> Result<Vec<Payload>, HookError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.items.fetch_add(inputs.len(), Ordering::SeqCst);
        self.stats
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(inputs.len());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(inputs)
    }
}
