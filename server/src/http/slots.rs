//! Gateway concurrency slots with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::GatewayError;

pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    retries: u32,
    gap: Duration,
}

impl SlotPool {
    pub fn new(permits: usize, retries: u32, gap: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            retries,
            gap,
        }
    }

    /// Take a slot, retrying up to `retries` times with a jittered gap.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => {
                    return Err(GatewayError::Internal("slot pool closed".to_string()));
                }
                Err(TryAcquireError::NoPermits) if attempt >= self.retries => {
                    tracing::warn!("No free gateway slot after {} retries", attempt);
                    return Err(GatewayError::CapacityExceeded(self.retries));
                }
                Err(TryAcquireError::NoPermits) => {
                    attempt += 1;
                    tokio::time::sleep(self.jittered_gap()).await;
                }
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Retry gap scaled by a random factor in `[0.9, 1.1]`.
    fn jittered_gap(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        self.gap.mul_f64(factor)
    }
}
