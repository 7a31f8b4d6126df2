//! Result sink: reassembles partition results into client replies.
//!
//! The sink task owns every pending aggregate. The router registers a request
//! before any of its partitions is dispatched; workers then deliver one result
//! per partition. A request is answered once all partitions arrived, as soon
//! as one of them failed, or with a partial reply when it outlives the
//! aggregation timeout.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use batchline_common::{Envelope, ErrorBody, ErrorKind, Payload};

use crate::worker::PartitionResult;

/// Channel a connection task reads its outbound replies from.
pub type ReplyTx = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub aggregation_timeout: Duration,
    pub sweep_interval: Duration,
}

impl SinkConfig {
    pub fn new(aggregation_timeout_ms: u64, sweep_interval_ms: u64) -> Self {
        Self {
            aggregation_timeout: Duration::from_millis(aggregation_timeout_ms),
            sweep_interval: Duration::from_millis(sweep_interval_ms.max(1)),
        }
    }
}

/// A request whose partitions are about to be dispatched.
#[derive(Debug)]
pub struct Registration {
    pub origin_id: String,
    pub request_id: u64,
    pub expected: u32,
    /// The request was a sequence: reply with the list of all items.
    pub batched: bool,
    pub reply_to: ReplyTx,
}

#[derive(Debug)]
pub enum SinkEvent {
    Register(Registration),
    Result(PartitionResult),
    /// Fail a registered request before all of its results arrived.
    Fail {
        origin_id: String,
        request_id: u64,
        error: ErrorBody,
    },
    /// Number of pending aggregates.
    Pending(oneshot::Sender<usize>),
}

#[derive(Debug, thiserror::Error)]
#[error("Sink task is not running")]
pub struct SinkClosed;

/// Cloneable sender side of the sink.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkEvent>,
}

impl SinkHandle {
    pub async fn register(&self, registration: Registration) -> Result<(), SinkClosed> {
        self.send(SinkEvent::Register(registration)).await
    }

    pub async fn deliver(&self, result: PartitionResult) -> Result<(), SinkClosed> {
        self.send(SinkEvent::Result(result)).await
    }

    pub async fn fail(&self, origin_id: String, request_id: u64, error: ErrorBody) -> Result<(), SinkClosed> {
        self.send(SinkEvent::Fail {
            origin_id,
            request_id,
            error,
        })
        .await
    }

    pub async fn pending(&self) -> Result<usize, SinkClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(SinkEvent::Pending(tx)).await?;
        rx.await.map_err(|_| SinkClosed)
    }

    async fn send(&self, event: SinkEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

struct PendingAggregate {
    expected: u32,
    batched: bool,
    received: BTreeMap<u32, Vec<Payload>>,
    created_at: Instant,
    reply_to: ReplyTx,
}

type AggregateKey = (String, u64);

pub struct Sink {
    config: SinkConfig,
    pending: HashMap<AggregateKey, PendingAggregate>,
    rx: mpsc::Receiver<SinkEvent>,
}

impl Sink {
    pub fn new(config: SinkConfig) -> (Self, SinkHandle) {
        let (tx, rx) = mpsc::channel(1024);
        let sink = Self {
            config,
            pending: HashMap::new(),
            rx,
        };
        (sink, SinkHandle { tx })
    }

    /// Run the sink loop until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        if !self.pending.is_empty() {
            tracing::info!("Sink stopping with {} pending requests", self.pending.len());
        }
    }

    fn handle(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::Register(reg) => {
                let key = (reg.origin_id, reg.request_id);
                let aggregate = PendingAggregate {
                    expected: reg.expected,
                    batched: reg.batched,
                    received: BTreeMap::new(),
                    created_at: Instant::now(),
                    reply_to: reg.reply_to,
                };
                if self.pending.insert(key.clone(), aggregate).is_some() {
                    tracing::warn!("Request {}#{} registered twice, replacing", key.0, key.1);
                }
            }
            SinkEvent::Result(result) => self.accept(result),
            SinkEvent::Fail {
                origin_id,
                request_id,
                error,
            } => {
                if let Some(aggregate) = self.pending.remove(&(origin_id.clone(), request_id)) {
                    let _ = aggregate
                        .reply_to
                        .send(Envelope::error(&origin_id, request_id, &error));
                }
            }
            SinkEvent::Pending(tx) => {
                let _ = tx.send(self.pending.len());
            }
        }
    }

    fn accept(&mut self, result: PartitionResult) {
        let key = (result.key.origin_id, result.key.request_id);
        let index = result.key.partition_index;

        if !self.pending.contains_key(&key) {
            tracing::debug!(
                "Discarding result for unknown or expired request {}#{}",
                key.0,
                key.1
            );
            return;
        }

        let items = match result.outcome {
            Ok(items) => items,
            Err(error) => {
                if let Some(aggregate) = self.pending.remove(&key) {
                    tracing::warn!(
                        "Request {}#{} failed on partition {}: {}",
                        key.0,
                        key.1,
                        index,
                        error.message
                    );
                    let _ = aggregate.reply_to.send(Envelope::error(&key.0, key.1, &error));
                }
                return;
            }
        };

        let Some(aggregate) = self.pending.get_mut(&key) else {
            return;
        };
        if index >= aggregate.expected {
            tracing::warn!(
                "Ignoring partition {} of request {}#{} (expected {})",
                index,
                key.0,
                key.1,
                aggregate.expected
            );
            return;
        }
        if aggregate.received.contains_key(&index) {
            tracing::warn!(
                "Ignoring duplicate partition {} of request {}#{}",
                index,
                key.0,
                key.1
            );
            return;
        }
        aggregate.received.insert(index, items);

        if aggregate.received.len() as u32 == aggregate.expected {
            if let Some(aggregate) = self.pending.remove(&key) {
                finish(&key, aggregate, false);
            }
        }
    }

    /// Force-complete every aggregate older than the aggregation timeout.
    fn sweep(&mut self, now: Instant) {
        let timeout = self.config.aggregation_timeout;
        let expired: Vec<AggregateKey> = self
            .pending
            .iter()
            .filter(|(_, agg)| now.duration_since(agg.created_at) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(aggregate) = self.pending.remove(&key) {
                tracing::warn!(
                    "Request {}#{} timed out with {} of {} partitions",
                    key.0,
                    key.1,
                    aggregate.received.len(),
                    aggregate.expected
                );
                finish(&key, aggregate, true);
            }
        }
    }
}

/// Concatenate the received partitions in index order and reply.
fn finish(key: &AggregateKey, aggregate: PendingAggregate, partial: bool) {
    let (origin_id, request_id) = (key.0.as_str(), key.1);
    let received = aggregate.received.len() as u32;
    let items: Vec<Payload> = aggregate.received.into_values().flatten().collect();

    let payload = if aggregate.batched {
        Payload::collect(items)
    } else {
        match items.into_iter().next() {
            Some(item) => Ok(item),
            None => Payload::collect(Vec::new()),
        }
    };

    let envelope = payload
        .and_then(|payload| {
            if partial {
                Envelope::partial(origin_id, request_id, &payload, received, aggregate.expected)
            } else {
                Envelope::reply(origin_id, request_id, &payload)
            }
        })
        .unwrap_or_else(|e| {
            tracing::error!("Failed to assemble reply for {}#{}: {}", origin_id, request_id, e);
            Envelope::error(
                origin_id,
                request_id,
                &ErrorBody::new(ErrorKind::Internal, e.to_string()),
            )
        });

    if aggregate.reply_to.send(envelope).is_err() {
        tracing::debug!("Client {} went away before request {} completed", origin_id, request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::PartitionKey;
    use batchline_common::EnvelopeKind;
    use serde_json::json;

    fn spawn_sink(timeout_ms: u64) -> (SinkHandle, CancellationToken) {
        let (sink, handle) = Sink::new(SinkConfig::new(timeout_ms, 10));
        let cancel = CancellationToken::new();
        tokio::spawn(sink.run(cancel.clone()));
        (handle, cancel)
    }

    fn result(request_id: u64, index: u32, items: Vec<serde_json::Value>) -> PartitionResult {
        PartitionResult {
            key: PartitionKey {
                origin_id: "client".to_string(),
                request_id,
                partition_index: index,
            },
            outcome: Ok(items.into_iter().map(Payload::from).collect()),
        }
    }

    async fn register(
        sink: &SinkHandle,
        request_id: u64,
        expected: u32,
        batched: bool,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        sink.register(Registration {
            origin_id: "client".to_string(),
            request_id,
            expected,
            batched,
            reply_to: tx,
        })
        .await
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_results_are_reassembled_in_index_order() {
        let (sink, _cancel) = spawn_sink(60_000);
        let mut replies = register(&sink, 7, 3, true).await;

        sink.deliver(result(7, 2, vec![json!(5)])).await.unwrap();
        sink.deliver(result(7, 0, vec![json!(1), json!(2)])).await.unwrap();
        sink.deliver(result(7, 1, vec![json!(3), json!(4)])).await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(reply.request_id, 7);
        assert_eq!(reply.decode_payload().unwrap(), Payload::from(json!([1, 2, 3, 4, 5])));
        assert_eq!(sink.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_request_replies_with_the_item() {
        let (sink, _cancel) = spawn_sink(60_000);
        let mut replies = register(&sink, 1, 1, false).await;

        sink.deliver(result(1, 0, vec![json!({"text": "hi"})])).await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.decode_payload().unwrap(), Payload::from(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_partition_error_fails_whole_request() {
        let (sink, _cancel) = spawn_sink(60_000);
        let mut replies = register(&sink, 2, 2, true).await;

        let failed = PartitionResult {
            key: PartitionKey {
                origin_id: "client".to_string(),
                request_id: 2,
                partition_index: 1,
            },
            outcome: Err(ErrorBody::new(ErrorKind::Inference, "bad input")),
        };
        sink.deliver(failed).await.unwrap();
        // Arrives after the failure and must be discarded.
        sink.deliver(result(2, 0, vec![json!(1)])).await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Error);
        let body: ErrorBody = reply.decode_json().unwrap();
        assert_eq!(body.kind, ErrorKind::Inference);
        assert_eq!(sink.pending().await.unwrap(), 0);
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_range_results_are_ignored() {
        let (sink, _cancel) = spawn_sink(60_000);
        let mut replies = register(&sink, 3, 2, true).await;

        sink.deliver(result(3, 0, vec![json!("a")])).await.unwrap();
        sink.deliver(result(3, 0, vec![json!("dup")])).await.unwrap();
        sink.deliver(result(3, 9, vec![json!("far")])).await.unwrap();
        assert_eq!(sink.pending().await.unwrap(), 1);

        sink.deliver(result(3, 1, vec![json!("b")])).await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.decode_payload().unwrap(), Payload::from(json!(["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_completes_stale_aggregate_as_partial() {
        let (sink, _cancel) = spawn_sink(100);
        let mut replies = register(&sink, 4, 3, true).await;
        sink.deliver(result(4, 1, vec![json!("middle")])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Partial);
        assert_eq!(reply.partition_index, 1);
        assert_eq!(reply.partition_count, 3);
        assert_eq!(reply.decode_payload().unwrap(), Payload::from(json!(["middle"])));

        // Late results for the expired request are dropped.
        sink.deliver(result(4, 0, vec![json!("late")])).await.unwrap();
        assert_eq!(sink.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fail_replies_with_error() {
        let (sink, _cancel) = spawn_sink(60_000);
        let mut replies = register(&sink, 5, 2, true).await;

        sink.fail(
            "client".to_string(),
            5,
            ErrorBody::new(ErrorKind::WorkerUnavailable, "no worker"),
        )
        .await
        .unwrap();

        let body: ErrorBody = replies.recv().await.unwrap().decode_json().unwrap();
        assert_eq!(body.kind, ErrorKind::WorkerUnavailable);
    }
}
