//! Coalescing queue of partitions waiting for a worker.
//!
//! Partitions are kept per coalescing class (the payload protocol) in FIFO
//! order. A group is the longest FIFO prefix of one class whose item count
//! stays within `batch_size`; partitions are never split across groups.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use batchline_common::ProtocolTag;

use crate::worker::{PartitionWork, WorkGroup};

/// Configuration for the batch queue.
#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Maximum number of items in one group.
    pub batch_size: usize,
    /// Maximum time the oldest partition of a partial group waits.
    pub batch_timeout: Duration,
}

impl BatchQueueConfig {
    pub fn new(batch_size: usize, batch_timeout_ms: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout: Duration::from_millis(batch_timeout_ms),
        }
    }
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self::new(10, 5)
    }
}

struct QueuedPartition {
    work: PartitionWork,
    enqueued_at: Instant,
}

/// A group taken from the queue, with what is needed to put it back.
pub struct ReadyGroup {
    pub class: ProtocolTag,
    pub enqueued_at: Instant,
    pub group: WorkGroup,
}

/// Per-class queue holding pending partitions.
#[derive(Default)]
struct ClassQueue {
    partitions: VecDeque<QueuedPartition>,
}

impl ClassQueue {
    fn oldest(&self) -> Option<Instant> {
        self.partitions.front().map(|p| p.enqueued_at)
    }

    /// Number of partitions in the next group and whether that group is full.
    fn next_group(&self, batch_size: usize) -> (usize, bool) {
        let mut items = 0;
        let mut count = 0;
        for queued in &self.partitions {
            let n = queued.work.item_count();
            if count > 0 && items + n > batch_size {
                return (count, true);
            }
            items += n;
            count += 1;
            if items >= batch_size {
                return (count, true);
            }
        }
        (count, false)
    }

    fn is_ready(&self, now: Instant, config: &BatchQueueConfig) -> bool {
        let Some(oldest) = self.oldest() else {
            return false;
        };
        self.next_group(config.batch_size).1 || now.duration_since(oldest) >= config.batch_timeout
    }
}

/// Main batch queue, owned by the router task.
pub struct BatchQueue {
    config: BatchQueueConfig,
    queues: HashMap<ProtocolTag, ClassQueue>,
    pending: usize,
}

impl BatchQueue {
    pub fn new(config: BatchQueueConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
            pending: 0,
        }
    }

    pub fn config(&self) -> &BatchQueueConfig {
        &self.config
    }

    /// Number of queued partitions across all classes.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn push(&mut self, class: ProtocolTag, work: PartitionWork, now: Instant) {
        self.queues
            .entry(class)
            .or_default()
            .partitions
            .push_back(QueuedPartition {
                work,
                enqueued_at: now,
            });
        self.pending += 1;
    }

    /// Take the next group that is full or whose oldest partition timed out.
    ///
    /// When several classes are ready, the one that waited longest goes first.
    pub fn take_ready(&mut self, now: Instant) -> Option<ReadyGroup> {
        let class = self
            .queues
            .iter()
            .filter(|(_, q)| q.is_ready(now, &self.config))
            .min_by_key(|(_, q)| q.oldest())
            .map(|(class, _)| *class)?;

        let queue = self.queues.get_mut(&class)?;
        let enqueued_at = queue.oldest()?;
        let (count, _) = queue.next_group(self.config.batch_size);
        let partitions: Vec<PartitionWork> = queue.partitions.drain(..count).map(|q| q.work).collect();
        self.pending -= partitions.len();

        Some(ReadyGroup {
            class,
            enqueued_at,
            group: WorkGroup { partitions },
        })
    }

    /// Put a group that could not be delivered back at the head of its class.
    pub fn requeue(&mut self, ready: ReadyGroup) {
        let queue = self.queues.entry(ready.class).or_default();
        self.pending += ready.group.partitions.len();
        for work in ready.group.partitions.into_iter().rev() {
            queue.partitions.push_front(QueuedPartition {
                work,
                enqueued_at: ready.enqueued_at,
            });
        }
    }

    /// Earliest instant at which a partial group times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(ClassQueue::oldest)
            .min()
            .map(|oldest| oldest + self.config.batch_timeout)
    }

    /// Remove every queued partition.
    pub fn drain(&mut self) -> Vec<PartitionWork> {
        self.pending = 0;
        self.queues
            .values_mut()
            .flat_map(|q| q.partitions.drain(..).map(|p| p.work))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::PartitionKey;
    use batchline_common::Payload;
    use serde_json::json;

    fn work(request_id: u64, items: usize) -> PartitionWork {
        PartitionWork {
            key: PartitionKey {
                origin_id: "client".to_string(),
                request_id,
                partition_index: 0,
            },
            items: (0..items).map(|i| Payload::from(json!(i))).collect(),
        }
    }

    fn queue(batch_size: usize, timeout_ms: u64) -> BatchQueue {
        BatchQueue::new(BatchQueueConfig::new(batch_size, timeout_ms))
    }

    fn ids(group: &WorkGroup) -> Vec<u64> {
        group.partitions.iter().map(|p| p.key.request_id).collect()
    }

    #[tokio::test]
    async fn test_full_partition_is_ready_immediately() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        q.push(ProtocolTag::Obj, work(1, 10), now);

        let ready = q.take_ready(now).unwrap();
        assert_eq!(ids(&ready.group), vec![1]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_partial_group_waits_for_timeout() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        q.push(ProtocolTag::Obj, work(1, 4), now);

        assert!(q.take_ready(now).is_none());
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(5)));

        let later = now + Duration::from_millis(5);
        let ready = q.take_ready(later).unwrap();
        assert_eq!(ready.group.item_count(), 4);
    }

    #[tokio::test]
    async fn test_greedy_prefix_never_splits_partitions() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        for id in 1..=4 {
            q.push(ProtocolTag::Obj, work(id, 3), now);
        }

        // 3 + 3 + 3 fits; the fourth would exceed the batch size.
        let first = q.take_ready(now).unwrap();
        assert_eq!(ids(&first.group), vec![1, 2, 3]);
        assert_eq!(first.group.item_count(), 9);

        assert!(q.take_ready(now).is_none());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_neighbours_go_out_one_by_one() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        q.push(ProtocolTag::Obj, work(1, 6), now);
        q.push(ProtocolTag::Obj, work(2, 6), now);

        assert_eq!(ids(&q.take_ready(now).unwrap().group), vec![1]);
        let later = now + Duration::from_millis(5);
        assert_eq!(ids(&q.take_ready(later).unwrap().group), vec![2]);
    }

    #[tokio::test]
    async fn test_classes_are_not_mixed() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        q.push(ProtocolTag::Obj, work(1, 2), now);
        q.push(ProtocolTag::Numpy, work(2, 2), now + Duration::from_millis(1));

        let later = now + Duration::from_millis(10);
        let first = q.take_ready(later).unwrap();
        assert_eq!(first.class, ProtocolTag::Obj);
        assert_eq!(ids(&first.group), vec![1]);
        let second = q.take_ready(later).unwrap();
        assert_eq!(second.class, ProtocolTag::Numpy);
        assert_eq!(ids(&second.group), vec![2]);
    }

    #[tokio::test]
    async fn test_requeue_restores_order() {
        let mut q = queue(4, 5);
        let now = Instant::now();
        for id in 1..=3 {
            q.push(ProtocolTag::Obj, work(id, 2), now);
        }

        let ready = q.take_ready(now).unwrap();
        assert_eq!(ids(&ready.group), vec![1, 2]);
        q.requeue(ready);
        assert_eq!(q.len(), 3);

        let again = q.take_ready(now).unwrap();
        assert_eq!(ids(&again.group), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drain_empties_all_classes() {
        let mut q = queue(10, 5);
        let now = Instant::now();
        q.push(ProtocolTag::Obj, work(1, 1), now);
        q.push(ProtocolTag::Numpy, work(2, 1), now);

        assert_eq!(q.drain().len(), 2);
        assert!(q.is_empty());
        assert!(q.next_deadline().is_none());
    }
}
