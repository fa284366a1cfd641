use super::{partition_for, BrokerRecord, EventBroker, EventPublisher, EventSubscription};
use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const BATCH_SIZE: usize = 64;
const POLL_WAIT: Duration = Duration::from_millis(50);

struct Entry {
    key: String,
    payload: Vec<u8>,
}

struct GroupCursor {
    /// Next offset to hand out, per partition.
    next: Vec<usize>,
    /// Every offset below this is acknowledged, per partition.
    committed: Vec<usize>,
    /// Acknowledged offsets at or above `committed`.
    acked: Vec<BTreeSet<usize>>,
}

impl GroupCursor {
    fn new(partitions: usize) -> Self {
        Self {
            next: vec![0; partitions],
            committed: vec![0; partitions],
            acked: vec![BTreeSet::new(); partitions],
        }
    }

    fn ack(&mut self, partition: usize, offset: usize) {
        if offset < self.committed[partition] {
            return;
        }
        self.acked[partition].insert(offset);
        while self.acked[partition].remove(&self.committed[partition]) {
            self.committed[partition] += 1;
        }
    }
}

struct TopicLog {
    partitions: Vec<Vec<Entry>>,
    groups: HashMap<String, GroupCursor>,
}

struct Shared {
    partitions: u32,
    topics: Mutex<HashMap<String, TopicLog>>,
    published: Notify,
    fail_publish: AtomicBool,
}

impl Shared {
    fn with_topic<R>(&self, topic: &str, f: impl FnOnce(&mut TopicLog) -> R) -> R {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.to_string()).or_insert_with(|| TopicLog {
            partitions: (0..self.partitions).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
        });
        f(log)
    }
}

/// In-process broker with consumer-group semantics: a group's cursor is
/// shared by its consumers, and a fresh subscription resumes from the first
/// unacknowledged record, so anything delivered but never acked comes again.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                topics: Mutex::new(HashMap::new()),
                published: Notify::new(),
                fail_publish: AtomicBool::new(false),
            }),
        }
    }

    /// Make every publish fail with `Transient` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.fail_publish.store(unavailable, Ordering::SeqCst);
    }

    /// All records ever published to `topic`, in partition order.
    pub fn published(&self, topic: &str) -> Vec<BrokerRecord> {
        self.shared.with_topic(topic, |log| {
            log.partitions
                .iter()
                .enumerate()
                .flat_map(|(p, entries)| {
                    entries.iter().enumerate().map(move |(offset, e)| BrokerRecord {
                        topic: topic.to_string(),
                        key: e.key.clone(),
                        payload: e.payload.clone(),
                        partition: p as u32,
                        offset: offset.to_string(),
                    })
                })
                .collect()
        })
    }

    /// Records delivered to `group` but not yet acknowledged.
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.shared.with_topic(topic, |log| {
            let Some(cursor) = log.groups.get(group) else {
                return 0;
            };
            (0..cursor.next.len())
                .map(|p| {
                    (cursor.committed[p]..cursor.next[p])
                        .filter(|o| !cursor.acked[p].contains(o))
                        .count()
                })
                .sum()
        })
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> AccessResult<()> {
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(AccessError::transient("broker unavailable"));
        }
        let partition = partition_for(key, self.shared.partitions) as usize;
        self.shared.with_topic(topic, |log| {
            log.partitions[partition].push(Entry {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
        });
        self.shared.published.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
    ) -> AccessResult<Box<dyn EventSubscription>> {
        let partitions = self.shared.partitions as usize;
        self.shared.with_topic(topic, |log| {
            let cursor = log
                .groups
                .entry(group.to_string())
                .or_insert_with(|| GroupCursor::new(partitions));
            cursor.next = cursor.committed.clone();
        });
        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            closed: false,
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    closed: bool,
}

impl MemorySubscription {
    fn take_available(&self) -> Vec<BrokerRecord> {
        let topic = self.topic.as_str();
        self.shared.with_topic(topic, |log| {
            let TopicLog { partitions, groups } = log;
            let Some(cursor) = groups.get_mut(&self.group) else {
                return Vec::new();
            };
            let mut batch = Vec::new();
            for (p, entries) in partitions.iter().enumerate() {
                while cursor.next[p] < entries.len() && batch.len() < BATCH_SIZE {
                    let offset = cursor.next[p];
                    cursor.next[p] += 1;
                    if cursor.acked[p].contains(&offset) {
                        continue;
                    }
                    let entry = &entries[offset];
                    batch.push(BrokerRecord {
                        topic: topic.to_string(),
                        key: entry.key.clone(),
                        payload: entry.payload.clone(),
                        partition: p as u32,
                        offset: offset.to_string(),
                    });
                }
            }
            batch
        })
    }
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next_batch(&mut self) -> AccessResult<Vec<BrokerRecord>> {
        if self.closed {
            return Err(AccessError::transient("subscription closed"));
        }
        let notified = self.shared.published.notified();
        let batch = self.take_available();
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(POLL_WAIT, notified).await;
        Ok(self.take_available())
    }

    async fn ack(&mut self, records: &[BrokerRecord]) -> AccessResult<()> {
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            let offset = record
                .offset
                .parse::<usize>()
                .map_err(|e| AccessError::Corrupt(format!("bad offset {}: {e}", record.offset)))?;
            offsets.push((record.partition as usize, offset));
        }
        self.shared.with_topic(&self.topic, |log| {
            if let Some(cursor) = log.groups.get_mut(&self.group) {
                for (partition, offset) in offsets {
                    cursor.ack(partition, offset);
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
