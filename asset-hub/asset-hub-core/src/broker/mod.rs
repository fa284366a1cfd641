//! Keyed, partitioned event transport.
//!
//! A topic is split into a fixed number of partitions; a record's partition
//! is chosen by hashing its key, so records sharing a key are delivered in
//! publish order. Consumers join a named group: the group receives each
//! record at least once, and a record stays pending until it is acknowledged.

use crate::error::AccessResult;
use async_trait::async_trait;

pub mod memory;
pub mod redis_streams;

pub use memory::MemoryBroker;
pub use redis_streams::RedisStreamBroker;

/// One record delivered to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: u32,
    /// Broker-specific position within the partition.
    pub offset: String,
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    crc32fast::hash(key.as_bytes()) % partitions.max(1)
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> AccessResult<()>;
}

#[async_trait]
pub trait EventSubscription: Send {
    /// Wait a bounded time for records. An empty batch means nothing arrived
    /// before the wait expired.
    async fn next_batch(&mut self) -> AccessResult<Vec<BrokerRecord>>;
    async fn ack(&mut self, records: &[BrokerRecord]) -> AccessResult<()>;
    /// Release the underlying connection. Unacknowledged records stay
    /// pending for the group.
    async fn close(&mut self);
}

#[async_trait]
pub trait EventBroker: EventPublisher {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AccessResult<Box<dyn EventSubscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["a", "team-1", "4f7d2c1e-0000-0000-0000-000000000000"] {
            let p = partition_for(key, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(key, 8));
        }
        assert_eq!(partition_for("anything", 0), 0);
    }
}
