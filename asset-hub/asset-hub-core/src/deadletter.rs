//! Dead-letter sinks for records the projector could not apply.
//!
//! Both sinks are bounded per topic: when full, the oldest letter is dropped
//! and the drop is logged.

use crate::broker::{BrokerRecord, EventPublisher};
use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use tracing::{error, info};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub key: String,
    pub partition: u32,
    pub offset: String,
    pub payload: Vec<u8>,
    pub error_code: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_record(record: &BrokerRecord, err: &AccessError, attempts: u32) -> Self {
        Self {
            topic: record.topic.clone(),
            key: record.key.clone(),
            partition: record.partition,
            offset: record.offset.clone(),
            payload: record.payload.clone(),
            error_code: err.code().to_string(),
            reason: err.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> AccessResult<()>;
    /// Remove and return up to `max` letters for `topic`, oldest first.
    async fn drain(&self, topic: &str, max: usize) -> AccessResult<Vec<DeadLetter>>;
    async fn len(&self, topic: &str) -> AccessResult<usize>;
}

pub struct MemoryDeadLetters {
    capacity: usize,
    queues: Mutex<HashMap<String, VecDeque<DeadLetter>>>,
}

impl MemoryDeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn push(&self, letter: DeadLetter) -> AccessResult<()> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(letter.topic.clone()).or_default();
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                error!(
                    topic = %dropped.topic,
                    offset = %dropped.offset,
                    "dead-letter queue full, dropping oldest letter"
                );
            }
        }
        queue.push_back(letter);
        Ok(())
    }

    async fn drain(&self, topic: &str, max: usize) -> AccessResult<Vec<DeadLetter>> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    async fn len(&self, topic: &str) -> AccessResult<usize> {
        Ok(self.queues.lock().get(topic).map_or(0, VecDeque::len))
    }
}

/// Capped Redis list `deadletter:{topic}`; newest at the head.
#[derive(Clone)]
pub struct RedisDeadLetters {
    conn: ConnectionManager,
    capacity: usize,
}

impl RedisDeadLetters {
    pub async fn connect(redis_url: &str, capacity: usize) -> AccessResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
            capacity: capacity.max(1),
        })
    }

    fn key(topic: &str) -> String {
        format!("deadletter:{topic}")
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetters {
    async fn push(&self, letter: DeadLetter) -> AccessResult<()> {
        let key = Self::key(&letter.topic);
        let body = serde_json::to_string(&letter)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, body)
            .ignore()
            .ltrim(&key, 0, self.capacity as isize - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain(&self, topic: &str, max: usize) -> AccessResult<Vec<DeadLetter>> {
        let Some(count) = NonZeroUsize::new(max) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.rpop(Self::key(topic), Some(count)).await?;
        raw.iter()
            .map(|body| serde_json::from_str(body).map_err(AccessError::from))
            .collect()
    }

    async fn len(&self, topic: &str) -> AccessResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(Self::key(topic)).await?)
    }
}

/// Re-publish dead-lettered payloads for `topic` with their original keys.
/// A letter whose publish fails goes back into the sink and stops the run.
pub async fn replay(
    sink: &dyn DeadLetterSink,
    publisher: &dyn EventPublisher,
    topic: &str,
    batch: usize,
) -> AccessResult<usize> {
    let mut replayed = 0;
    loop {
        let letters = sink.drain(topic, batch).await?;
        if letters.is_empty() {
            break;
        }
        let mut pending = letters.into_iter();
        while let Some(letter) = pending.next() {
            if let Err(err) = publisher.publish(topic, &letter.key, &letter.payload).await {
                sink.push(letter).await?;
                for rest in pending {
                    sink.push(rest).await?;
                }
                return Err(err);
            }
            replayed += 1;
        }
    }
    info!(topic, replayed, "dead letters replayed");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn letter(topic: &str, offset: &str) -> DeadLetter {
        let record = BrokerRecord {
            topic: topic.to_string(),
            key: "k".to_string(),
            payload: b"{}".to_vec(),
            partition: 0,
            offset: offset.to_string(),
        };
        DeadLetter::from_record(&record, &AccessError::transient("cache down"), 5)
    }

    #[tokio::test]
    async fn memory_sink_is_bounded_and_drops_oldest() {
        let sink = MemoryDeadLetters::new(2);
        for offset in ["1", "2", "3"] {
            sink.push(letter("t", offset)).await.unwrap();
        }
        assert_eq!(sink.len("t").await.unwrap(), 2);
        let drained = sink.drain("t", 10).await.unwrap();
        let offsets: Vec<&str> = drained.iter().map(|l| l.offset.as_str()).collect();
        assert_eq!(offsets, vec!["2", "3"]);
        assert_eq!(sink.len("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_republishes_in_order() {
        let sink = MemoryDeadLetters::new(10);
        sink.push(letter("t", "1")).await.unwrap();
        sink.push(letter("t", "2")).await.unwrap();
        let broker = MemoryBroker::new(1);

        let n = replay(&sink, &broker, "t", 1).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(broker.published("t").len(), 2);
        assert_eq!(sink.len("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_replay_keeps_letters() {
        let sink = MemoryDeadLetters::new(10);
        sink.push(letter("t", "1")).await.unwrap();
        let broker = MemoryBroker::new(1);
        broker.set_unavailable(true);

        assert!(replay(&sink, &broker, "t", 10).await.is_err());
        assert_eq!(sink.len("t").await.unwrap(), 1);
    }

    #[test]
    fn letter_records_error_code() {
        let l = letter("t", "9");
        assert_eq!(l.error_code, "transient");
        assert_eq!(l.attempts, 5);
    }
}
