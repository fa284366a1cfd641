use super::{partition_for, BrokerRecord, EventBroker, EventPublisher, EventSubscription};
use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_COUNT: usize = 64;
const BLOCK: Duration = Duration::from_secs(2);
/// Entries pending this long on another consumer are taken over on subscribe.
const CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);

fn stream_key(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

/// Broker on Redis Streams: each (topic, partition) is the stream
/// `{topic}:{partition}`, consumed through `XREADGROUP`.
pub struct RedisStreamBroker {
    client: redis::Client,
    conn: ConnectionManager,
    partitions: u32,
}

impl RedisStreamBroker {
    pub async fn connect(redis_url: &str, partitions: u32) -> AccessResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            partitions: partitions.max(1),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisStreamBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> AccessResult<()> {
        let stream = stream_key(topic, partition_for(key, self.partitions));
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&stream, "*", &[("key", key.as_bytes()), ("payload", payload)])
            .await?;
        debug!(stream = %stream, id = %id, key, "published");
        Ok(())
    }
}

#[async_trait]
impl EventBroker for RedisStreamBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AccessResult<Box<dyn EventSubscription>> {
        // Blocking reads get a connection of their own so they never stall
        // publishers sharing the manager.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let streams: Vec<String> = (0..self.partitions).map(|p| stream_key(topic, p)).collect();

        for stream in &streams {
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(stream, group, "0").await;
            match created {
                Ok(()) => info!(stream = %stream, group, "created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(e.into()),
            }

            // Take over entries left idle by dead consumers, a page at a time
            // until the cursor wraps.
            let mut cursor = "0-0".to_string();
            let mut claimed = 0;
            loop {
                let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(CLAIM_MIN_IDLE.as_millis() as u64)
                    .arg(&cursor)
                    .arg("COUNT")
                    .arg(READ_COUNT)
                    .arg("JUSTID")
                    .query_async(&mut conn)
                    .await?;
                let (next, ids) = parse_autoclaim(&reply)?;
                claimed += ids;
                if next == "0-0" {
                    break;
                }
                cursor = next;
            }
            if claimed > 0 {
                info!(stream = %stream, group, consumer, claimed, "claimed idle entries");
            }
        }

        Ok(Box::new(RedisStreamSubscription {
            conn: Some(conn),
            topic: topic.to_string(),
            streams,
            group: group.to_string(),
            consumer: consumer.to_string(),
            backlog_done: false,
        }))
    }
}

struct RedisStreamSubscription {
    conn: Option<MultiplexedConnection>,
    topic: String,
    streams: Vec<String>,
    group: String,
    consumer: String,
    /// False while re-reading entries delivered to this consumer before a
    /// restart but never acknowledged.
    backlog_done: bool,
}

impl RedisStreamSubscription {
    fn to_record(&self, stream: &str, entry: &StreamId) -> BrokerRecord {
        let partition = stream
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        BrokerRecord {
            topic: self.topic.clone(),
            key: entry.get("key").unwrap_or_default(),
            // A missing payload decodes as corrupt downstream.
            payload: entry.get("payload").unwrap_or_default(),
            partition,
            offset: entry.id.clone(),
        }
    }
}

#[async_trait]
impl EventSubscription for RedisStreamSubscription {
    async fn next_batch(&mut self) -> AccessResult<Vec<BrokerRecord>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(AccessError::transient("subscription closed"));
        };
        let start = if self.backlog_done { ">" } else { "0" };
        let ids = vec![start; self.streams.len()];
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT);
        if self.backlog_done {
            opts = opts.block(BLOCK.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&self.streams[..], &ids[..], &opts)
            .await?;
        let records: Vec<BrokerRecord> = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .iter()
            .flat_map(|k| k.ids.iter().map(|entry| self.to_record(&k.key, entry)))
            .collect();

        if !self.backlog_done && records.is_empty() {
            self.backlog_done = true;
        } else if !self.backlog_done {
            warn!(
                topic = %self.topic,
                count = records.len(),
                "redelivering unacknowledged records"
            );
        }
        Ok(records)
    }

    async fn ack(&mut self, records: &[BrokerRecord]) -> AccessResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(AccessError::transient("subscription closed"));
        };
        for stream in &self.streams {
            let ids: Vec<&str> = records
                .iter()
                .filter(|r| stream_key(&r.topic, r.partition) == *stream)
                .map(|r| r.offset.as_str())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let _: i64 = conn.xack(stream, &self.group, &ids[..]).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.conn.take().is_some() {
            info!(topic = %self.topic, consumer = %self.consumer, "released stream connection");
        }
    }
}

/// Next cursor and number of claimed ids from an `XAUTOCLAIM ... JUSTID`
/// reply. Redis 7 appends a third element listing deleted ids.
fn parse_autoclaim(reply: &[redis::Value]) -> AccessResult<(String, usize)> {
    let (Some(cursor), Some(ids)) = (reply.first(), reply.get(1)) else {
        return Err(AccessError::transient("malformed XAUTOCLAIM reply"));
    };
    let cursor: String = redis::from_redis_value(cursor)?;
    let ids: Vec<String> = redis::from_redis_value(ids)?;
    Ok((cursor, ids.len()))
}
