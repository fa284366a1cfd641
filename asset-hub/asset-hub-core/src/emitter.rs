//! Domain event emitter.
//!
//! Publishing happens after the relational commit and never undoes it. A
//! record that cannot be published is parked in a bounded outbox and
//! re-sent by [`EventEmitter::flush_outbox`], either on the next emit or
//! from the task started by [`EventEmitter::spawn_flusher`]; while the
//! outbox is non-empty new records queue behind it so per-key order is kept.

use crate::broker::EventPublisher;
use crate::error::AccessResult;
use crate::events::{DomainEvent, EventRecord};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
struct Parked {
    topic: &'static str,
    key: String,
    kind: &'static str,
    payload: Vec<u8>,
}

pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    outbox: Mutex<VecDeque<Parked>>,
    capacity: usize,
    flushing: tokio::sync::Mutex<()>,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, outbox_capacity: usize) -> Self {
        Self {
            publisher,
            outbox: Mutex::new(VecDeque::new()),
            capacity: outbox_capacity.max(1),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Publish one event for a committed mutation. Never fails: publish
    /// errors are logged and the record is parked in the outbox.
    pub async fn emit(&self, event: DomainEvent) -> EventRecord {
        let record = EventRecord::new(event);
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(kind = record.event.kind(), error = %err, "event encoding failed");
                return record;
            }
        };
        let parked = Parked {
            topic: record.event.topic().as_str(),
            key: record.event.partition_key(),
            kind: record.event.kind(),
            payload,
        };

        if self.pending() > 0 {
            self.park(parked);
            if let Err(err) = self.flush_outbox().await {
                debug!(error = %err, "outbox still blocked");
            }
            return record;
        }

        match self
            .publisher
            .publish(parked.topic, &parked.key, &parked.payload)
            .await
        {
            Ok(()) => debug!(topic = parked.topic, key = %parked.key, kind = parked.kind, "event published"),
            Err(err) => {
                error!(
                    topic = parked.topic,
                    key = %parked.key,
                    kind = parked.kind,
                    error = %err,
                    "publish failed, parking event in outbox"
                );
                self.park(parked);
            }
        }
        record
    }

    fn park(&self, parked: Parked) {
        let mut outbox = self.outbox.lock();
        if outbox.len() >= self.capacity {
            if let Some(dropped) = outbox.pop_front() {
                error!(
                    topic = dropped.topic,
                    key = %dropped.key,
                    kind = dropped.kind,
                    "outbox full, dropping oldest event"
                );
            }
        }
        outbox.push_back(parked);
    }

    /// Re-publish parked records in order. Stops at the first failure and
    /// returns it; returns the number published otherwise.
    pub async fn flush_outbox(&self) -> AccessResult<usize> {
        let _guard = self.flushing.lock().await;
        let mut flushed = 0;
        loop {
            let Some(next) = self.outbox.lock().front().cloned() else {
                break;
            };
            if let Err(err) = self
                .publisher
                .publish(next.topic, &next.key, &next.payload)
                .await
            {
                warn!(flushed, pending = self.pending(), error = %err, "outbox flush interrupted");
                return Err(err);
            }
            self.outbox.lock().pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "outbox flushed");
        }
        Ok(flushed)
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Flush the outbox every `interval` until `shutdown` flips to true (or
    /// its sender is dropped), then try once more before returning.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticks.tick() => {}
                }
                if self.pending() == 0 {
                    continue;
                }
                if let Err(err) = self.flush_outbox().await {
                    debug!(pending = self.pending(), error = %err, "outbox still blocked");
                }
            }
            if self.pending() > 0 {
                if let Err(err) = self.flush_outbox().await {
                    warn!(pending = self.pending(), error = %err, "events left unpublished at shutdown");
                }
            }
            info!("outbox flusher stopped");
        })
    }
}
