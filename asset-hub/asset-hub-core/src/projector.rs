//! Cache projector: consumes domain events and mirrors them into the cache.
//!
//! One loop runs per topic. Records are applied in the order the broker
//! hands them out and acknowledged only after they were applied or
//! dead-lettered, so a crash between the two leads to redelivery, which the
//! idempotent cache operations absorb.

use crate::broker::{BrokerRecord, EventBroker, EventSubscription};
use crate::cache::{keys, CacheStore};
use crate::deadletter::{DeadLetter, DeadLetterSink};
use crate::error::{AccessError, AccessResult};
use crate::events::{DomainEvent, EventRecord, Topic};
use crate::model::ResourceRef;
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CONSUMER_GROUP: &str = "cache-updater-group";

#[derive(Debug, Default)]
pub struct ProjectorStats {
    applied: AtomicU64,
    corrupt: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    read_errors: AtomicU64,
    sink_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub corrupt: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub read_errors: u64,
    /// Records that could be neither applied nor dead-lettered; each is
    /// retried in place.
    pub sink_failures: u64,
}

impl ProjectorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

/// Consumer identity and broker-read backoff for the topic loops.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumer: String,
    /// Only the delays are used; broker reads are retried until shutdown.
    pub read_backoff: RetryPolicy,
}

impl ConsumerSettings {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            read_backoff: RetryPolicy::default(),
        }
    }
}

pub struct CacheProjector {
    cache: Arc<dyn CacheStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    write_retry: RetryPolicy,
    stats: Arc<ProjectorStats>,
}

impl CacheProjector {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        write_retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            dead_letters,
            write_retry,
            stats: Arc::new(ProjectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProjectorStats> {
        self.stats.clone()
    }

    /// Apply one event to the cache. Multi-key events are applied as a
    /// whole; every step is idempotent, so re-running after a partial
    /// failure is safe.
    pub async fn apply(&self, event: &DomainEvent) -> AccessResult<()> {
        match event {
            DomainEvent::MemberAdded {
                team_id,
                principal_id,
            } => self.cache.add_member(*team_id, principal_id).await,
            DomainEvent::MemberRemoved {
                team_id,
                principal_id,
            } => self.cache.remove_member(*team_id, principal_id).await,
            DomainEvent::FolderCreated { folder } | DomainEvent::FolderUpdated { folder } => {
                let blob = serde_json::to_vec(folder)?;
                self.cache
                    .set_blob(&keys::blob(ResourceRef::folder(folder.id)), &blob)
                    .await
            }
            DomainEvent::NoteCreated { note } | DomainEvent::NoteUpdated { note } => {
                let blob = serde_json::to_vec(note)?;
                self.cache
                    .set_blob(&keys::blob(ResourceRef::note(note.id)), &blob)
                    .await
            }
            DomainEvent::FolderDeleted {
                folder_id,
                cascaded_notes,
            } => {
                self.forget(ResourceRef::folder(*folder_id)).await?;
                for note_id in cascaded_notes {
                    self.forget(ResourceRef::note(*note_id)).await?;
                }
                Ok(())
            }
            DomainEvent::NoteDeleted { note_id } => self.forget(ResourceRef::note(*note_id)).await,
            DomainEvent::FolderShared {
                folder_id: asset_id,
                principal_id,
                permission,
            }
            | DomainEvent::NoteShared {
                note_id: asset_id,
                principal_id,
                permission,
            } => {
                self.cache
                    .set_acl_entry(*asset_id, principal_id, *permission)
                    .await
            }
            DomainEvent::FolderUnshared {
                folder_id: asset_id,
                principal_id,
            }
            | DomainEvent::NoteUnshared {
                note_id: asset_id,
                principal_id,
            } => self.cache.delete_acl_entry(*asset_id, principal_id).await,
        }
    }

    async fn forget(&self, resource: ResourceRef) -> AccessResult<()> {
        self.cache.delete_blob(&keys::blob(resource)).await?;
        self.cache.clear_acl(resource.id).await
    }

    /// Decode and apply one broker record. `Ok` means the record is done
    /// with (applied or dead-lettered) and may be acknowledged; `Err` means
    /// even dead-lettering failed and the record must stay pending.
    pub async fn handle_record(&self, record: &BrokerRecord) -> AccessResult<()> {
        let decoded = match EventRecord::decode(&record.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = %record.offset,
                    error = %err,
                    "undecodable event"
                );
                return self.dead_letter(record, &err, 1).await;
            }
        };
        let kind = decoded.event.kind();

        let mut attempts = 1;
        let stats = &self.stats;
        let result = self
            .write_retry
            .run(
                || self.apply(&decoded.event),
                |_, err| {
                    attempts += 1;
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        topic = %record.topic,
                        offset = %record.offset,
                        kind,
                        error = %err,
                        "cache write failed, retrying"
                    );
                },
            )
            .await;

        match result {
            Ok(()) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = %record.offset,
                    kind,
                    event_id = %decoded.event_id,
                    "applied"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = %record.offset,
                    kind,
                    attempts,
                    error = %err,
                    "giving up on cache write"
                );
                self.dead_letter(record, &err, attempts).await
            }
        }
    }

    async fn dead_letter(
        &self,
        record: &BrokerRecord,
        err: &AccessError,
        attempts: u32,
    ) -> AccessResult<()> {
        self.dead_letters
            .push(DeadLetter::from_record(record, err, attempts))
            .await?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Handle `record` until it is applied or dead-lettered. Returns false
    /// when shutdown arrives first; the record then stays pending and is
    /// redelivered to the next consumer.
    async fn settle(
        &self,
        record: &BrokerRecord,
        backoff: &RetryPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut attempt = 0u32;
        loop {
            let err = match self.handle_record(record).await {
                Ok(()) => return true,
                Err(err) => err,
            };
            self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
            let delay = backoff.jittered(attempt);
            attempt = attempt.saturating_add(1);
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = %record.offset,
                attempt,
                ?delay,
                error = %err,
                "dead-letter sink failed, holding record"
            );
            if *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn subscribe(
        &self,
        broker: &dyn EventBroker,
        topic: Topic,
        settings: &ConsumerSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn EventSubscription>> {
        let mut attempt = 0;
        loop {
            match broker
                .subscribe(topic.as_str(), &settings.group, &settings.consumer)
                .await
            {
                Ok(sub) => return Some(sub),
                Err(err) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %topic, error = %err, "subscribe failed");
                }
            }
            let delay = settings.read_backoff.jittered(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Consume `topic` until `shutdown` flips to true (or its sender is
    /// dropped). The batch in hand when shutdown arrives is finished and
    /// acknowledged before the subscription is released, except for a record
    /// still held back by a failing dead-letter sink and those after it.
    pub async fn run_topic(
        self: Arc<Self>,
        broker: Arc<dyn EventBroker>,
        topic: Topic,
        settings: ConsumerSettings,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(mut sub) = self
            .subscribe(broker.as_ref(), topic, &settings, &mut shutdown)
            .await
        else {
            info!(topic = %topic, "projector stopped before subscribing");
            return;
        };
        info!(
            topic = %topic,
            group = %settings.group,
            consumer = %settings.consumer,
            "projector started"
        );

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                batch = sub.next_batch() => batch,
            };
            let batch = match batch {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(err) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = settings.read_backoff.jittered(failures);
                    failures = failures.saturating_add(1);
                    warn!(topic = %topic, error = %err, ?delay, "broker read failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            // Records are settled in order; one that cannot be settled holds
            // back the rest of its batch so nothing is applied past it.
            let mut done = Vec::with_capacity(batch.len());
            let mut stopped = false;
            for record in &batch {
                if !self.settle(record, &settings.read_backoff, &mut shutdown).await {
                    stopped = true;
                    break;
                }
                done.push(record.clone());
            }
            if !done.is_empty() {
                if let Err(err) = sub.ack(&done).await {
                    // unacked records come back and are re-applied idempotently
                    warn!(topic = %topic, error = %err, count = done.len(), "ack failed");
                }
            }
            if stopped {
                break;
            }
        }

        sub.close().await;
        info!(topic = %topic, "projector stopped");
    }
}

/// Start one loop per topic. Flip `shutdown` to true to stop them.
pub fn spawn_all(
    projector: Arc<CacheProjector>,
    broker: Arc<dyn EventBroker>,
    settings: ConsumerSettings,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    Topic::ALL
        .into_iter()
        .map(|topic| {
            tokio::spawn(projector.clone().run_topic(
                broker.clone(),
                topic,
                settings.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

/// Default consumer name when none is configured.
pub fn default_consumer_name() -> String {
    format!("projector-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::deadletter::MemoryDeadLetters;
    use crate::model::{Folder, Permission};
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn projector(max_attempts: u32) -> (CacheProjector, Arc<MemoryCacheStore>, Arc<MemoryDeadLetters>) {
        let cache = Arc::new(MemoryCacheStore::new());
        let dead = Arc::new(MemoryDeadLetters::new(100));
        let p = CacheProjector::new(cache.clone(), dead.clone(), fast_retry(max_attempts));
        (p, cache, dead)
    }

    fn record(event: DomainEvent) -> BrokerRecord {
        let record = EventRecord::new(event);
        BrokerRecord {
            topic: record.event.topic().as_str().to_string(),
            key: record.event.partition_key(),
            payload: record.encode().unwrap(),
            partition: 0,
            offset: "0".to_string(),
        }
    }

    #[tokio::test]
    async fn delete_before_create_leaves_blob_absent() {
        let (p, cache, _) = projector(3);
        let folder = Folder::new("F", "", "o");
        let key = keys::blob(ResourceRef::folder(folder.id));

        p.apply(&DomainEvent::FolderDeleted {
            folder_id: folder.id,
            cascaded_notes: vec![],
        })
        .await
        .unwrap();
        assert_eq!(cache.blob(&key).await.unwrap(), None);

        p.apply(&DomainEvent::FolderCreated {
            folder: folder.clone(),
        })
        .await
        .unwrap();
        p.apply(&DomainEvent::FolderDeleted {
            folder_id: folder.id,
            cascaded_notes: vec![],
        })
        .await
        .unwrap();
        assert_eq!(cache.blob(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn folder_delete_forgets_cascaded_notes() {
        let (p, cache, _) = projector(3);
        let folder = Folder::new("F", "", "o");
        let note = crate::model::Note::new(folder.id, "n", "", "o");
        p.apply(&DomainEvent::NoteCreated { note: note.clone() })
            .await
            .unwrap();
        p.apply(&DomainEvent::shared(ResourceRef::note(note.id), "u", Permission::Read))
            .await
            .unwrap();

        p.apply(&DomainEvent::FolderDeleted {
            folder_id: folder.id,
            cascaded_notes: vec![note.id],
        })
        .await
        .unwrap();
        assert!(cache
            .blob(&keys::blob(ResourceRef::note(note.id)))
            .await
            .unwrap()
            .is_none());
        assert!(cache.acl(note.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blob_holds_embedded_representation() {
        let (p, cache, _) = projector(3);
        let folder = Folder::new("Specs", "d", "o");
        p.handle_record(&record(DomainEvent::FolderUpdated {
            folder: folder.clone(),
        }))
        .await
        .unwrap();
        let raw = cache
            .blob(&keys::blob(ResourceRef::folder(folder.id)))
            .await
            .unwrap()
            .unwrap();
        let stored: Folder = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored, folder);
    }

    #[tokio::test]
    async fn corrupt_payload_is_dead_lettered_and_skipped() {
        let (p, _, dead) = projector(3);
        let mut bad = record(DomainEvent::NoteDeleted {
            note_id: Uuid::new_v4(),
        });
        bad.payload = b"\x00not-json".to_vec();

        p.handle_record(&bad).await.unwrap();
        let letters = dead.drain(&bad.topic, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_code, "corrupt");
        assert_eq!(p.stats().snapshot().corrupt, 1);
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let (p, cache, dead) = projector(5);
        let team_id = Uuid::new_v4();
        cache.fail_next_writes(2);

        p.handle_record(&record(DomainEvent::MemberAdded {
            team_id,
            principal_id: "x".into(),
        }))
        .await
        .unwrap();

        assert_eq!(cache.team_members(team_id).await.unwrap(), Some(vec!["x".to_string()]));
        let stats = p.stats().snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.applied, 1);
        assert_eq!(dead.len("team.activity").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_dead_letters() {
        let (p, cache, dead) = projector(3);
        cache.set_unavailable(true);

        p.handle_record(&record(DomainEvent::MemberRemoved {
            team_id: Uuid::new_v4(),
            principal_id: "x".into(),
        }))
        .await
        .unwrap();

        let letters = dead.drain("team.activity", 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(p.stats().snapshot().dead_lettered, 1);
    }
}
