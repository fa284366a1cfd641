use super::{keys, AclMap, CacheStore};
use crate::error::{AccessError, AccessResult};
use crate::model::{Permission, PrincipalId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct State {
    sets: HashMap<String, BTreeSet<PrincipalId>>,
    blobs: HashMap<String, Vec<u8>>,
    maps: HashMap<String, AclMap>,
}

/// In-process cache store with failure injection for retry tests.
#[derive(Default)]
pub struct MemoryCacheStore {
    state: Mutex<State>,
    failures_left: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes fail with `Transient`.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Every write fails with `Transient` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_write(&self) -> AccessResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AccessError::transient("cache store unavailable"));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AccessError::transient("injected cache write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn add_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()> {
        self.check_write()?;
        self.state
            .lock()
            .sets
            .entry(keys::team_members(team_id))
            .or_default()
            .insert(principal_id.to_string());
        Ok(())
    }

    async fn remove_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()> {
        self.check_write()?;
        let mut state = self.state.lock();
        let key = keys::team_members(team_id);
        if let Some(set) = state.sets.get_mut(&key) {
            set.remove(principal_id);
            // an emptied set disappears, as in Redis
            if set.is_empty() {
                state.sets.remove(&key);
            }
        }
        Ok(())
    }

    async fn set_blob(&self, key: &str, value: &[u8]) -> AccessResult<()> {
        self.check_write()?;
        self.state.lock().blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> AccessResult<()> {
        self.check_write()?;
        self.state.lock().blobs.remove(key);
        Ok(())
    }

    async fn set_acl_entry(
        &self,
        asset_id: Uuid,
        principal_id: &str,
        permission: Permission,
    ) -> AccessResult<()> {
        self.check_write()?;
        self.state
            .lock()
            .maps
            .entry(keys::acl(asset_id))
            .or_default()
            .insert(principal_id.to_string(), permission);
        Ok(())
    }

    async fn delete_acl_entry(&self, asset_id: Uuid, principal_id: &str) -> AccessResult<()> {
        self.check_write()?;
        let mut state = self.state.lock();
        let key = keys::acl(asset_id);
        if let Some(map) = state.maps.get_mut(&key) {
            map.remove(principal_id);
            if map.is_empty() {
                state.maps.remove(&key);
            }
        }
        Ok(())
    }

    async fn clear_acl(&self, asset_id: Uuid) -> AccessResult<()> {
        self.check_write()?;
        self.state.lock().maps.remove(&keys::acl(asset_id));
        Ok(())
    }

    async fn team_members(&self, team_id: Uuid) -> AccessResult<Option<Vec<PrincipalId>>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(&keys::team_members(team_id))
            .map(|set| set.iter().cloned().collect()))
    }

    async fn blob(&self, key: &str) -> AccessResult<Option<Vec<u8>>> {
        Ok(self.state.lock().blobs.get(key).cloned())
    }

    async fn acl(&self, asset_id: Uuid) -> AccessResult<Option<AclMap>> {
        Ok(self.state.lock().maps.get(&keys::acl(asset_id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_writes_are_idempotent() {
        let cache = MemoryCacheStore::new();
        let team = Uuid::new_v4();
        cache.add_member(team, "x").await.unwrap();
        cache.add_member(team, "x").await.unwrap();
        assert_eq!(cache.team_members(team).await.unwrap(), Some(vec!["x".to_string()]));

        cache.remove_member(team, "x").await.unwrap();
        cache.remove_member(team, "x").await.unwrap();
        assert_eq!(cache.team_members(team).await.unwrap(), None);
    }

    #[tokio::test]
    async fn acl_entry_is_overwritten_not_duplicated() {
        let cache = MemoryCacheStore::new();
        let asset = Uuid::new_v4();
        cache.set_acl_entry(asset, "u", Permission::Read).await.unwrap();
        cache.set_acl_entry(asset, "u", Permission::Write).await.unwrap();
        let acl = cache.acl(asset).await.unwrap().unwrap();
        assert_eq!(acl.len(), 1);
        assert_eq!(acl["u"], Permission::Write);

        cache.clear_acl(asset).await.unwrap();
        assert!(cache.acl(asset).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let cache = MemoryCacheStore::new();
        cache.fail_next_writes(2);
        assert!(cache.set_blob("k", b"v").await.is_err());
        assert!(cache.set_blob("k", b"v").await.is_err());
        cache.set_blob("k", b"v").await.unwrap();
        assert_eq!(cache.blob("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
