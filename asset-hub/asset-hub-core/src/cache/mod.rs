//! Read-side cache mirror.
//!
//! Only the projector writes here. Every write is a single-key idempotent
//! upsert or delete, so no locking is needed across keys. Readers treat a
//! missing key as "not projected yet", never as "confirmed empty".

use crate::error::AccessResult;
use crate::model::{Permission, PrincipalId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

/// Grantee id to permission.
pub type AclMap = BTreeMap<PrincipalId, Permission>;

pub mod keys {
    use crate::model::{ResourceKind, ResourceRef};
    use uuid::Uuid;

    /// Set of principal ids on a team's roster.
    pub fn team_members(team_id: Uuid) -> String {
        format!("team:{team_id}:members")
    }

    /// Latest known JSON representation of a folder or note.
    pub fn blob(resource: ResourceRef) -> String {
        match resource.kind {
            ResourceKind::Folder => format!("folder:{}", resource.id),
            ResourceKind::Note => format!("note:{}", resource.id),
        }
    }

    /// Hash of grantee id to permission for one asset.
    pub fn acl(asset_id: Uuid) -> String {
        format!("asset:{asset_id}:acl")
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn add_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()>;
    async fn remove_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()>;
    async fn set_blob(&self, key: &str, value: &[u8]) -> AccessResult<()>;
    async fn delete_blob(&self, key: &str) -> AccessResult<()>;
    async fn set_acl_entry(
        &self,
        asset_id: Uuid,
        principal_id: &str,
        permission: Permission,
    ) -> AccessResult<()>;
    async fn delete_acl_entry(&self, asset_id: Uuid, principal_id: &str) -> AccessResult<()>;
    /// Drop the whole ACL map of a deleted asset.
    async fn clear_acl(&self, asset_id: Uuid) -> AccessResult<()>;

    async fn team_members(&self, team_id: Uuid) -> AccessResult<Option<Vec<PrincipalId>>>;
    async fn blob(&self, key: &str) -> AccessResult<Option<Vec<u8>>>;
    async fn acl(&self, asset_id: Uuid) -> AccessResult<Option<AclMap>>;
}
