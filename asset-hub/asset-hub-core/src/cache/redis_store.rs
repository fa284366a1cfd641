use super::{keys, AclMap, CacheStore};
use crate::error::{AccessError, AccessResult};
use crate::model::{Permission, PrincipalId};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

/// Cache mirror on Redis: sets for rosters, strings for blobs, hashes for
/// ACLs.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(redis_url: &str) -> AccessResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
        })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn add_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(keys::team_members(team_id), principal_id).await?;
        Ok(())
    }

    async fn remove_member(&self, team_id: Uuid, principal_id: &str) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(keys::team_members(team_id), principal_id).await?;
        Ok(())
    }

    async fn set_blob(&self, key: &str, value: &[u8]) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn set_acl_entry(
        &self,
        asset_id: Uuid,
        principal_id: &str,
        permission: Permission,
    ) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(keys::acl(asset_id), principal_id, permission.as_str())
            .await?;
        Ok(())
    }

    async fn delete_acl_entry(&self, asset_id: Uuid, principal_id: &str) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(keys::acl(asset_id), principal_id).await?;
        Ok(())
    }

    async fn clear_acl(&self, asset_id: Uuid) -> AccessResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(keys::acl(asset_id)).await?;
        Ok(())
    }

    async fn team_members(&self, team_id: Uuid) -> AccessResult<Option<Vec<PrincipalId>>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<PrincipalId> = conn.smembers(keys::team_members(team_id)).await?;
        if members.is_empty() {
            return Ok(None);
        }
        members.sort();
        Ok(Some(members))
    }

    async fn blob(&self, key: &str) -> AccessResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn acl(&self, asset_id: Uuid) -> AccessResult<Option<AclMap>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<PrincipalId, String> = conn.hgetall(keys::acl(asset_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.into_iter()
            .map(|(grantee, permission)| {
                permission
                    .parse::<Permission>()
                    .map(|p| (grantee, p))
                    .map_err(AccessError::Corrupt)
            })
            .collect::<AccessResult<AclMap>>()
            .map(Some)
    }
}
