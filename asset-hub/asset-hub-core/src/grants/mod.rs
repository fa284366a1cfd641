//! Grant store adapter: the authoritative home of assets, share grants and
//! team roles.
//!
//! Both implementations enforce the same invariants:
//! - one share grant per (resource, grantee); sharing again overwrites;
//! - revoking an absent grant succeeds;
//! - one role row per (team, principal), so a principal is either a manager
//!   or a member of a team, never both;
//! - the main manager row is never rewritten or deleted;
//! - team creation is all-or-nothing.

use crate::error::AccessResult;
use crate::model::{
    AssetListing, Folder, Note, PrincipalId, ResourceRef, ShareGrant, Team, TeamRoleEntry,
};
use crate::permission::AccessFacts;
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod postgres;


pub use memory::MemoryGrantStore;
pub use postgres::PgGrantStore;

/// Guard over a team's current roster, evaluated inside a role write.
pub type RosterCheck<'a> = dyn Fn(&Team) -> AccessResult<()> + Send + Sync + 'a;

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert_folder(&self, folder: &Folder) -> AccessResult<()>;
    async fn update_folder(&self, folder: &Folder) -> AccessResult<()>;
    async fn get_folder(&self, id: Uuid) -> AccessResult<Option<Folder>>;
    /// Deletes the folder, its notes and every share on either. Returns the
    /// ids of the cascaded notes, or `None` if the folder did not exist.
    async fn delete_folder(&self, id: Uuid) -> AccessResult<Option<Vec<Uuid>>>;

    async fn insert_note(&self, note: &Note) -> AccessResult<()>;
    async fn update_note(&self, note: &Note) -> AccessResult<()>;
    async fn get_note(&self, id: Uuid) -> AccessResult<Option<Note>>;
    /// Deletes the note and its shares; `false` if it did not exist.
    async fn delete_note(&self, id: Uuid) -> AccessResult<bool>;

    /// Owner plus the principal's grants on the asset (and its folder), read
    /// consistently. `None` if the asset does not exist.
    async fn access_facts(
        &self,
        resource: ResourceRef,
        principal_id: &str,
    ) -> AccessResult<Option<AccessFacts>>;

    /// Insert or overwrite the grant keyed by (resource, grantee).
    async fn upsert_share(&self, grant: &ShareGrant) -> AccessResult<ShareGrant>;
    /// Remove the grant keyed by (resource, grantee); `true` if one existed.
    async fn revoke_share(&self, resource: ResourceRef, grantee_id: &str) -> AccessResult<bool>;
    async fn list_shares(&self, resource: ResourceRef) -> AccessResult<Vec<ShareGrant>>;

    /// Folders and notes owned by, or shared with, any of `principals`.
    async fn assets_for(&self, principals: &[PrincipalId]) -> AccessResult<AssetListing>;

    /// Insert the team and its whole roster in one transaction.
    async fn create_team(&self, name: &str, roster: &[TeamRoleEntry]) -> AccessResult<Team>;
    async fn get_team(&self, id: Uuid) -> AccessResult<Option<Team>>;
    async fn list_teams(&self) -> AccessResult<Vec<Team>>;
    /// Set the principal's role in the team, replacing any previous role.
    /// `check` runs against the roster as locked for the write and its
    /// error aborts the change. Fails with `Conflict` when the principal is
    /// the main manager.
    async fn upsert_team_role(
        &self,
        team_id: Uuid,
        entry: &TeamRoleEntry,
        check: &RosterCheck<'_>,
    ) -> AccessResult<()>;
    /// Remove the principal's role row; `false` if there was none. `check`
    /// is applied as for `upsert_team_role`. Fails with `Conflict` when the
    /// principal is the main manager.
    async fn remove_team_role(
        &self,
        team_id: Uuid,
        principal_id: &str,
        check: &RosterCheck<'_>,
    ) -> AccessResult<bool>;
}
