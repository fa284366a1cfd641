//! Mutation and query paths.
//!
//! Every operation loads what the resolver needs from the grant store,
//! asks the resolver, applies the change transactionally and, for
//! mutations, emits exactly one event per committed change.

use crate::broker::RedisStreamBroker;
use crate::cache::{keys, AclMap, CacheStore, RedisCacheStore};
use crate::config::Config;
use crate::emitter::EventEmitter;
use crate::error::{AccessError, AccessResult};
use crate::events::DomainEvent;
use crate::grants::{GrantStore, PgGrantStore, RosterCheck};
use crate::identity::{require_role, require_user, GraphQlDirectory, IdentityProvider};
use crate::model::{
    AssetListing, Folder, FolderPatch, NewTeam, Note, NotePatch, Permission, Principal,
    PrincipalId, ResourceRef, Role, ShareGrant, Team, TeamCandidate, TeamRole, TeamRoleEntry,
};
use crate::permission::{check_new_team, resolve, resolve_team, Operation, TeamOperation};
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct AccessService {
    grants: Arc<dyn GrantStore>,
    identity: Arc<dyn IdentityProvider>,
    emitter: Arc<EventEmitter>,
    cache: Arc<dyn CacheStore>,
}

fn non_empty(value: &str, field: &str) -> AccessResult<()> {
    if value.trim().is_empty() {
        return Err(AccessError::validation(format!("{field} is required")));
    }
    Ok(())
}

impl AccessService {
    pub fn new(
        grants: Arc<dyn GrantStore>,
        identity: Arc<dyn IdentityProvider>,
        emitter: Arc<EventEmitter>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            grants,
            identity,
            emitter,
            cache,
        }
    }

    /// Wire the production stack: Postgres grants, the user service as
    /// identity provider, Redis streams for events and Redis for the cache.
    /// The caller owns the emitter's flusher, see
    /// [`EventEmitter::spawn_flusher`].
    pub async fn from_config(config: &Config) -> AccessResult<Self> {
        let grants = PgGrantStore::connect(&config.database_url).await?;
        let identity = GraphQlDirectory::new(
            &config.user_service_url,
            config.user_service_token.clone(),
        )?;
        let broker =
            RedisStreamBroker::connect(&config.redis_url, config.topic_partitions).await?;
        let cache = RedisCacheStore::connect(&config.redis_url).await?;
        info!(
            user_service = %config.user_service_url,
            partitions = config.topic_partitions,
            outbox_capacity = config.outbox_capacity,
            "access service connected"
        );
        Ok(Self::new(
            Arc::new(grants),
            Arc::new(identity),
            Arc::new(EventEmitter::new(Arc::new(broker), config.outbox_capacity)),
            Arc::new(cache),
        ))
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// Authoritative check against the grant store.
    pub async fn authorize(
        &self,
        principal: &Principal,
        resource: ResourceRef,
        op: Operation,
    ) -> AccessResult<()> {
        let facts = self.grants.access_facts(resource, &principal.id).await?;
        resolve(principal, facts.as_ref(), op).into_result()
    }

    // Folders

    #[instrument(skip(self, principal, description), fields(principal = %principal.id))]
    pub async fn create_folder(
        &self,
        principal: &Principal,
        name: &str,
        description: &str,
    ) -> AccessResult<Folder> {
        non_empty(name, "folder name")?;
        let folder = Folder::new(name.trim(), description, &principal.id);
        self.grants.insert_folder(&folder).await?;
        self.emitter
            .emit(DomainEvent::FolderCreated {
                folder: folder.clone(),
            })
            .await;
        info!(folder_id = %folder.id, "folder created");
        Ok(folder)
    }

    pub async fn get_folder(&self, principal: &Principal, id: Uuid) -> AccessResult<Folder> {
        self.authorize(principal, ResourceRef::folder(id), Operation::Read)
            .await?;
        self.grants
            .get_folder(id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)
    }

    pub async fn update_folder(
        &self,
        principal: &Principal,
        id: Uuid,
        patch: FolderPatch,
    ) -> AccessResult<Folder> {
        self.authorize(principal, ResourceRef::folder(id), Operation::Write)
            .await?;
        let mut folder = self
            .grants
            .get_folder(id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        if !patch.name.trim().is_empty() {
            folder.name = patch.name.trim().to_string();
        }
        if !patch.description.is_empty() {
            folder.description = patch.description;
        }
        folder.updated_at = Utc::now();
        self.grants.update_folder(&folder).await?;
        self.emitter
            .emit(DomainEvent::FolderUpdated {
                folder: folder.clone(),
            })
            .await;
        Ok(folder)
    }

    /// Owner only. Removes the folder's notes and every share on either.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete_folder(&self, principal: &Principal, id: Uuid) -> AccessResult<()> {
        self.authorize(principal, ResourceRef::folder(id), Operation::Delete)
            .await?;
        let cascaded_notes = self
            .grants
            .delete_folder(id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        info!(folder_id = %id, notes = cascaded_notes.len(), "folder deleted");
        self.emitter
            .emit(DomainEvent::FolderDeleted {
                folder_id: id,
                cascaded_notes,
            })
            .await;
        Ok(())
    }

    // Notes

    /// Requires write access to the parent folder.
    pub async fn create_note(
        &self,
        principal: &Principal,
        folder_id: Uuid,
        title: &str,
        content: &str,
    ) -> AccessResult<Note> {
        self.authorize(principal, ResourceRef::folder(folder_id), Operation::Write)
            .await?;
        non_empty(title, "note title")?;
        let note = Note::new(folder_id, title.trim(), content, &principal.id);
        self.grants.insert_note(&note).await?;
        self.emitter
            .emit(DomainEvent::NoteCreated { note: note.clone() })
            .await;
        Ok(note)
    }

    pub async fn get_note(&self, principal: &Principal, id: Uuid) -> AccessResult<Note> {
        self.authorize(principal, ResourceRef::note(id), Operation::Read)
            .await?;
        self.grants
            .get_note(id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)
    }

    pub async fn update_note(
        &self,
        principal: &Principal,
        id: Uuid,
        patch: NotePatch,
    ) -> AccessResult<Note> {
        self.authorize(principal, ResourceRef::note(id), Operation::Write)
            .await?;
        let mut note = self
            .grants
            .get_note(id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        if !patch.title.trim().is_empty() {
            note.title = patch.title.trim().to_string();
        }
        if !patch.content.is_empty() {
            note.content = patch.content;
        }
        note.updated_at = Utc::now();
        self.grants.update_note(&note).await?;
        self.emitter
            .emit(DomainEvent::NoteUpdated { note: note.clone() })
            .await;
        Ok(note)
    }

    pub async fn delete_note(&self, principal: &Principal, id: Uuid) -> AccessResult<()> {
        self.authorize(principal, ResourceRef::note(id), Operation::Delete)
            .await?;
        if !self.grants.delete_note(id).await? {
            return Err(AccessError::NotFoundOrDenied);
        }
        self.emitter
            .emit(DomainEvent::NoteDeleted { note_id: id })
            .await;
        Ok(())
    }

    // Shares

    /// Grant or overwrite `grantee`'s permission on `resource`.
    #[instrument(skip(self, principal, resource), fields(principal = %principal.id, resource = %resource))]
    pub async fn share(
        &self,
        principal: &Principal,
        resource: ResourceRef,
        grantee_id: &str,
        permission: Permission,
    ) -> AccessResult<ShareGrant> {
        let facts = self.grants.access_facts(resource, &principal.id).await?;
        resolve(principal, facts.as_ref(), Operation::ManageShares).into_result()?;
        if facts.as_ref().is_some_and(|f| f.owner_id == grantee_id) {
            return Err(AccessError::validation("cannot share an asset with its owner"));
        }
        require_user(self.identity.as_ref(), grantee_id).await?;

        let grant = self
            .grants
            .upsert_share(&ShareGrant {
                resource,
                grantee_id: grantee_id.to_string(),
                permission,
                granted_by: principal.id.clone(),
                granted_at: Utc::now(),
            })
            .await?;
        self.emitter
            .emit(DomainEvent::shared(resource, grantee_id, permission))
            .await;
        Ok(grant)
    }

    /// Remove `grantee`'s grant. Revoking a grant that does not exist
    /// succeeds; the unshare event is still emitted so a stale cache entry
    /// gets cleared.
    #[instrument(skip(self, principal, resource), fields(principal = %principal.id, resource = %resource))]
    pub async fn revoke_share(
        &self,
        principal: &Principal,
        resource: ResourceRef,
        grantee_id: &str,
    ) -> AccessResult<()> {
        self.authorize(principal, resource, Operation::ManageShares)
            .await?;
        let removed = self.grants.revoke_share(resource, grantee_id).await?;
        info!(grantee = grantee_id, removed, "share revoked");
        self.emitter
            .emit(DomainEvent::unshared(resource, grantee_id))
            .await;
        Ok(())
    }

    pub async fn list_shares(
        &self,
        principal: &Principal,
        resource: ResourceRef,
    ) -> AccessResult<Vec<ShareGrant>> {
        self.authorize(principal, resource, Operation::ManageShares)
            .await?;
        self.grants.list_shares(resource).await
    }

    // Teams

    /// Validate every proposed principal with the identity provider, then
    /// insert the team and its roster in one transaction.
    #[instrument(skip(self, principal, team), fields(principal = %principal.id, team = %team.name))]
    pub async fn create_team(&self, principal: &Principal, team: NewTeam) -> AccessResult<Team> {
        check_new_team(principal, &team)?;
        let identity = self.identity.as_ref();
        try_join_all(
            team.managers
                .iter()
                .map(|c| require_role(identity, &c.principal_id, Role::Manager)),
        )
        .await?;
        try_join_all(
            team.members
                .iter()
                .map(|c| require_user(identity, &c.principal_id)),
        )
        .await?;

        let created = self
            .grants
            .create_team(team.name.trim(), &team.roster())
            .await?;
        for entry in &created.roster {
            self.emitter
                .emit(DomainEvent::MemberAdded {
                    team_id: created.id,
                    principal_id: entry.principal_id.clone(),
                })
                .await;
        }
        info!(team_id = %created.id, size = created.roster.len(), "team created");
        Ok(created)
    }

    pub async fn get_team(&self, principal: &Principal, team_id: Uuid) -> AccessResult<Team> {
        let team = self.grants.get_team(team_id).await?;
        resolve_team(principal, team.as_ref(), TeamOperation::View).into_result()?;
        team.ok_or(AccessError::NotFoundOrDenied)
    }

    pub async fn list_teams(&self, _principal: &Principal) -> AccessResult<Vec<Team>> {
        self.grants.list_teams().await
    }

    async fn load_team(&self, team_id: Uuid) -> AccessResult<Option<Team>> {
        self.grants.get_team(team_id).await
    }

    pub async fn add_member(
        &self,
        principal: &Principal,
        team_id: Uuid,
        candidate: TeamCandidate,
    ) -> AccessResult<()> {
        let target = candidate.principal_id.clone();
        let op = TeamOperation::AddMember(&target);
        self.authorize_team(principal, team_id, op).await?;
        require_user(self.identity.as_ref(), &target).await?;
        self.set_role(team_id, candidate, TeamRole::Member, &|team: &Team| {
            resolve_team(principal, Some(team), op).into_result()
        })
        .await
    }

    pub async fn remove_member(
        &self,
        principal: &Principal,
        team_id: Uuid,
        principal_id: &str,
    ) -> AccessResult<()> {
        let op = TeamOperation::RemoveMember(principal_id);
        self.authorize_team(principal, team_id, op).await?;
        self.drop_role(team_id, principal_id, &|team: &Team| {
            resolve_team(principal, Some(team), op).into_result()
        })
        .await
    }

    /// Main manager only. Promoting an existing member replaces the member
    /// row.
    pub async fn add_manager(
        &self,
        principal: &Principal,
        team_id: Uuid,
        candidate: TeamCandidate,
    ) -> AccessResult<()> {
        let target = candidate.principal_id.clone();
        let op = TeamOperation::AddManager(&target);
        self.authorize_team(principal, team_id, op).await?;
        require_role(self.identity.as_ref(), &target, Role::Manager).await?;
        self.set_role(team_id, candidate, TeamRole::Manager, &|team: &Team| {
            resolve_team(principal, Some(team), op).into_result()
        })
        .await
    }

    pub async fn remove_manager(
        &self,
        principal: &Principal,
        team_id: Uuid,
        principal_id: &str,
    ) -> AccessResult<()> {
        let op = TeamOperation::RemoveManager(principal_id);
        self.authorize_team(principal, team_id, op).await?;
        self.drop_role(team_id, principal_id, &|team: &Team| {
            resolve_team(principal, Some(team), op).into_result()
        })
        .await
    }

    /// Early rejection against the current snapshot, before any directory
    /// lookups. The store repeats the same check under its lock.
    async fn authorize_team(
        &self,
        principal: &Principal,
        team_id: Uuid,
        op: TeamOperation<'_>,
    ) -> AccessResult<()> {
        let team = self.load_team(team_id).await?;
        resolve_team(principal, team.as_ref(), op).into_result()
    }

    async fn set_role(
        &self,
        team_id: Uuid,
        candidate: TeamCandidate,
        role: TeamRole,
        check: &RosterCheck<'_>,
    ) -> AccessResult<()> {
        let entry = TeamRoleEntry {
            principal_id: candidate.principal_id,
            display_name: candidate.display_name,
            role,
            added_at: Utc::now(),
        };
        self.grants.upsert_team_role(team_id, &entry, check).await?;
        info!(team_id = %team_id, principal = %entry.principal_id, role = role.as_str(), "team role set");
        self.emitter
            .emit(DomainEvent::MemberAdded {
                team_id,
                principal_id: entry.principal_id,
            })
            .await;
        Ok(())
    }

    async fn drop_role(
        &self,
        team_id: Uuid,
        principal_id: &str,
        check: &RosterCheck<'_>,
    ) -> AccessResult<()> {
        if !self.grants.remove_team_role(team_id, principal_id, check).await? {
            return Err(AccessError::NotFoundOrDenied);
        }
        info!(team_id = %team_id, principal = principal_id, "team role removed");
        self.emitter
            .emit(DomainEvent::MemberRemoved {
                team_id,
                principal_id: principal_id.to_string(),
            })
            .await;
        Ok(())
    }

    // Bulk listings, served from the authoritative store.

    /// Manager only: assets owned by or shared with anyone on the team.
    pub async fn team_assets(
        &self,
        principal: &Principal,
        team_id: Uuid,
    ) -> AccessResult<AssetListing> {
        require_manager_role(principal)?;
        let team = self
            .grants
            .get_team(team_id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        self.grants.assets_for(&team.principal_ids()).await
    }

    /// Manager only: assets owned by or shared with one user.
    pub async fn user_assets(
        &self,
        principal: &Principal,
        user_id: &str,
    ) -> AccessResult<AssetListing> {
        require_manager_role(principal)?;
        self.grants.assets_for(&[user_id.to_string()]).await
    }

    // Projected reads. `None` means "not projected yet"; these never
    // authorize anything.

    pub async fn cached_team_members(&self, team_id: Uuid) -> AccessResult<Option<Vec<PrincipalId>>> {
        self.cache.team_members(team_id).await
    }

    pub async fn cached_blob(&self, resource: ResourceRef) -> AccessResult<Option<serde_json::Value>> {
        match self.cache.blob(&keys::blob(resource)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn cached_acl(&self, asset_id: Uuid) -> AccessResult<Option<AclMap>> {
        self.cache.acl(asset_id).await
    }
}

fn require_manager_role(principal: &Principal) -> AccessResult<()> {
    if principal.is_manager() {
        Ok(())
    } else {
        Err(AccessError::forbidden("manager role required"))
    }
}
