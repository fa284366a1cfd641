//! In-process grant store. Every mutation takes the single write lock, so a
//! multi-row change is applied entirely or not at all.

use super::{GrantStore, RosterCheck};
use crate::error::{AccessError, AccessResult};
use crate::model::{
    AssetListing, Folder, Note, PrincipalId, ResourceKind, ResourceRef, ShareGrant, Team,
    TeamRole, TeamRoleEntry,
};
use crate::permission::AccessFacts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

struct TeamRow {
    name: String,
    created_at: DateTime<Utc>,
    roster: Vec<TeamRoleEntry>,
}

#[derive(Default)]
struct State {
    folders: HashMap<Uuid, Folder>,
    notes: HashMap<Uuid, Note>,
    shares: HashMap<(ResourceRef, PrincipalId), ShareGrant>,
    teams: HashMap<Uuid, TeamRow>,
}

impl State {
    fn grant(&self, resource: ResourceRef, principal_id: &str) -> Option<&ShareGrant> {
        self.shares.get(&(resource, principal_id.to_string()))
    }

    fn drop_shares(&mut self, resource: ResourceRef) {
        self.shares.retain(|(r, _), _| *r != resource);
    }

    fn team(&self, id: Uuid) -> Option<Team> {
        self.teams.get(&id).map(|row| Team {
            id,
            name: row.name.clone(),
            created_at: row.created_at,
            roster: row.roster.clone(),
        })
    }
}

#[derive(Default)]
pub struct MemoryGrantStore {
    state: RwLock<State>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of share rows for a resource, used to check upsert behaviour.
    pub fn share_count(&self, resource: ResourceRef) -> usize {
        self.state
            .read()
            .shares
            .keys()
            .filter(|(r, _)| *r == resource)
            .count()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn insert_folder(&self, folder: &Folder) -> AccessResult<()> {
        let mut state = self.state.write();
        if state.folders.contains_key(&folder.id) {
            return Err(AccessError::conflict(format!("folder {} already exists", folder.id)));
        }
        state.folders.insert(folder.id, folder.clone());
        Ok(())
    }

    async fn update_folder(&self, folder: &Folder) -> AccessResult<()> {
        let mut state = self.state.write();
        let slot = state
            .folders
            .get_mut(&folder.id)
            .ok_or(AccessError::NotFoundOrDenied)?;
        *slot = folder.clone();
        Ok(())
    }

    async fn get_folder(&self, id: Uuid) -> AccessResult<Option<Folder>> {
        Ok(self.state.read().folders.get(&id).cloned())
    }

    async fn delete_folder(&self, id: Uuid) -> AccessResult<Option<Vec<Uuid>>> {
        let mut state = self.state.write();
        if state.folders.remove(&id).is_none() {
            return Ok(None);
        }
        let cascaded: Vec<Uuid> = state
            .notes
            .values()
            .filter(|n| n.folder_id == id)
            .map(|n| n.id)
            .collect();
        for note_id in &cascaded {
            state.notes.remove(note_id);
            state.drop_shares(ResourceRef::note(*note_id));
        }
        state.drop_shares(ResourceRef::folder(id));
        Ok(Some(cascaded))
    }

    async fn insert_note(&self, note: &Note) -> AccessResult<()> {
        let mut state = self.state.write();
        if !state.folders.contains_key(&note.folder_id) {
            return Err(AccessError::NotFoundOrDenied);
        }
        if state.notes.contains_key(&note.id) {
            return Err(AccessError::conflict(format!("note {} already exists", note.id)));
        }
        state.notes.insert(note.id, note.clone());
        Ok(())
    }

    async fn update_note(&self, note: &Note) -> AccessResult<()> {
        let mut state = self.state.write();
        let slot = state
            .notes
            .get_mut(&note.id)
            .ok_or(AccessError::NotFoundOrDenied)?;
        *slot = note.clone();
        Ok(())
    }

    async fn get_note(&self, id: Uuid) -> AccessResult<Option<Note>> {
        Ok(self.state.read().notes.get(&id).cloned())
    }

    async fn delete_note(&self, id: Uuid) -> AccessResult<bool> {
        let mut state = self.state.write();
        if state.notes.remove(&id).is_none() {
            return Ok(false);
        }
        state.drop_shares(ResourceRef::note(id));
        Ok(true)
    }

    async fn access_facts(
        &self,
        resource: ResourceRef,
        principal_id: &str,
    ) -> AccessResult<Option<AccessFacts>> {
        let state = self.state.read();
        let direct_grant = state.grant(resource, principal_id).map(|g| g.permission);
        let facts = match resource.kind {
            ResourceKind::Folder => state.folders.get(&resource.id).map(|f| AccessFacts {
                resource,
                owner_id: f.owner_id.clone(),
                direct_grant,
                folder_grant: None,
            }),
            ResourceKind::Note => state.notes.get(&resource.id).map(|n| AccessFacts {
                resource,
                owner_id: n.owner_id.clone(),
                direct_grant,
                folder_grant: state
                    .grant(ResourceRef::folder(n.folder_id), principal_id)
                    .map(|g| g.permission),
            }),
        };
        Ok(facts)
    }

    async fn upsert_share(&self, grant: &ShareGrant) -> AccessResult<ShareGrant> {
        let mut state = self.state.write();
        let exists = match grant.resource.kind {
            ResourceKind::Folder => state.folders.contains_key(&grant.resource.id),
            ResourceKind::Note => state.notes.contains_key(&grant.resource.id),
        };
        if !exists {
            return Err(AccessError::NotFoundOrDenied);
        }
        let stored = state
            .shares
            .entry((grant.resource, grant.grantee_id.clone()))
            .and_modify(|existing| {
                existing.permission = grant.permission;
                existing.granted_by = grant.granted_by.clone();
            })
            .or_insert_with(|| grant.clone());
        Ok(stored.clone())
    }

    async fn revoke_share(&self, resource: ResourceRef, grantee_id: &str) -> AccessResult<bool> {
        let mut state = self.state.write();
        Ok(state
            .shares
            .remove(&(resource, grantee_id.to_string()))
            .is_some())
    }

    async fn list_shares(&self, resource: ResourceRef) -> AccessResult<Vec<ShareGrant>> {
        let state = self.state.read();
        let mut grants: Vec<ShareGrant> = state
            .shares
            .iter()
            .filter(|((r, _), _)| *r == resource)
            .map(|(_, g)| g.clone())
            .collect();
        grants.sort_by(|a, b| a.granted_at.cmp(&b.granted_at).then(a.grantee_id.cmp(&b.grantee_id)));
        Ok(grants)
    }

    async fn assets_for(&self, principals: &[PrincipalId]) -> AccessResult<AssetListing> {
        let state = self.state.read();
        let wanted: HashSet<&str> = principals.iter().map(String::as_str).collect();
        let shared_with = |resource: ResourceRef| {
            state
                .shares
                .keys()
                .any(|(r, p)| *r == resource && wanted.contains(p.as_str()))
        };
        let mut folders: Vec<Folder> = state
            .folders
            .values()
            .filter(|f| wanted.contains(f.owner_id.as_str()) || shared_with(ResourceRef::folder(f.id)))
            .cloned()
            .collect();
        let mut notes: Vec<Note> = state
            .notes
            .values()
            .filter(|n| wanted.contains(n.owner_id.as_str()) || shared_with(ResourceRef::note(n.id)))
            .cloned()
            .collect();
        folders.sort_by_key(|f| (f.created_at, f.id));
        notes.sort_by_key(|n| (n.created_at, n.id));
        Ok(AssetListing { folders, notes })
    }

    async fn create_team(&self, name: &str, roster: &[TeamRoleEntry]) -> AccessResult<Team> {
        let mains = roster
            .iter()
            .filter(|e| e.role == TeamRole::MainManager)
            .count();
        if mains != 1 {
            return Err(AccessError::validation("a team needs exactly one main manager"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = roster.iter().find(|e| !seen.insert(e.principal_id.as_str())) {
            return Err(AccessError::conflict(format!(
                "{} appears twice in the roster",
                dup.principal_id
            )));
        }

        let id = Uuid::new_v4();
        let mut state = self.state.write();
        state.teams.insert(
            id,
            TeamRow {
                name: name.to_string(),
                created_at: Utc::now(),
                roster: roster.to_vec(),
            },
        );
        state.team(id).ok_or(AccessError::NotFoundOrDenied)
    }

    async fn get_team(&self, id: Uuid) -> AccessResult<Option<Team>> {
        Ok(self.state.read().team(id))
    }

    async fn list_teams(&self) -> AccessResult<Vec<Team>> {
        let state = self.state.read();
        let mut teams: Vec<Team> = state.teams.keys().filter_map(|id| state.team(*id)).collect();
        teams.sort_by_key(|t| (t.created_at, t.id));
        Ok(teams)
    }

    async fn upsert_team_role(
        &self,
        team_id: Uuid,
        entry: &TeamRoleEntry,
        check: &RosterCheck<'_>,
    ) -> AccessResult<()> {
        if entry.role == TeamRole::MainManager {
            return Err(AccessError::conflict("the main manager is fixed at team creation"));
        }
        let mut state = self.state.write();
        check(&state.team(team_id).ok_or(AccessError::NotFoundOrDenied)?)?;
        let team = state
            .teams
            .get_mut(&team_id)
            .ok_or(AccessError::NotFoundOrDenied)?;
        match team
            .roster
            .iter_mut()
            .find(|e| e.principal_id == entry.principal_id)
        {
            Some(existing) if existing.role == TeamRole::MainManager => {
                Err(AccessError::conflict("cannot change the main manager's role"))
            }
            Some(existing) => {
                existing.role = entry.role;
                existing.display_name = entry.display_name.clone();
                Ok(())
            }
            None => {
                team.roster.push(entry.clone());
                Ok(())
            }
        }
    }

    async fn remove_team_role(
        &self,
        team_id: Uuid,
        principal_id: &str,
        check: &RosterCheck<'_>,
    ) -> AccessResult<bool> {
        let mut state = self.state.write();
        check(&state.team(team_id).ok_or(AccessError::NotFoundOrDenied)?)?;
        let team = state
            .teams
            .get_mut(&team_id)
            .ok_or(AccessError::NotFoundOrDenied)?;
        let Some(pos) = team.roster.iter().position(|e| e.principal_id == principal_id) else {
            return Ok(false);
        };
        if team.roster[pos].role == TeamRole::MainManager {
            return Err(AccessError::conflict("cannot remove the main manager"));
        }
        team.roster.remove(pos);
        Ok(true)
    }
}
