//! PostgreSQL grant store.
//!
//! Queries are checked at runtime so the crate builds without a database.
//! Multi-row mutations run inside a transaction; dropping an uncommitted
//! `Transaction` rolls it back, so every early `?` return leaves no partial
//! state behind.

use super::{GrantStore, RosterCheck};
use crate::error::{AccessError, AccessResult};
use crate::model::{
    AssetListing, Folder, Note, PrincipalId, ResourceKind, ResourceRef, ShareGrant, Team,
    TeamRole, TeamRoleEntry,
};
use crate::permission::AccessFacts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS folders (
    id          UUID PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    owner_id    TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS folders_owner_idx ON folders (owner_id);

CREATE TABLE IF NOT EXISTS notes (
    id          UUID PRIMARY KEY,
    title       TEXT NOT NULL,
    content     TEXT NOT NULL DEFAULT '',
    folder_id   UUID NOT NULL REFERENCES folders (id) ON DELETE CASCADE,
    owner_id    TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS notes_folder_idx ON notes (folder_id);
CREATE INDEX IF NOT EXISTS notes_owner_idx ON notes (owner_id);

CREATE TABLE IF NOT EXISTS share_grants (
    resource_kind TEXT NOT NULL CHECK (resource_kind IN ('folder', 'note')),
    resource_id   UUID NOT NULL,
    grantee_id    TEXT NOT NULL,
    permission    TEXT NOT NULL CHECK (permission IN ('read', 'write')),
    granted_by    TEXT NOT NULL,
    granted_at    TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (resource_kind, resource_id, grantee_id)
);
CREATE INDEX IF NOT EXISTS share_grants_grantee_idx ON share_grants (grantee_id);

CREATE TABLE IF NOT EXISTS teams (
    id         UUID PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS team_roles (
    team_id      UUID NOT NULL REFERENCES teams (id) ON DELETE CASCADE,
    principal_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL CHECK (role IN ('main_manager', 'manager', 'member')),
    added_at     TIMESTAMPTZ NOT NULL,
    seq          BIGSERIAL,
    PRIMARY KEY (team_id, principal_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS team_roles_one_main
    ON team_roles (team_id) WHERE role = 'main_manager';
"#;

const FOLDER_COLUMNS: &str = "id, name, description, owner_id, created_at, updated_at";
const NOTE_COLUMNS: &str = "id, title, content, folder_id, owner_id, created_at, updated_at";
const SHARE_COLUMNS: &str =
    "resource_kind, resource_id, grantee_id, permission, granted_by, granted_at";
const ROLE_COLUMNS: &str = "team_id, principal_id, display_name, role, added_at";

#[derive(Clone)]
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    pub async fn connect(database_url: &str) -> AccessResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn init_schema(&self) -> AccessResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("grant store schema ready");
        Ok(())
    }
}

fn corrupt(err: String) -> AccessError {
    AccessError::Corrupt(err)
}

fn folder_from_row(row: &PgRow) -> AccessResult<Folder> {
    Ok(Folder {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn note_from_row(row: &PgRow) -> AccessResult<Note> {
    Ok(Note {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        folder_id: row.try_get("folder_id")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn share_from_row(row: &PgRow) -> AccessResult<ShareGrant> {
    let kind: String = row.try_get("resource_kind")?;
    let permission: String = row.try_get("permission")?;
    Ok(ShareGrant {
        resource: ResourceRef {
            kind: kind.parse().map_err(corrupt)?,
            id: row.try_get("resource_id")?,
        },
        grantee_id: row.try_get("grantee_id")?,
        permission: permission.parse().map_err(corrupt)?,
        granted_by: row.try_get("granted_by")?,
        granted_at: row.try_get("granted_at")?,
    })
}

fn role_from_row(row: &PgRow) -> AccessResult<TeamRoleEntry> {
    let role: String = row.try_get("role")?;
    Ok(TeamRoleEntry {
        principal_id: row.try_get("principal_id")?,
        display_name: row.try_get("display_name")?,
        role: role.parse().map_err(corrupt)?,
        added_at: row.try_get("added_at")?,
    })
}

fn permission_column(row: &PgRow, column: &str) -> AccessResult<Option<crate::model::Permission>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|p| p.parse().map_err(corrupt)).transpose()
}

/// Load a team with its roster, holding the team row lock until the
/// surrounding transaction ends. Role writes serialize on that lock.
async fn lock_team(conn: &mut PgConnection, team_id: Uuid) -> AccessResult<Option<Team>> {
    let Some(row) = sqlx::query("SELECT name, created_at FROM teams WHERE id = $1 FOR UPDATE")
        .bind(team_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let roles = sqlx::query(&format!(
        "SELECT {ROLE_COLUMNS} FROM team_roles WHERE team_id = $1 ORDER BY seq"
    ))
    .bind(team_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(Team {
        id: team_id,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        roster: roles.iter().map(role_from_row).collect::<AccessResult<_>>()?,
    }))
}

impl PgGrantStore {
    async fn load_roster(&self, team_id: Uuid) -> AccessResult<Vec<TeamRoleEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROLE_COLUMNS} FROM team_roles WHERE team_id = $1 ORDER BY seq"
        ))
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(role_from_row).collect()
    }
}

#[async_trait]
impl GrantStore for PgGrantStore {
    async fn insert_folder(&self, folder: &Folder) -> AccessResult<()> {
        sqlx::query(
            "INSERT INTO folders (id, name, description, owner_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(folder.id)
        .bind(&folder.name)
        .bind(&folder.description)
        .bind(&folder.owner_id)
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_folder(&self, folder: &Folder) -> AccessResult<()> {
        let result = sqlx::query(
            "UPDATE folders SET name = $2, description = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(folder.id)
        .bind(&folder.name)
        .bind(&folder.description)
        .bind(folder.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccessError::NotFoundOrDenied);
        }
        Ok(())
    }

    async fn get_folder(&self, id: Uuid) -> AccessResult<Option<Folder>> {
        let row = sqlx::query(&format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn delete_folder(&self, id: Uuid) -> AccessResult<Option<Vec<Uuid>>> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM folders WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        let note_ids = sqlx::query("SELECT id FROM notes WHERE folder_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        sqlx::query(
            "DELETE FROM share_grants
             WHERE (resource_kind = 'note' AND resource_id = ANY($1))
                OR (resource_kind = 'folder' AND resource_id = $2)",
        )
        .bind(&note_ids)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        // notes go with the folder via ON DELETE CASCADE
        sqlx::query("DELETE FROM folders WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(note_ids))
    }

    async fn insert_note(&self, note: &Note) -> AccessResult<()> {
        let result = sqlx::query(
            "INSERT INTO notes (id, title, content, folder_id, owner_id, created_at, updated_at)
             SELECT $1, $2, $3, $4, $5, $6, $7
             WHERE EXISTS (SELECT 1 FROM folders WHERE id = $4)",
        )
        .bind(note.id)
        .bind(&note.title)
        .bind(&note.content)
        .bind(note.folder_id)
        .bind(&note.owner_id)
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccessError::NotFoundOrDenied);
        }
        Ok(())
    }

    async fn update_note(&self, note: &Note) -> AccessResult<()> {
        let result = sqlx::query(
            "UPDATE notes SET title = $2, content = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(note.id)
        .bind(&note.title)
        .bind(&note.content)
        .bind(note.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccessError::NotFoundOrDenied);
        }
        Ok(())
    }

    async fn get_note(&self, id: Uuid) -> AccessResult<Option<Note>> {
        let row = sqlx::query(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(note_from_row).transpose()
    }

    async fn delete_note(&self, id: Uuid) -> AccessResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM share_grants WHERE resource_kind = 'note' AND resource_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM notes WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn access_facts(
        &self,
        resource: ResourceRef,
        principal_id: &str,
    ) -> AccessResult<Option<AccessFacts>> {
        let row = match resource.kind {
            ResourceKind::Folder => {
                sqlx::query(
                    "SELECT f.owner_id, g.permission AS direct, NULL::TEXT AS via_folder
                     FROM folders f
                     LEFT JOIN share_grants g
                       ON g.resource_kind = 'folder' AND g.resource_id = f.id AND g.grantee_id = $2
                     WHERE f.id = $1",
                )
                .bind(resource.id)
                .bind(principal_id)
                .fetch_optional(&self.pool)
                .await?
            }
            ResourceKind::Note => {
                sqlx::query(
                    "SELECT n.owner_id, ng.permission AS direct, fg.permission AS via_folder
                     FROM notes n
                     LEFT JOIN share_grants ng
                       ON ng.resource_kind = 'note' AND ng.resource_id = n.id AND ng.grantee_id = $2
                     LEFT JOIN share_grants fg
                       ON fg.resource_kind = 'folder' AND fg.resource_id = n.folder_id AND fg.grantee_id = $2
                     WHERE n.id = $1",
                )
                .bind(resource.id)
                .bind(principal_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AccessFacts {
            resource,
            owner_id: row.try_get("owner_id")?,
            direct_grant: permission_column(&row, "direct")?,
            folder_grant: permission_column(&row, "via_folder")?,
        }))
    }

    async fn upsert_share(&self, grant: &ShareGrant) -> AccessResult<ShareGrant> {
        let mut tx = self.pool.begin().await?;
        let exists_sql = match grant.resource.kind {
            ResourceKind::Folder => "SELECT 1 FROM folders WHERE id = $1 FOR SHARE",
            ResourceKind::Note => "SELECT 1 FROM notes WHERE id = $1 FOR SHARE",
        };
        if sqlx::query(exists_sql)
            .bind(grant.resource.id)
            .fetch_optional(&mut *tx)
            .await?
            .is_none()
        {
            return Err(AccessError::NotFoundOrDenied);
        }
        let row = sqlx::query(&format!(
            "INSERT INTO share_grants ({SHARE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (resource_kind, resource_id, grantee_id)
             DO UPDATE SET permission = EXCLUDED.permission, granted_by = EXCLUDED.granted_by
             RETURNING {SHARE_COLUMNS}"
        ))
        .bind(grant.resource.kind.as_str())
        .bind(grant.resource.id)
        .bind(&grant.grantee_id)
        .bind(grant.permission.as_str())
        .bind(&grant.granted_by)
        .bind(grant.granted_at)
        .fetch_one(&mut *tx)
        .await?;
        let stored = share_from_row(&row)?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn revoke_share(&self, resource: ResourceRef, grantee_id: &str) -> AccessResult<bool> {
        let result = sqlx::query(
            "DELETE FROM share_grants
             WHERE resource_kind = $1 AND resource_id = $2 AND grantee_id = $3",
        )
        .bind(resource.kind.as_str())
        .bind(resource.id)
        .bind(grantee_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_shares(&self, resource: ResourceRef) -> AccessResult<Vec<ShareGrant>> {
        let rows = sqlx::query(&format!(
            "SELECT {SHARE_COLUMNS} FROM share_grants
             WHERE resource_kind = $1 AND resource_id = $2
             ORDER BY granted_at, grantee_id"
        ))
        .bind(resource.kind.as_str())
        .bind(resource.id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(share_from_row).collect()
    }

    async fn assets_for(&self, principals: &[PrincipalId]) -> AccessResult<AssetListing> {
        let ids = principals.to_vec();
        let folders = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders
             WHERE owner_id = ANY($1)
                OR id IN (SELECT resource_id FROM share_grants
                          WHERE resource_kind = 'folder' AND grantee_id = ANY($1))
             ORDER BY created_at, id"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let notes = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes
             WHERE owner_id = ANY($1)
                OR id IN (SELECT resource_id FROM share_grants
                          WHERE resource_kind = 'note' AND grantee_id = ANY($1))
             ORDER BY created_at, id"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(AssetListing {
            folders: folders.iter().map(folder_from_row).collect::<AccessResult<_>>()?,
            notes: notes.iter().map(note_from_row).collect::<AccessResult<_>>()?,
        })
    }

    async fn create_team(&self, name: &str, roster: &[TeamRoleEntry]) -> AccessResult<Team> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO teams (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(name)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        for entry in roster {
            // A duplicate principal or a second main manager violates a
            // unique index and aborts the whole creation.
            sqlx::query(
                "INSERT INTO team_roles (team_id, principal_id, display_name, role, added_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&entry.principal_id)
            .bind(&entry.display_name)
            .bind(entry.role.as_str())
            .bind(entry.added_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Team {
            id,
            name: name.to_string(),
            created_at,
            roster: roster.to_vec(),
        })
    }

    async fn get_team(&self, id: Uuid) -> AccessResult<Option<Team>> {
        let row = sqlx::query("SELECT id, name, created_at FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Team {
            id,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            roster: self.load_roster(id).await?,
        }))
    }

    async fn list_teams(&self) -> AccessResult<Vec<Team>> {
        let teams = sqlx::query("SELECT id, name, created_at FROM teams ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let roles = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM team_roles ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        let mut rosters: HashMap<Uuid, Vec<TeamRoleEntry>> = HashMap::new();
        for row in &roles {
            let team_id: Uuid = row.try_get("team_id")?;
            rosters.entry(team_id).or_default().push(role_from_row(row)?);
        }
        teams
            .iter()
            .map(|row| -> AccessResult<Team> {
                let id: Uuid = row.try_get("id")?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(Team {
                    id,
                    name: row.try_get("name")?,
                    created_at,
                    roster: rosters.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
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
        let mut tx = self.pool.begin().await?;
        let team = lock_team(&mut *tx, team_id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        check(&team)?;
        let result = sqlx::query(
            "INSERT INTO team_roles (team_id, principal_id, display_name, role, added_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (team_id, principal_id)
             DO UPDATE SET role = EXCLUDED.role, display_name = EXCLUDED.display_name
             WHERE team_roles.role <> 'main_manager'",
        )
        .bind(team_id)
        .bind(&entry.principal_id)
        .bind(&entry.display_name)
        .bind(entry.role.as_str())
        .bind(entry.added_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccessError::conflict("cannot change the main manager's role"));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_team_role(
        &self,
        team_id: Uuid,
        principal_id: &str,
        check: &RosterCheck<'_>,
    ) -> AccessResult<bool> {
        let mut tx = self.pool.begin().await?;
        let team = lock_team(&mut *tx, team_id)
            .await?
            .ok_or(AccessError::NotFoundOrDenied)?;
        check(&team)?;
        match team.role_of(principal_id) {
            None => return Ok(false),
            Some(TeamRole::MainManager) => {
                return Err(AccessError::conflict("cannot remove the main manager"))
            }
            Some(_) => {}
        }
        sqlx::query("DELETE FROM team_roles WHERE team_id = $1 AND principal_id = $2")
            .bind(team_id)
            .bind(principal_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}
