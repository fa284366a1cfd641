//! Authoritative data model: principals, assets, share grants and teams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type PrincipalId = String;

/// Role asserted by the identity provider for the current request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Manager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Manager => "manager",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "manager" => Ok(Role::Manager),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn member(id: impl Into<String>) -> Self {
        Self::new(id, Role::Member)
    }

    pub fn manager(id: impl Into<String>) -> Self {
        Self::new(id, Role::Manager)
    }

    pub fn is_manager(&self) -> bool {
        self.role == Role::Manager
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
        }
    }

    /// `write` satisfies both levels, `read` only satisfies read.
    pub fn satisfies(self, requested: Permission) -> bool {
        self == Permission::Write || requested == Permission::Read
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            other => Err(format!("unknown permission `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Folder,
    Note,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Folder => "folder",
            ResourceKind::Note => "note",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folder" => Ok(ResourceKind::Folder),
            "note" => Ok(ResourceKind::Note),
            other => Err(format!("unknown resource kind `{other}`")),
        }
    }
}

/// Kind-qualified reference to a folder or note.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: Uuid,
}

impl ResourceRef {
    pub fn folder(id: Uuid) -> Self {
        Self {
            kind: ResourceKind::Folder,
            id,
        }
    }

    pub fn note(id: Uuid) -> Self {
        Self {
            kind: ResourceKind::Note,
            id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Parses the `kind:id` form written by `Display`.
impl FromStr for ResourceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected `kind:id`, got `{s}`"))?;
        Ok(Self {
            kind: kind.parse()?,
            id: id.parse().map_err(|err| format!("bad resource id `{id}`: {err}"))?,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Folder {
    pub fn new(name: impl Into<String>, description: impl Into<String>, owner_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub folder_id: Uuid,
    pub owner_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(
        folder_id: Uuid,
        title: impl Into<String>,
        content: impl Into<String>,
        owner_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: content.into(),
            folder_id,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; empty fields keep their current value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FolderPatch {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotePatch {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareGrant {
    pub resource: ResourceRef,
    pub grantee_id: PrincipalId,
    pub permission: Permission,
    pub granted_by: PrincipalId,
    pub granted_at: DateTime<Utc>,
}

/// Role tag of the single (team, principal) relation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    MainManager,
    Manager,
    Member,
}

impl TeamRole {
    pub fn is_manager(&self) -> bool {
        matches!(self, TeamRole::MainManager | TeamRole::Manager)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TeamRole::MainManager => "main_manager",
            TeamRole::Manager => "manager",
            TeamRole::Member => "member",
        }
    }
}

impl FromStr for TeamRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_manager" => Ok(TeamRole::MainManager),
            "manager" => Ok(TeamRole::Manager),
            "member" => Ok(TeamRole::Member),
            other => Err(format!("unknown team role `{other}`")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamRoleEntry {
    pub principal_id: PrincipalId,
    pub display_name: String,
    pub role: TeamRole,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Ordered by the time each principal joined.
    pub roster: Vec<TeamRoleEntry>,
}

impl Team {
    pub fn role_of(&self, principal_id: &str) -> Option<TeamRole> {
        self.roster
            .iter()
            .find(|e| e.principal_id == principal_id)
            .map(|e| e.role)
    }

    pub fn main_manager(&self) -> Option<&TeamRoleEntry> {
        self.roster.iter().find(|e| e.role == TeamRole::MainManager)
    }

    pub fn managers(&self) -> impl Iterator<Item = &TeamRoleEntry> {
        self.roster.iter().filter(|e| e.role.is_manager())
    }

    pub fn members(&self) -> impl Iterator<Item = &TeamRoleEntry> {
        self.roster.iter().filter(|e| e.role == TeamRole::Member)
    }

    pub fn is_manager(&self, principal_id: &str) -> bool {
        self.role_of(principal_id).is_some_and(|r| r.is_manager())
    }

    pub fn is_main_manager(&self, principal_id: &str) -> bool {
        self.role_of(principal_id) == Some(TeamRole::MainManager)
    }

    pub fn principal_ids(&self) -> Vec<PrincipalId> {
        self.roster.iter().map(|e| e.principal_id.clone()).collect()
    }
}

/// A principal proposed for a new team, or for addition to an existing one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamCandidate {
    pub principal_id: PrincipalId,
    pub display_name: String,
}

impl TeamCandidate {
    pub fn new(principal_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    /// The first entry becomes the main manager.
    pub managers: Vec<TeamCandidate>,
    #[serde(default)]
    pub members: Vec<TeamCandidate>,
}

impl NewTeam {
    /// Roster in insertion order: managers first, the head of the list tagged as main.
    pub fn roster(&self) -> Vec<TeamRoleEntry> {
        let now = Utc::now();
        let managers = self.managers.iter().enumerate().map(|(i, c)| TeamRoleEntry {
            principal_id: c.principal_id.clone(),
            display_name: c.display_name.clone(),
            role: if i == 0 {
                TeamRole::MainManager
            } else {
                TeamRole::Manager
            },
            added_at: now,
        });
        let members = self.members.iter().map(|c| TeamRoleEntry {
            principal_id: c.principal_id.clone(),
            display_name: c.display_name.clone(),
            role: TeamRole::Member,
            added_at: now,
        });
        managers.chain(members).collect()
    }
}

/// Folders and notes returned by bulk listings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetListing {
    pub folders: Vec<Folder>,
    pub notes: Vec<Note>,
}
