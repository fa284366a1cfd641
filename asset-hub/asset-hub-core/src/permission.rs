//! Permission resolver.
//!
//! Pure decision functions over data handed in by the caller. Nothing here
//! performs I/O; the grant store loads [`AccessFacts`] and [`Team`] snapshots
//! and the mutation paths act on the returned [`Decision`].
//!
//! Asset rules, first match wins:
//!
//! 1. role `manager`: granted for everything except deletion, which falls
//!    through to the ownership rule;
//! 2. the owner: granted;
//! 3. a note: its own share grant, then its folder's share grant;
//! 4. a folder: its share grant;
//! 5. otherwise denied.

use crate::error::{AccessError, AccessResult};
use crate::model::{NewTeam, Permission, Principal, PrincipalId, ResourceRef, Role, Team, TeamRole};
use std::collections::HashSet;

/// Operation requested on a folder or note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Delete,
    ManageShares,
}

impl Operation {
    fn required_permission(&self) -> Option<Permission> {
        match self {
            Operation::Read => Some(Permission::Read),
            Operation::Write => Some(Permission::Write),
            Operation::Delete | Operation::ManageShares => None,
        }
    }
}

/// Everything the resolver needs to know about one asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessFacts {
    pub resource: ResourceRef,
    pub owner_id: PrincipalId,
    /// The principal's share grant on the asset itself.
    pub direct_grant: Option<Permission>,
    /// The principal's share grant on the parent folder (notes only).
    pub folder_grant: Option<Permission>,
}

impl AccessFacts {
    fn grants(&self) -> impl Iterator<Item = Permission> {
        self.direct_grant.into_iter().chain(self.folder_grant)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied(AccessError),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }

    pub fn into_result(self) -> AccessResult<()> {
        match self {
            Decision::Granted => Ok(()),
            Decision::Denied(err) => Err(err),
        }
    }
}

/// Decide whether `principal` may perform `op` on the asset described by
/// `facts`. `None` means the asset does not exist and is reported exactly
/// like a denial.
pub fn resolve(principal: &Principal, facts: Option<&AccessFacts>, op: Operation) -> Decision {
    let Some(facts) = facts else {
        return Decision::Denied(AccessError::NotFoundOrDenied);
    };

    if principal.role == Role::Manager && op != Operation::Delete {
        return Decision::Granted;
    }
    if facts.owner_id == principal.id {
        return Decision::Granted;
    }

    if let Some(requested) = op.required_permission() {
        // Note grant first, then the folder grant; either one is enough.
        if facts.grants().any(|g| g.satisfies(requested)) {
            return Decision::Granted;
        }
    }

    // Principals who can already see the asset learn nothing new from a
    // specific refusal; everyone else gets the conflated answer.
    let visible = principal.role == Role::Manager || facts.grants().next().is_some();
    if !visible {
        return Decision::Denied(AccessError::NotFoundOrDenied);
    }
    let reason = match op {
        Operation::Delete => "only the owner may delete this asset",
        Operation::ManageShares => "only the owner or a manager may manage shares",
        Operation::Write => "write access required",
        Operation::Read => "read access required",
    };
    Decision::Denied(AccessError::forbidden(reason))
}

/// Team management operations; the string is the target principal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamOperation<'a> {
    View,
    AddMember(&'a str),
    RemoveMember(&'a str),
    AddManager(&'a str),
    RemoveManager(&'a str),
}

pub fn resolve_team(requester: &Principal, team: Option<&Team>, op: TeamOperation<'_>) -> Decision {
    match check_team(requester, team, op) {
        Ok(()) => Decision::Granted,
        Err(err) => Decision::Denied(err),
    }
}

fn check_team(requester: &Principal, team: Option<&Team>, op: TeamOperation<'_>) -> AccessResult<()> {
    let team = team.ok_or(AccessError::NotFoundOrDenied)?;
    match op {
        TeamOperation::View => Ok(()),
        TeamOperation::AddMember(target) => {
            require_team_manager(requester, team)?;
            match team.role_of(target) {
                Some(TeamRole::Member) => Err(AccessError::conflict(format!(
                    "{target} is already a member of this team"
                ))),
                Some(_) => Err(AccessError::conflict(format!(
                    "{target} is already a manager of this team"
                ))),
                None => Ok(()),
            }
        }
        TeamOperation::RemoveMember(target) => {
            require_team_manager(requester, team)?;
            match team.role_of(target) {
                Some(TeamRole::Member) => Ok(()),
                Some(_) => Err(AccessError::conflict(format!(
                    "{target} is a manager; remove the manager role instead"
                ))),
                None => Err(AccessError::NotFoundOrDenied),
            }
        }
        TeamOperation::AddManager(target) => {
            require_main_manager(requester, team, "only the main manager can add managers")?;
            match team.role_of(target) {
                Some(role) if role.is_manager() => Err(AccessError::conflict(format!(
                    "{target} is already a manager of this team"
                ))),
                // promoting a member is allowed; the member row is replaced
                _ => Ok(()),
            }
        }
        TeamOperation::RemoveManager(target) => {
            // The main manager is permanent, whoever asks.
            if team.is_main_manager(target) {
                return Err(AccessError::conflict("cannot remove the main manager"));
            }
            require_main_manager(requester, team, "only the main manager can remove managers")?;
            if team.is_manager(target) {
                Ok(())
            } else {
                Err(AccessError::NotFoundOrDenied)
            }
        }
    }
}

fn require_team_manager(requester: &Principal, team: &Team) -> AccessResult<()> {
    if team.is_manager(&requester.id) {
        Ok(())
    } else {
        Err(AccessError::forbidden("only team managers can change membership"))
    }
}

fn require_main_manager(requester: &Principal, team: &Team, reason: &str) -> AccessResult<()> {
    if team.is_main_manager(&requester.id) {
        Ok(())
    } else {
        Err(AccessError::forbidden(reason))
    }
}

/// Structural checks for team creation. Identity-provider checks on each
/// proposed principal happen in the service, which has the I/O handle.
pub fn check_new_team(requester: &Principal, team: &NewTeam) -> AccessResult<()> {
    if requester.role != Role::Manager {
        return Err(AccessError::forbidden("only managers can create teams"));
    }
    if team.name.trim().is_empty() {
        return Err(AccessError::validation("team name is required"));
    }
    if team.managers.is_empty() {
        return Err(AccessError::validation("a team needs at least one manager"));
    }
    let mut seen = HashSet::new();
    for candidate in team.managers.iter().chain(&team.members) {
        if !seen.insert(candidate.principal_id.as_str()) {
            return Err(AccessError::validation(format!(
                "{} is listed more than once",
                candidate.principal_id
            )));
        }
    }
    Ok(())
}
