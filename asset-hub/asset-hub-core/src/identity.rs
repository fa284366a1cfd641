//! Identity provider client.
//!
//! The user directory is a GraphQL service; the core only asks whether a
//! principal exists and which role it holds.

use crate::error::{AccessError, AccessResult};
use crate::model::Role;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const FETCH_USERS_QUERY: &str = "query { fetchUsers { userID username email role } }";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// Raw role string; the directory may know roles this crate does not.
    pub role: String,
}

impl UserRecord {
    pub fn role(&self) -> Option<Role> {
        self.role.parse().ok()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the directory answered and the principal is unknown;
    /// `Err(Transient)` when the directory could not be reached.
    async fn lookup(&self, principal_id: &str) -> AccessResult<Option<UserRecord>>;
}

/// Fail with `ValidationFailed` unless the principal exists.
pub async fn require_user(
    provider: &dyn IdentityProvider,
    principal_id: &str,
) -> AccessResult<UserRecord> {
    provider
        .lookup(principal_id)
        .await?
        .ok_or_else(|| AccessError::validation(format!("user {principal_id} not found")))
}

/// Fail with `ValidationFailed` unless the principal exists and holds `role`.
pub async fn require_role(
    provider: &dyn IdentityProvider,
    principal_id: &str,
    role: Role,
) -> AccessResult<UserRecord> {
    let user = require_user(provider, principal_id).await?;
    if user.role() != Some(role) {
        return Err(AccessError::validation(format!(
            "user {principal_id} does not have the {} role",
            role.as_str()
        )));
    }
    Ok(user)
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<FetchUsersData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct FetchUsersData {
    #[serde(rename = "fetchUsers")]
    fetch_users: Vec<UserRecord>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

/// Directory backed by the user service's `fetchUsers` query.
pub struct GraphQlDirectory {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl GraphQlDirectory {
    pub fn new(base_url: &str, token: Option<String>) -> AccessResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: format!("{}/query", base_url.trim_end_matches('/')),
            token,
            client,
        })
    }

    async fn fetch_users(&self) -> AccessResult<Vec<UserRecord>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&GraphQlRequest {
                query: FETCH_USERS_QUERY,
            });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AccessError::transient(format!(
                "user service returned {status}: {body}"
            )));
        }
        let body: GraphQlResponse = response.json().await?;
        if let Some(err) = body.errors.first() {
            return Err(AccessError::transient(format!(
                "user service error: {}",
                err.message
            )));
        }
        Ok(body.data.map(|d| d.fetch_users).unwrap_or_default())
    }
}

#[async_trait]
impl IdentityProvider for GraphQlDirectory {
    async fn lookup(&self, principal_id: &str) -> AccessResult<Option<UserRecord>> {
        let users = self.fetch_users().await?;
        Ok(users.into_iter().find(|u| u.user_id == principal_id))
    }
}

/// In-process directory, used by tests and local runs.
#[derive(Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<'a>(users: impl IntoIterator<Item = (&'a str, Role)>) -> Self {
        let dir = Self::new();
        for (id, role) in users {
            dir.insert(id, role);
        }
        dir
    }

    pub fn insert(&self, id: &str, role: Role) {
        self.users.write().insert(
            id.to_string(),
            UserRecord {
                user_id: id.to_string(),
                username: id.to_string(),
                email: format!("{id}@example.test"),
                role: role.as_str().to_string(),
            },
        );
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn lookup(&self, principal_id: &str) -> AccessResult<Option<UserRecord>> {
        Ok(self.users.read().get(principal_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn require_role_checks_existence_then_role() {
        let dir = StaticDirectory::with_users([("m", Role::Manager), ("x", Role::Member)]);
        assert!(require_role(&dir, "m", Role::Manager).await.is_ok());
        assert!(matches!(
            require_role(&dir, "x", Role::Manager).await,
            Err(AccessError::ValidationFailed(_))
        ));
        assert!(matches!(
            require_user(&dir, "ghost").await,
            Err(AccessError::ValidationFailed(_))
        ));
    }

    #[test]
    fn graphql_payload_decodes() {
        let raw = r#"{"data":{"fetchUsers":[{"userID":"u1","username":"ann","email":"a@x","role":"manager"}]}}"#;
        let parsed: GraphQlResponse = serde_json::from_str(raw).unwrap();
        let users = parsed.data.unwrap().fetch_users;
        assert_eq!(users[0].user_id, "u1");
        assert_eq!(users[0].role(), Some(Role::Manager));
    }

    #[tokio::test]
    async fn unreachable_directory_is_transient() {
        let dir = GraphQlDirectory::new("http://127.0.0.1:9", None).unwrap();
        let err = dir.lookup("u1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
