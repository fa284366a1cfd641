use crate::model::{Principal, Role};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Claims carried by access tokens issued by the user service.
#[derive(Deserialize, Clone, Debug)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: u64,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Principal>;
}

/// HS256 verifier. The secret is handed in at construction time; there is
/// no process-wide key.
pub struct Hs256Verifier {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256Verifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for Hs256Verifier {
    async fn verify(&self, token: &str) -> Option<Principal> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .ok()?
            .claims;
        let role = claims.role.as_deref()?.parse::<Role>().ok()?;
        Some(Principal::new(claims.user_id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        #[serde(rename = "userId")]
        user_id: &'a str,
        role: Option<&'a str>,
        exp: u64,
    }

    fn token(secret: &str, role: Option<&str>, exp: u64) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                user_id: "u1",
                role,
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    #[tokio::test]
    async fn valid_token_yields_principal() {
        let verifier = Hs256Verifier::new("s3cret");
        let principal = verifier
            .verify(&format!("Bearer {}", token("s3cret", Some("manager"), in_one_hour())))
            .await
            .unwrap();
        assert_eq!(principal, Principal::manager("u1"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let verifier = Hs256Verifier::new("s3cret");
        assert!(verifier
            .verify(&token("other", Some("member"), in_one_hour()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn expired_or_roleless_tokens_are_rejected() {
        let verifier = Hs256Verifier::new("s3cret");
        assert!(verifier.verify(&token("s3cret", Some("member"), 1)).await.is_none());
        assert!(verifier
            .verify(&token("s3cret", None, in_one_hour()))
            .await
            .is_none());
    }
}
