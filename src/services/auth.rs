use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use sha2::{Digest, Sha256};

use crate::config::JwtConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::Claims;

/// Turns a bearer credential into a user id
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// User id for a valid, unrevoked credential
    async fn verify(&self, credential: &str) -> Result<String>;

    /// Invalidate a credential before its natural expiry
    async fn revoke(&self, credential: &str) -> Result<()>;
}

/// Verifies HS256 JWTs minted by the account service that shares `secret`,
/// with a server-side revocation list
pub struct JwtIdentity {
    db: Database,
    secret: String,
}

impl JwtIdentity {
    pub fn new(db: Database, config: &JwtConfig) -> Self {
        Self {
            db,
            secret: config.secret.clone(),
        }
    }

    fn decode_claims(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))
    }

    fn hash_token(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentity {
    async fn verify(&self, credential: &str) -> Result<String> {
        let claims = self.decode_claims(credential)?;

        let revoked: Option<(i64,)> =
            sqlx::query_as("SELECT expires_at FROM revoked_token WHERE token_hash = ?")
                .bind(Self::hash_token(credential))
                .fetch_optional(self.db.pool())
                .await?;
        if revoked.is_some() {
            return Err(AppError::Unauthorized("Session expired".to_string()));
        }

        Ok(claims.sub)
    }

    async fn revoke(&self, credential: &str) -> Result<()> {
        let claims = self.decode_claims(credential)?;
        let now = Utc::now().timestamp();

        // Entries past their token's expiry are no longer needed
        sqlx::query("DELETE FROM revoked_token WHERE expires_at < ?")
            .bind(now)
            .execute(self.db.pool())
            .await?;
        sqlx::query("INSERT OR IGNORE INTO revoked_token (token_hash, expires_at) VALUES (?, ?)")
            .bind(Self::hash_token(credential))
            .bind(claims.exp as i64)
            .execute(self.db.pool())
            .await?;

        tracing::info!(user_id = %claims.sub, "Token revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use uuid::Uuid;

    fn config(secret: &str) -> JwtConfig {
        JwtConfig {
            secret: secret.to_string(),
        }
    }

    /// Token as the account service would mint it
    fn mint(secret: &str, user_id: &str, lifetime: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp() as usize,
            exp: (now + lifetime).timestamp() as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_issue_verify_revoke() {
        let (db, _dir) = crate::db::test_database().await;
        let identity = JwtIdentity::new(db, &config("secret-a"));

        let token = mint("secret-a", "alice", Duration::hours(1));
        assert_eq!(identity.verify(&token).await.unwrap(), "alice");

        identity.revoke(&token).await.unwrap();
        assert!(matches!(
            identity.verify(&token).await,
            Err(AppError::Unauthorized(_))
        ));

        // Other tokens of the same user are unaffected
        let fresh = mint("secret-a", "alice", Duration::hours(1));
        assert_eq!(identity.verify(&fresh).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_foreign_or_garbage_tokens_rejected() {
        let (db, _dir) = crate::db::test_database().await;
        let ours = JwtIdentity::new(db, &config("secret-a"));

        let token = mint("secret-b", "mallory", Duration::hours(1));
        assert!(matches!(ours.verify(&token).await, Err(AppError::Unauthorized(_))));
        assert!(matches!(ours.verify("not.a.jwt").await, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (db, _dir) = crate::db::test_database().await;
        let identity = JwtIdentity::new(db, &config("secret-a"));

        let stale = mint("secret-a", "alice", Duration::hours(-2));
        assert!(matches!(
            identity.verify(&stale).await,
            Err(AppError::Unauthorized(_))
        ));
    }
}
