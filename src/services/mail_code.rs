use chrono::Utc;
use rand::Rng;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::notify::Notifier;

/// Six-digit email verification codes
pub struct MailCodeService;

impl MailCodeService {
    fn normalize_email(email: &str) -> Result<String> {
        let email = email.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
            None => false,
        };
        if !valid {
            return Err(AppError::BadRequest("Invalid email address".to_string()));
        }
        Ok(email)
    }

    /// Generate, store and send a code. A new code replaces any earlier one.
    pub async fn send_code(
        db: &Database,
        notifier: &dyn Notifier,
        email: &str,
        expire_seconds: i64,
    ) -> Result<()> {
        let email = Self::normalize_email(email)?;
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let expires_at = Utc::now().timestamp() + expire_seconds;

        sqlx::query(
            r#"
            INSERT INTO mail_code (email, code, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET code = excluded.code, expires_at = excluded.expires_at
            "#,
        )
        .bind(&email)
        .bind(&code)
        .bind(expires_at)
        .execute(db.pool())
        .await?;

        notifier.send_code(&email, &code).await
    }

    /// Check and consume a code
    pub async fn verify_code(db: &Database, email: &str, code: &str) -> Result<()> {
        let email = Self::normalize_email(email)?;
        let consumed = sqlx::query(
            "DELETE FROM mail_code WHERE email = ? AND code = ? AND expires_at >= ?",
        )
        .bind(&email)
        .bind(code.trim())
        .bind(Utc::now().timestamp())
        .execute(db.pool())
        .await?;

        if consumed.rows_affected() == 0 {
            return Err(AppError::BadRequest("Invalid or expired verification code".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn send_code(&self, address: &str, code: &str) -> Result<()> {
            self.sent.lock().unwrap().push((address.to_string(), code.to_string()));
            Ok(())
        }
    }

    impl Outbox {
        fn last_code(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let (db, _dir) = crate::db::test_database().await;
        let outbox = Outbox::default();

        MailCodeService::send_code(&db, &outbox, " User@Example.com ", 300).await.unwrap();
        let code = outbox.last_code();
        assert_eq!(code.len(), 6);
        assert_eq!(outbox.sent.lock().unwrap()[0].0, "user@example.com");

        MailCodeService::verify_code(&db, "user@example.com", &code).await.unwrap();
        assert!(MailCodeService::verify_code(&db, "user@example.com", &code).await.is_err());
    }

    #[tokio::test]
    async fn test_resend_replaces_and_expiry_applies() {
        let (db, _dir) = crate::db::test_database().await;
        let outbox = Outbox::default();

        MailCodeService::send_code(&db, &outbox, "a@b.io", -1).await.unwrap();
        let expired = outbox.last_code();
        assert!(MailCodeService::verify_code(&db, "a@b.io", &expired).await.is_err());

        MailCodeService::send_code(&db, &outbox, "a@b.io", 300).await.unwrap();
        let fresh = outbox.last_code();
        MailCodeService::verify_code(&db, "a@b.io", &fresh).await.unwrap();

        assert!(MailCodeService::send_code(&db, &outbox, "not-an-email", 300).await.is_err());
    }
}
