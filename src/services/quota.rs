use chrono::Utc;
use sqlx::SqliteConnection;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{QuotaAccount, QuotaUsage};

/// Per-user used/total byte counters.
///
/// Every mutating call takes a connection so the debit or credit commits in
/// the same transaction as the tree change that caused it.
pub struct QuotaLedger;

impl QuotaLedger {
    /// Create the account with `default_total` bytes if the user has none
    pub async fn open_account(db: &Database, user_id: &str, default_total: i64) -> Result<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO quota (owner_user_id, used_bytes, total_bytes, updated_at) VALUES (?, 0, ?, ?)",
        )
        .bind(user_id)
        .bind(default_total)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(user_id = %user_id, total = default_total, "Opened quota account");
        }
        Ok(())
    }

    pub async fn get_account(db: &Database, user_id: &str) -> Result<QuotaAccount> {
        sqlx::query_as(
            "SELECT owner_user_id, used_bytes, total_bytes FROM quota WHERE owner_user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound("Quota account not found".to_string()))
    }

    pub async fn usage(db: &Database, user_id: &str) -> Result<QuotaUsage> {
        Ok(Self::get_account(db, user_id).await?.into())
    }

    /// Non-binding admission check for early rejection before bytes move.
    /// The authoritative check is `admit_and_debit`.
    pub async fn can_admit(db: &Database, user_id: &str, delta: i64) -> Result<bool> {
        let account = Self::get_account(db, user_id).await?;
        Ok(account.used_bytes + delta <= account.total_bytes)
    }

    /// Take the database write lock for this transaction.
    ///
    /// Must be the first statement of any transaction that later writes:
    /// SQLite cannot upgrade a read snapshot to a writer once another
    /// connection has committed, but a waiting writer is queued by the busy
    /// handler.
    pub async fn lock_account(conn: &mut SqliteConnection, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE quota SET used_bytes = used_bytes WHERE owner_user_id = ?")
            .bind(user_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Debit `delta` bytes iff `used + delta <= total`, as a single guarded
    /// update.
    pub async fn admit_and_debit(
        conn: &mut SqliteConnection,
        user_id: &str,
        delta: i64,
    ) -> Result<()> {
        if delta < 0 {
            return Err(AppError::BadRequest("Negative quota debit".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE quota SET used_bytes = used_bytes + ?, updated_at = ?
            WHERE owner_user_id = ? AND used_bytes + ? <= total_bytes
            "#,
        )
        .bind(delta)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .bind(delta)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT used_bytes FROM quota WHERE owner_user_id = ?")
                    .bind(user_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            return match exists {
                Some(_) => {
                    tracing::debug!(user_id = %user_id, delta, "Quota admission rejected");
                    Err(AppError::QuotaExceeded)
                }
                None => Err(AppError::NotFound("Quota account not found".to_string())),
            };
        }
        Ok(())
    }

    /// Return `delta` bytes to the account
    pub async fn credit(conn: &mut SqliteConnection, user_id: &str, delta: i64) -> Result<()> {
        if delta <= 0 {
            return Ok(());
        }

        let result = sqlx::query(
            "UPDATE quota SET used_bytes = MAX(used_bytes - ?, 0), updated_at = ? WHERE owner_user_id = ?",
        )
        .bind(delta)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Quota account not found".to_string()));
        }
        Ok(())
    }

    /// Raise total capacity. Only called on a verified paid transition.
    pub async fn grant_capacity(
        conn: &mut SqliteConnection,
        user_id: &str,
        bytes: i64,
    ) -> Result<()> {
        if bytes <= 0 {
            return Err(AppError::BadRequest("Capacity grant must be positive".to_string()));
        }

        let result = sqlx::query(
            "UPDATE quota SET total_bytes = total_bytes + ?, updated_at = ? WHERE owner_user_id = ?",
        )
        .bind(bytes)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Quota account not found".to_string()));
        }
        tracing::info!(user_id = %user_id, bytes, "Granted storage capacity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let (db, _dir) = test_database().await;
        QuotaLedger::open_account(&db, "u1", 100).await.unwrap();
        QuotaLedger::open_account(&db, "u1", 999).await.unwrap();

        let usage = QuotaLedger::usage(&db, "u1").await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.total, 100);
        assert_eq!(usage.percentage, 0);
    }

    #[tokio::test]
    async fn test_admission_is_exact() {
        let (db, _dir) = test_database().await;
        QuotaLedger::open_account(&db, "u1", 100).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        QuotaLedger::admit_and_debit(&mut conn, "u1", 90).await.unwrap();
        assert!(matches!(
            QuotaLedger::admit_and_debit(&mut conn, "u1", 11).await,
            Err(AppError::QuotaExceeded)
        ));
        assert_eq!(QuotaLedger::get_account(&db, "u1").await.unwrap().used_bytes, 90);

        QuotaLedger::admit_and_debit(&mut conn, "u1", 10).await.unwrap();
        let usage = QuotaLedger::usage(&db, "u1").await.unwrap();
        assert_eq!(usage.used, 100);
        assert_eq!(usage.percentage, 100);
    }

    #[tokio::test]
    async fn test_credit_and_grant() {
        let (db, _dir) = test_database().await;
        QuotaLedger::open_account(&db, "u1", 100).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        QuotaLedger::admit_and_debit(&mut conn, "u1", 40).await.unwrap();
        QuotaLedger::credit(&mut conn, "u1", 15).await.unwrap();
        QuotaLedger::grant_capacity(&mut conn, "u1", 50).await.unwrap();

        let account = QuotaLedger::get_account(&db, "u1").await.unwrap();
        assert_eq!(account.used_bytes, 25);
        assert_eq!(account.total_bytes, 150);
        assert!(QuotaLedger::can_admit(&db, "u1", 125).await.unwrap());
        assert!(!QuotaLedger::can_admit(&db, "u1", 126).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_account() {
        let (db, _dir) = test_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(matches!(
            QuotaLedger::admit_and_debit(&mut conn, "ghost", 1).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            QuotaLedger::usage(&db, "ghost").await,
            Err(AppError::NotFound(_))
        ));
    }
}
