use serde::Serialize;
use sqlx::FromRow;

/// Per-user byte counters
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuotaAccount {
    pub owner_user_id: String,
    pub used_bytes: i64,
    pub total_bytes: i64,
}

/// Quota usage response
#[derive(Debug, Serialize)]
pub struct QuotaUsage {
    pub used: i64,
    pub total: i64,
    pub percentage: u8,
}

impl From<QuotaAccount> for QuotaUsage {
    fn from(account: QuotaAccount) -> Self {
        let percentage = if account.total_bytes > 0 {
            (account.used_bytes as f64 / account.total_bytes as f64 * 100.0)
                .round()
                .min(100.0) as u8
        } else {
            0
        };
        Self {
            used: account.used_bytes,
            total: account.total_bytes,
            percentage,
        }
    }
}
