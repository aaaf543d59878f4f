use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    OrderStatus, PurchaseCreateRequest, PurchaseCreateResponse, PurchaseSyncResponse, StorageOrder,
};
use crate::payment::{CheckoutRequest, PaymentEvent, PaymentGateway, PaymentStatus};
use crate::services::QuotaLedger;

const GIB: i64 = 1024 * 1024 * 1024;
const DEFAULT_CURRENCY: &str = "usd";

/// Fixed price tiers, in minor currency units
const PRICE_TIERS: [(i64, i64); 5] = [
    (10 * GIB, 999),
    (50 * GIB, 3999),
    (100 * GIB, 6999),
    (500 * GIB, 29999),
    (1024 * GIB, 49999),
];
const PRICE_PER_GIB: i64 = 10;
const MIN_PRICE: i64 = 499;

/// Capacity purchases backed by an external payment provider
pub struct StoragePurchaseService;

impl StoragePurchaseService {
    pub fn price_for(storage_amount: i64) -> i64 {
        PRICE_TIERS
            .iter()
            .find(|(bytes, _)| *bytes == storage_amount)
            .map(|(_, price)| *price)
            .unwrap_or_else(|| ((storage_amount / GIB) * PRICE_PER_GIB).max(MIN_PRICE))
    }

    /// Create a pending order and its checkout session
    pub async fn create(
        db: &Database,
        gateway: &dyn PaymentGateway,
        user_id: &str,
        req: PurchaseCreateRequest,
    ) -> Result<PurchaseCreateResponse> {
        if req.storage_amount <= 0 {
            return Err(AppError::BadRequest("storage_amount must be positive".to_string()));
        }
        let currency = req
            .currency
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let price = Self::price_for(req.storage_amount);

        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO storage_order (id, owner_user_id, storage_amount, price_amount, currency, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&order_id)
        .bind(user_id)
        .bind(req.storage_amount)
        .bind(price)
        .bind(&currency)
        .bind(&now)
        .bind(&now)
        .execute(db.pool())
        .await?;

        let mut metadata = HashMap::new();
        metadata.insert("order_id".to_string(), order_id.clone());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("storage_amount".to_string(), req.storage_amount.to_string());

        let checkout = CheckoutRequest {
            amount: price,
            currency,
            description: format!("Storage upgrade: {} GB", req.storage_amount / GIB),
            metadata,
        };
        let session = match gateway.create_checkout_session(&checkout).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(order_id = %order_id, "Checkout session creation failed: {}", e);
                Self::mark_failed(db, &order_id).await?;
                return Err(match e {
                    AppError::Payment(msg) => AppError::Payment(msg),
                    other => AppError::Payment(other.to_string()),
                });
            }
        };

        sqlx::query("UPDATE storage_order SET external_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(&session.id)
            .bind(Utc::now().to_rfc3339())
            .bind(&order_id)
            .execute(db.pool())
            .await?;

        tracing::info!(user_id = %user_id, order_id = %order_id, price, "Created storage order");
        Ok(PurchaseCreateResponse {
            order_id,
            session_id: session.id,
            url: session.url,
        })
    }

    /// Ask the provider for the session state and apply it to the caller's order
    pub async fn sync(
        db: &Database,
        gateway: &dyn PaymentGateway,
        user_id: &str,
        session_id: &str,
    ) -> Result<PurchaseSyncResponse> {
        let order: StorageOrder = sqlx::query_as(
            "SELECT * FROM storage_order WHERE external_session_id = ? AND owner_user_id = ?",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

        let respond = |status: OrderStatus, message: &str| PurchaseSyncResponse {
            status,
            storage_amount: order.storage_amount,
            message: message.to_string(),
        };

        match order.get_status() {
            Some(OrderStatus::Paid) => return Ok(respond(OrderStatus::Paid, "Order already paid")),
            Some(OrderStatus::Failed) => return Ok(respond(OrderStatus::Failed, "Order failed")),
            _ => {}
        }

        let status = gateway.session_status(session_id).await?;
        Ok(match status {
            PaymentStatus::Paid => {
                Self::mark_paid(db, &order.id, None).await?;
                respond(OrderStatus::Paid, "Payment confirmed, storage added")
            }
            PaymentStatus::Unpaid => respond(OrderStatus::Pending, "Payment not completed yet"),
            PaymentStatus::Expired | PaymentStatus::Failed => {
                Self::mark_failed(db, &order.id).await?;
                respond(OrderStatus::Failed, "Payment failed or expired")
            }
        })
    }

    /// Verify and apply a provider webhook. Unknown orders and event types
    /// are acknowledged without change.
    pub async fn handle_webhook(
        db: &Database,
        gateway: &dyn PaymentGateway,
        payload: &[u8],
        signature: &str,
    ) -> Result<()> {
        let event = gateway.verify_webhook(payload, signature)?;

        match event {
            PaymentEvent::CheckoutCompleted {
                session_id,
                payment_id,
                order_id,
            } => {
                let found: Option<(String,)> =
                    sqlx::query_as("SELECT id FROM storage_order WHERE external_session_id = ?")
                        .bind(&session_id)
                        .fetch_optional(db.pool())
                        .await?;
                match found.map(|f| f.0).or(order_id) {
                    Some(id) => {
                        Self::mark_paid(db, &id, payment_id.as_deref()).await?;
                    }
                    None => tracing::warn!(session_id = %session_id, "Webhook for unknown checkout session"),
                }
            }
            PaymentEvent::PaymentSucceeded { payment_id, order_id } => {
                match Self::find_by_payment(db, &payment_id, order_id).await? {
                    Some(id) => {
                        Self::mark_paid(db, &id, Some(&payment_id)).await?;
                    }
                    None => tracing::warn!(payment_id = %payment_id, "Webhook for unknown payment"),
                }
            }
            PaymentEvent::PaymentFailed { payment_id, order_id } => {
                match Self::find_by_payment(db, &payment_id, order_id).await? {
                    Some(id) => {
                        Self::mark_failed(db, &id).await?;
                    }
                    None => tracing::warn!(payment_id = %payment_id, "Webhook for unknown payment"),
                }
            }
            PaymentEvent::Ignored(kind) => {
                tracing::debug!("Ignoring webhook event {}", kind);
            }
        }
        Ok(())
    }

    async fn find_by_payment(
        db: &Database,
        payment_id: &str,
        order_id: Option<String>,
    ) -> Result<Option<String>> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT id FROM storage_order WHERE external_payment_id = ?")
                .bind(payment_id)
                .fetch_optional(db.pool())
                .await?;
        if let Some((id,)) = found {
            return Ok(Some(id));
        }

        let Some(order_id) = order_id else {
            return Ok(None);
        };
        let found: Option<(String,)> = sqlx::query_as("SELECT id FROM storage_order WHERE id = ?")
            .bind(&order_id)
            .fetch_optional(db.pool())
            .await?;
        Ok(found.map(|f| f.0))
    }

    /// pending -> paid, crediting capacity in the same transaction. Returns
    /// false when the order was not pending, so repeated signals credit once.
    pub async fn mark_paid(db: &Database, order_id: &str, payment_id: Option<&str>) -> Result<bool> {
        let mut tx = db.pool().begin().await?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE storage_order
            SET status = 'paid', external_payment_id = COALESCE(?, external_payment_id), updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(payment_id)
        .bind(&now)
        .bind(order_id)
        .execute(tx.as_mut())
        .await?;

        if result.rows_affected() == 0 {
            // Already settled; still record a late payment id
            if let Some(payment_id) = payment_id {
                sqlx::query(
                    "UPDATE storage_order SET external_payment_id = ? WHERE id = ? AND external_payment_id IS NULL",
                )
                .bind(payment_id)
                .bind(order_id)
                .execute(tx.as_mut())
                .await?;
            }
            tx.commit().await?;
            tracing::debug!(order_id = %order_id, "Order not pending, paid signal ignored");
            return Ok(false);
        }

        let (owner, amount): (String, i64) =
            sqlx::query_as("SELECT owner_user_id, storage_amount FROM storage_order WHERE id = ?")
                .bind(order_id)
                .fetch_one(tx.as_mut())
                .await?;
        QuotaLedger::grant_capacity(tx.as_mut(), &owner, amount).await?;
        tx.commit().await?;

        tracing::info!(order_id = %order_id, user_id = %owner, amount, "Order paid");
        Ok(true)
    }

    /// pending -> failed. Paid orders stay paid.
    pub async fn mark_failed(db: &Database, order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE storage_order SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(order_id)
        .execute(db.pool())
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            tracing::info!(order_id = %order_id, "Order failed");
        }
        Ok(changed)
    }

    /// The user's orders, newest first
    pub async fn list_orders(
        db: &Database,
        user_id: &str,
        status: Option<&str>,
    ) -> Result<Vec<StorageOrder>> {
        let status = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Some(
                OrderStatus::from_str(s)
                    .ok_or_else(|| AppError::BadRequest(format!("Unknown order status: {}", s)))?,
            ),
            None => None,
        };

        let orders = sqlx::query_as(
            r#"
            SELECT * FROM storage_order
            WHERE owner_user_id = ? AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(db.pool())
        .await?;
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use crate::payment::CheckoutSession;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory gateway: every checkout gets id `cs_<n>`, status is set by
    /// the test, and any signature equal to "valid" passes
    #[derive(Default)]
    struct FakeGateway {
        status: Mutex<Option<PaymentStatus>>,
        fail_create: bool,
        created: Mutex<Vec<CheckoutRequest>>,
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_checkout_session(&self, req: &CheckoutRequest) -> Result<CheckoutSession> {
            if self.fail_create {
                return Err(AppError::Payment("provider down".to_string()));
            }
            let mut created = self.created.lock().unwrap();
            created.push(req.clone());
            let id = format!("cs_{}", created.len());
            Ok(CheckoutSession {
                url: format!("https://pay.example.com/{}", id),
                id,
            })
        }

        async fn session_status(&self, _session_id: &str) -> Result<PaymentStatus> {
            Ok(self.status.lock().unwrap().unwrap_or(PaymentStatus::Unpaid))
        }

        fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<PaymentEvent> {
            if signature != "valid" {
                return Err(AppError::Unauthorized("Invalid webhook signature".to_string()));
            }
            crate::payment::stripe::parse_event(payload)
        }
    }

    async fn setup() -> (Database, tempfile::TempDir) {
        let (db, dir) = test_database().await;
        QuotaLedger::open_account(&db, "alice", 100).await.unwrap();
        (db, dir)
    }

    async fn total(db: &Database) -> i64 {
        QuotaLedger::get_account(db, "alice").await.unwrap().total_bytes
    }

    fn purchase(amount: i64) -> PurchaseCreateRequest {
        PurchaseCreateRequest {
            storage_amount: amount,
            currency: None,
        }
    }

    #[test]
    fn test_price_table() {
        assert_eq!(StoragePurchaseService::price_for(10 * GIB), 999);
        assert_eq!(StoragePurchaseService::price_for(1024 * GIB), 49999);
        assert_eq!(StoragePurchaseService::price_for(200 * GIB), 2000);
        assert_eq!(StoragePurchaseService::price_for(GIB), 499);
    }

    #[tokio::test]
    async fn test_create_records_pending_order() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();

        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(10 * GIB))
            .await
            .unwrap();
        assert_eq!(resp.session_id, "cs_1");

        let orders = StoragePurchaseService::list_orders(&db, "alice", Some("pending")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price_amount, 999);
        assert_eq!(orders[0].currency, "usd");
        assert_eq!(orders[0].external_session_id.as_deref(), Some("cs_1"));

        let sent = gateway.created.lock().unwrap();
        assert_eq!(sent[0].metadata.get("order_id"), Some(&resp.order_id));

        assert!(StoragePurchaseService::create(&db, &gateway, "alice", purchase(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_order_failed() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway {
            fail_create: true,
            ..Default::default()
        };

        assert!(matches!(
            StoragePurchaseService::create(&db, &gateway, "alice", purchase(GIB)).await,
            Err(AppError::Payment(_))
        ));
        let failed = StoragePurchaseService::list_orders(&db, "alice", Some("failed")).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_transitions() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();
        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(50)).await.unwrap();

        let pending = StoragePurchaseService::sync(&db, &gateway, "alice", &resp.session_id).await.unwrap();
        assert_eq!(pending.status, OrderStatus::Pending);
        assert_eq!(total(&db).await, 100);

        // Other users cannot sync someone else's session
        assert!(matches!(
            StoragePurchaseService::sync(&db, &gateway, "mallory", &resp.session_id).await,
            Err(AppError::NotFound(_))
        ));

        *gateway.status.lock().unwrap() = Some(PaymentStatus::Paid);
        let paid = StoragePurchaseService::sync(&db, &gateway, "alice", &resp.session_id).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(total(&db).await, 150);

        let again = StoragePurchaseService::sync(&db, &gateway, "alice", &resp.session_id).await.unwrap();
        assert_eq!(again.status, OrderStatus::Paid);
        assert_eq!(total(&db).await, 150);
    }

    #[tokio::test]
    async fn test_sync_expired_session_fails_order() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();
        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(50)).await.unwrap();

        *gateway.status.lock().unwrap() = Some(PaymentStatus::Expired);
        let result = StoragePurchaseService::sync(&db, &gateway, "alice", &resp.session_id).await.unwrap();
        assert_eq!(result.status, OrderStatus::Failed);

        // A late paid signal cannot revive it
        assert!(!StoragePurchaseService::mark_paid(&db, &resp.order_id, None).await.unwrap());
        assert_eq!(total(&db).await, 100);
    }

    #[tokio::test]
    async fn test_webhook_credits_once() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();
        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(25)).await.unwrap();

        let body = format!(
            r#"{{"type":"payment_intent.succeeded","data":{{"object":{{"id":"pi_9","metadata":{{"order_id":"{}"}}}}}}}}"#,
            resp.order_id
        );
        StoragePurchaseService::handle_webhook(&db, &gateway, body.as_bytes(), "valid").await.unwrap();
        StoragePurchaseService::handle_webhook(&db, &gateway, body.as_bytes(), "valid").await.unwrap();
        assert_eq!(total(&db).await, 125);

        let completed = r#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_1","payment_intent":"pi_9"}}}"#;
        StoragePurchaseService::handle_webhook(&db, &gateway, completed.as_bytes(), "valid").await.unwrap();
        assert_eq!(total(&db).await, 125);

        let orders = StoragePurchaseService::list_orders(&db, "alice", None).await.unwrap();
        assert_eq!(orders[0].get_status(), Some(OrderStatus::Paid));
        assert_eq!(orders[0].external_payment_id.as_deref(), Some("pi_9"));
    }

    #[tokio::test]
    async fn test_unverified_webhook_changes_nothing() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();
        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(25)).await.unwrap();

        let body = format!(
            r#"{{"type":"payment_intent.succeeded","data":{{"object":{{"id":"pi_1","metadata":{{"order_id":"{}"}}}}}}}}"#,
            resp.order_id
        );
        assert!(matches!(
            StoragePurchaseService::handle_webhook(&db, &gateway, body.as_bytes(), "forged").await,
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(total(&db).await, 100);

        // Unknown orders are acknowledged
        let unknown = r#"{"type":"payment_intent.payment_failed","data":{"object":{"id":"pi_x"}}}"#;
        StoragePurchaseService::handle_webhook(&db, &gateway, unknown.as_bytes(), "valid").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_webhook_after_paid_keeps_paid() {
        let (db, _dir) = setup().await;
        let gateway = FakeGateway::default();
        let resp = StoragePurchaseService::create(&db, &gateway, "alice", purchase(25)).await.unwrap();
        assert!(StoragePurchaseService::mark_paid(&db, &resp.order_id, Some("pi_5")).await.unwrap());

        let failed = r#"{"type":"payment_intent.payment_failed","data":{"object":{"id":"pi_5"}}}"#;
        StoragePurchaseService::handle_webhook(&db, &gateway, failed.as_bytes(), "valid").await.unwrap();

        let orders = StoragePurchaseService::list_orders(&db, "alice", Some("paid")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(total(&db).await, 125);
    }
}
