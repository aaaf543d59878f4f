use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Purchase order state: pending -> paid | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// Storage purchase order
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StorageOrder {
    pub id: String,
    pub owner_user_id: String,
    pub storage_amount: i64,
    pub price_amount: i64,
    pub currency: String,
    pub status: String,
    pub external_session_id: Option<String>,
    #[serde(skip_serializing)]
    pub external_payment_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StorageOrder {
    pub fn get_status(&self) -> Option<OrderStatus> {
        OrderStatus::from_str(&self.status)
    }
}

/// Create purchase request
#[derive(Debug, Deserialize)]
pub struct PurchaseCreateRequest {
    /// Capacity in bytes
    pub storage_amount: i64,
    pub currency: Option<String>,
}

/// Checkout session handed back to the client
#[derive(Debug, Serialize)]
pub struct PurchaseCreateResponse {
    pub order_id: String,
    pub session_id: String,
    pub url: String,
}

/// Sync purchase request
#[derive(Debug, Deserialize)]
pub struct PurchaseSyncRequest {
    pub session_id: String,
}

/// Result of a sync call
#[derive(Debug, Serialize)]
pub struct PurchaseSyncResponse {
    pub status: OrderStatus,
    pub storage_amount: i64,
    pub message: String,
}

/// Order list query
#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<String>,
}
