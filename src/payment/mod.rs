pub mod stripe;

pub use stripe::StripeGateway;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// Checkout request sent to the payment provider
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// Price in minor currency units
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

/// Hosted checkout page created by the provider
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Provider-side state of a checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Expired,
    Failed,
}

/// Verified webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    CheckoutCompleted {
        session_id: String,
        payment_id: Option<String>,
        order_id: Option<String>,
    },
    PaymentSucceeded {
        payment_id: String,
        order_id: Option<String>,
    },
    PaymentFailed {
        payment_id: String,
        order_id: Option<String>,
    },
    /// Event type this service does not act on
    Ignored(String),
}

/// External payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, req: &CheckoutRequest) -> Result<CheckoutSession>;

    async fn session_status(&self, session_id: &str) -> Result<PaymentStatus>;

    /// Authenticate and parse a webhook body. Any verification failure is
    /// `Unauthorized` with no detail.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<PaymentEvent>;
}
