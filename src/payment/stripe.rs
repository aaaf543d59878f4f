//! Stripe Checkout over the REST API

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use crate::config::StripeConfig;
use crate::error::{AppError, Result};
use crate::payment::{CheckoutRequest, CheckoutSession, PaymentEvent, PaymentGateway, PaymentStatus};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeGateway {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
    success_url: String,
    cancel_url: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Deserialize)]
struct WebhookObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
        })
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(AppError::Payment("Stripe secret key not configured".to_string()));
        }
        Ok(())
    }

    async fn read_session(resp: reqwest::Response) -> Result<SessionResponse> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ApiErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(AppError::Payment(format!("Stripe API error: {}", message)));
        }
        Ok(resp.json::<SessionResponse>().await?)
    }

    /// Append `{CHECKOUT_SESSION_ID}` so the return page can sync the order
    fn success_url(&self) -> String {
        let sep = if self.success_url.contains('?') { '&' } else { '?' };
        format!("{}{}session_id={{CHECKOUT_SESSION_ID}}", self.success_url, sep)
    }
}

/// Check a `t=<unix>,v1=<hex>[,v1=<hex>]` header against the raw body
pub fn verify_signature(secret: &str, payload: &[u8], header: &str, now: i64) -> Result<()> {
    let denied = || AppError::Unauthorized("Invalid webhook signature".to_string());

    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(denied)?;
    if signatures.is_empty() || (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(denied());
    }

    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(denied())
}

/// Map a verified event body onto the events this service handles
pub fn parse_event(payload: &[u8]) -> Result<PaymentEvent> {
    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook body: {}", e)))?;
    let object = event.data.object;
    let order_id = object.metadata.get("order_id").cloned();

    Ok(match event.event_type.as_str() {
        "checkout.session.completed" => PaymentEvent::CheckoutCompleted {
            session_id: object.id,
            payment_id: object.payment_intent,
            order_id,
        },
        "payment_intent.succeeded" => PaymentEvent::PaymentSucceeded {
            payment_id: object.id,
            order_id,
        },
        "payment_intent.payment_failed" => PaymentEvent::PaymentFailed {
            payment_id: object.id,
            order_id,
        },
        other => PaymentEvent::Ignored(other.to_string()),
    })
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(&self, req: &CheckoutRequest) -> Result<CheckoutSession> {
        self.ensure_configured()?;

        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), self.success_url()),
            ("cancel_url".into(), self.cancel_url.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("line_items[0][price_data][currency]".into(), req.currency.clone()),
            ("line_items[0][price_data][unit_amount]".into(), req.amount.to_string()),
            ("line_items[0][price_data][product_data][name]".into(), req.description.clone()),
        ];
        for (k, v) in &req.metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
            form.push((format!("payment_intent_data[metadata][{}]", k), v.clone()));
        }

        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;
        let session = Self::read_session(resp).await?;

        let url = session
            .url
            .ok_or_else(|| AppError::Payment("Checkout session has no URL".to_string()))?;
        tracing::info!(session_id = %session.id, amount = req.amount, "Created checkout session");
        Ok(CheckoutSession { id: session.id, url })
    }

    async fn session_status(&self, session_id: &str) -> Result<PaymentStatus> {
        self.ensure_configured()?;

        let resp = self
            .http
            .get(format!(
                "{}/v1/checkout/sessions/{}",
                self.api_base,
                urlencoding::encode(session_id)
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        let session = Self::read_session(resp).await?;

        let status = match (session.payment_status.as_deref(), session.status.as_deref()) {
            (Some("paid") | Some("no_payment_required"), _) => PaymentStatus::Paid,
            (_, Some("expired")) => PaymentStatus::Expired,
            (Some("unpaid"), _) => PaymentStatus::Unpaid,
            _ => PaymentStatus::Failed,
        };
        tracing::debug!(session_id = %session_id, ?status, "Fetched checkout session status");
        Ok(status)
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<PaymentEvent> {
        if self.webhook_secret.is_empty() {
            return Err(AppError::Payment("Stripe webhook secret not configured".to_string()));
        }
        verify_signature(&self.webhook_secret, payload, signature, Utc::now().timestamp())?;
        parse_event(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8], t: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(t.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", t, sig)
    }

    #[test]
    fn test_signature_verification() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let now = 1_700_000_000;
        let header = sign("whsec_test", payload, now);

        assert!(verify_signature("whsec_test", payload, &header, now + 10).is_ok());
        // Wrong secret, tampered body, stale timestamp
        assert!(verify_signature("whsec_other", payload, &header, now).is_err());
        assert!(verify_signature("whsec_test", b"{}", &header, now).is_err());
        assert!(verify_signature("whsec_test", payload, &header, now + 301).is_err());
        assert!(verify_signature("whsec_test", payload, "garbage", now).is_err());
    }

    #[test]
    fn test_extra_signatures_are_tried() {
        let payload = b"{}";
        let now = 1_700_000_000;
        let header = sign("whsec_test", payload, now).replace(",v1=", ",v1=00ff,v1=");
        assert!(verify_signature("whsec_test", payload, &header, now).is_ok());
    }

    #[test]
    fn test_parse_events() {
        let completed = br#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_1","payment_intent":"pi_1","metadata":{"order_id":"o1"}}}}"#;
        assert_eq!(
            parse_event(completed).unwrap(),
            PaymentEvent::CheckoutCompleted {
                session_id: "cs_1".to_string(),
                payment_id: Some("pi_1".to_string()),
                order_id: Some("o1".to_string()),
            }
        );

        let failed = br#"{"type":"payment_intent.payment_failed","data":{"object":{"id":"pi_2"}}}"#;
        assert_eq!(
            parse_event(failed).unwrap(),
            PaymentEvent::PaymentFailed {
                payment_id: "pi_2".to_string(),
                order_id: None,
            }
        );

        let other = br#"{"type":"charge.refunded","data":{"object":{"id":"ch_1"}}}"#;
        assert_eq!(
            parse_event(other).unwrap(),
            PaymentEvent::Ignored("charge.refunded".to_string())
        );
    }
}
