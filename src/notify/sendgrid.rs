use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::MailConfig;
use crate::error::{AppError, Result};
use crate::notify::Notifier;

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// Sends verification codes through the SendGrid v3 API
pub struct SendGridNotifier {
    http: reqwest::Client,
    api_key: String,
    from_email: String,
    code_expire_seconds: i64,
}

impl SendGridNotifier {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_key: config.sendgrid_api_key.clone(),
            from_email: config.from_email.clone(),
            code_expire_seconds: config.code_expire_seconds,
        })
    }

    fn body(&self, address: &str, code: &str) -> serde_json::Value {
        let minutes = (self.code_expire_seconds / 60).max(1);
        json!({
            "personalizations": [{ "to": [{ "email": address }] }],
            "from": { "email": self.from_email },
            "subject": "Your verification code",
            "content": [
                {
                    "type": "text/plain",
                    "value": format!("Your verification code is {}. It expires in {} minutes.", code, minutes)
                },
                {
                    "type": "text/html",
                    "value": format!("<p>Your verification code is <strong>{}</strong>.</p><p>It expires in {} minutes.</p>", code, minutes)
                }
            ]
        })
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn send_code(&self, address: &str, code: &str) -> Result<()> {
        let resp = self
            .http
            .post(SENDGRID_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&self.body(address, code))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(AppError::Notify(format!("SendGrid returned {}: {}", status, detail)));
        }
        tracing::debug!(to = %address, "Verification code sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body() {
        let notifier = SendGridNotifier::new(&MailConfig::default()).unwrap();
        let body = notifier.body("user@example.com", "123456");
        assert_eq!(body["personalizations"][0]["to"][0]["email"], "user@example.com");
        assert_eq!(body["from"]["email"], "no-reply@cloudpool.local");
        assert!(body["content"][0]["value"]
            .as_str()
            .unwrap()
            .contains("123456"));
    }
}
