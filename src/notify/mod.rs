pub mod sendgrid;

pub use sendgrid::SendGridNotifier;

use async_trait::async_trait;

use crate::error::Result;

/// Outbound email channel for verification codes
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_code(&self, address: &str, code: &str) -> Result<()>;
}

/// Writes codes to the log instead of sending them. Used when no mail API
/// key is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_code(&self, address: &str, code: &str) -> Result<()> {
        tracing::info!(to = %address, "Verification code: {}", code);
        Ok(())
    }
}
