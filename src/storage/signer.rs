//! HMAC signing for presigned object links

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies `(key, expires, filename)` triples
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: &str, base_url: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn mac(&self, key: &str, expires: i64, filename: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(filename.as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, key: &str, expires: i64, filename: &str) -> Result<String> {
        let mac = self.mac(key, expires, filename)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build a link valid for `ttl_seconds` from now
    pub fn presigned_url(&self, key: &str, ttl_seconds: i64, filename: Option<&str>) -> Result<String> {
        let expires = Utc::now().timestamp() + ttl_seconds;
        let filename = filename.unwrap_or("");
        let signature = self.sign(key, expires, filename)?;
        let mut url = format!(
            "{}/api/v1/objects/{}?expires={}&signature={}",
            self.base_url, key, expires, signature
        );
        if !filename.is_empty() {
            url.push_str("&filename=");
            url.push_str(&urlencoding::encode(filename));
        }
        Ok(url)
    }

    /// Check signature and expiry. Failures carry no detail.
    pub fn verify(&self, key: &str, expires: i64, filename: &str, signature: &str) -> Result<()> {
        let denied = || AppError::Unauthorized("Invalid or expired link".to_string());

        if expires < Utc::now().timestamp() {
            return Err(denied());
        }
        let provided = hex::decode(signature).map_err(|_| denied())?;
        self.mac(key, expires, filename)?
            .verify_slice(&provided)
            .map_err(|_| denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = UrlSigner::new("secret", "http://localhost:8888/");
        let expires = Utc::now().timestamp() + 60;
        let sig = signer.sign("objects/a.txt", expires, "a.txt").unwrap();

        assert!(signer.verify("objects/a.txt", expires, "a.txt", &sig).is_ok());
        assert!(signer.verify("objects/b.txt", expires, "a.txt", &sig).is_err());
        assert!(signer.verify("objects/a.txt", expires, "", &sig).is_err());
        assert!(signer.verify("objects/a.txt", expires, "a.txt", "zz").is_err());
    }

    #[test]
    fn test_expired_link_rejected() {
        let signer = UrlSigner::new("secret", "http://localhost:8888");
        let expires = Utc::now().timestamp() - 1;
        let sig = signer.sign("objects/a.txt", expires, "").unwrap();
        assert!(signer.verify("objects/a.txt", expires, "", &sig).is_err());
    }

    #[test]
    fn test_presigned_url_shape() {
        let signer = UrlSigner::new("secret", "http://localhost:8888/");
        let url = signer
            .presigned_url("objects/x.pdf", 60, Some("my report.pdf"))
            .unwrap();
        assert!(url.starts_with("http://localhost:8888/api/v1/objects/objects/x.pdf?expires="));
        assert!(url.ends_with("&filename=my%20report.pdf"));
    }
}
