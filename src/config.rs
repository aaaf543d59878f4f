use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub share: ShareConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared with the account service that mints the tokens
    #[serde(default = "default_jwt_secret")]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_local_path")]
    pub local_path: String,
    /// Base URL prepended to presigned object links
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Key used to sign presigned links; generated at startup when empty
    #[serde(default)]
    pub presign_secret: String,
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_total_bytes")]
    pub default_total_bytes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_direct_bytes")]
    pub max_direct_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub sendgrid_api_key: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_code_expire")]
    pub code_expire_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareConfig {
    #[serde(default = "default_share_expire")]
    pub default_expire_seconds: i64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_db_path() -> String {
    "data/cloudpool.db".to_string()
}

fn default_jwt_secret() -> String {
    "change-me-cloudpool-secret".to_string()
}

fn default_local_path() -> String {
    "data/objects".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_presign_ttl() -> u64 {
    72 * 3600
}

fn default_total_bytes() -> i64 {
    5 * 1024 * 1024 * 1024 // 5GB
}

fn default_max_direct_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_success_url() -> String {
    "http://localhost:3000/profile?payment=success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/profile?payment=cancel".to_string()
}

fn default_from_email() -> String {
    "no-reply@cloudpool.local".to_string()
}

fn default_code_expire() -> i64 {
    300
}

fn default_share_expire() -> i64 {
    72 * 3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: default_jwt_secret(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
            public_base_url: default_public_base_url(),
            presign_secret: String::new(),
            presign_ttl_seconds: default_presign_ttl(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_total_bytes: default_total_bytes(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_direct_bytes: default_max_direct_bytes(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            api_base: default_stripe_api_base(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sendgrid_api_key: String::new(),
            from_email: default_from_email(),
            code_expire_seconds: default_code_expire(),
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            default_expire_seconds: default_share_expire(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    /// Precedence: environment > config file > defaults.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        config.ensure_presign_secret();
        if config.jwt.secret == default_jwt_secret() {
            tracing::warn!("Using the built-in JWT secret; set CP_CONF_JWT_SECRET in production");
        }
        Ok(config)
    }

    /// Load configuration from the first config.toml found
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: CP_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server overrides
        if let Some(val) = lookup("CP_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(port) = lookup("CP_CONF_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }

        // Database overrides
        if let Some(val) = lookup("CP_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // JWT overrides
        if let Some(val) = lookup("CP_CONF_JWT_SECRET") {
            self.jwt.secret = val;
        }

        // Storage overrides
        if let Some(val) = lookup("CP_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }
        if let Some(val) = lookup("CP_CONF_STORAGE_PUBLIC_BASE_URL") {
            self.storage.public_base_url = val.trim_end_matches('/').to_string();
        }
        if let Some(val) = lookup("CP_CONF_STORAGE_PRESIGN_SECRET") {
            self.storage.presign_secret = val;
        }

        // Quota overrides
        if let Some(total) = lookup("CP_CONF_QUOTA_DEFAULT_TOTAL_BYTES").and_then(|v| v.parse().ok()) {
            self.quota.default_total_bytes = total;
        }

        // Upload overrides
        if let Some(max) = lookup("CP_CONF_UPLOAD_MAX_DIRECT_BYTES").and_then(|v| v.parse().ok()) {
            self.upload.max_direct_bytes = max;
        }
        if let Some(size) = lookup("CP_CONF_UPLOAD_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.upload.chunk_size = size;
        }

        // Stripe overrides
        if let Some(val) = lookup("CP_CONF_STRIPE_SECRET_KEY") {
            self.stripe.secret_key = val;
        }
        if let Some(val) = lookup("CP_CONF_STRIPE_WEBHOOK_SECRET") {
            self.stripe.webhook_secret = val;
        }
        if let Some(val) = lookup("CP_CONF_STRIPE_SUCCESS_URL") {
            self.stripe.success_url = val;
        }
        if let Some(val) = lookup("CP_CONF_STRIPE_CANCEL_URL") {
            self.stripe.cancel_url = val;
        }

        // Mail overrides
        if let Some(val) = lookup("CP_CONF_MAIL_SENDGRID_API_KEY") {
            self.mail.sendgrid_api_key = val;
        }
        if let Some(val) = lookup("CP_CONF_MAIL_FROM_EMAIL") {
            if !val.trim().is_empty() {
                self.mail.from_email = val;
            }
        }
    }

    fn ensure_presign_secret(&mut self) {
        if self.storage.presign_secret.trim().is_empty() {
            // Links signed with a per-process key stop working after restart
            self.storage.presign_secret = uuid::Uuid::new_v4().to_string();
            tracing::warn!("No presign secret configured, generated an ephemeral one");
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.local_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides_take_precedence() {
        let file: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [quota]
            default_total_bytes = 100
            "#,
        )
        .unwrap();
        assert_eq!(file.server.port, 9000);
        assert_eq!(file.server.host, "0.0.0.0");

        let env: HashMap<&str, &str> = [
            ("CP_CONF_SERVER_PORT", "9100"),
            ("CP_CONF_QUOTA_DEFAULT_TOTAL_BYTES", "200"),
            ("CP_CONF_STORAGE_PUBLIC_BASE_URL", "https://drive.example.com/"),
        ]
        .into_iter()
        .collect();

        let mut config = file;
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.quota.default_total_bytes, 200);
        assert_eq!(config.storage.public_base_url, "https://drive.example.com");
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| {
            (key == "CP_CONF_SERVER_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.server.port, 8888);
    }
}
