use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::packages::TokenPackage;
use crate::stripe::signature::DEFAULT_TOLERANCE_SECONDS;

const DEFAULT_CONFIG_PATH: &str = "config/ledger.toml";
const ENV_PREFIX: &str = "TOKEN_LEDGER";

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    /// Stripe price id per package id.
    #[serde(default)]
    pub packages: HashMap<String, String>,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl LedgerConfig {
    pub fn load() -> Result<Self> {
        let configured_path = std::env::var("TOKEN_LEDGER_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("TOKEN_LEDGER_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/ledger.{env_override}.toml");
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        // Secrets arrive as e.g. TOKEN_LEDGER__STRIPE__WEBHOOK_SECRET
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize ledger configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        assert!(
            !self.database.url.is_empty(),
            "Database URL must be specified"
        );
        assert!(
            self.server.port > 0,
            "Server port must be greater than zero"
        );
        if self.stripe.webhook_secret.trim().is_empty() {
            bail!("stripe.webhook_secret must be configured");
        }
        if self.stripe.secret_key.trim().is_empty() {
            bail!("stripe.secret_key must be configured");
        }
        for package_id in self.packages.keys() {
            if TokenPackage::from_id(package_id).is_none() {
                bail!("packages.{package_id} does not name a known token package");
            }
        }
        assert!(
            self.ledger.signup_bonus >= 0,
            "Signup bonus cannot be negative"
        );
        self.webhook.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        Ok(())
    }

    pub fn price_for(&self, package: TokenPackage) -> Option<&str> {
        self.packages
            .get(package.id())
            .map(String::as_str)
            .filter(|price| !price.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        assert!(self.port < 65535, "HTTP port must be below 65535");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    #[serde(default = "StripeConfig::default_api_base")]
    pub api_base: String,
    pub signature_tolerance_seconds: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn signature_tolerance(&self) -> Duration {
        let seconds = self
            .signature_tolerance_seconds
            .unwrap_or(DEFAULT_TOLERANCE_SECONDS);
        assert!(seconds > 0, "Signature tolerance must be positive");
        assert!(seconds <= 3_600, "Signature tolerance cannot exceed one hour");
        Duration::from_secs(seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(10_000);
        assert!(millis >= 100, "Stripe timeout must be at least 100ms");
        assert!(millis <= 60_000, "Stripe timeout cannot exceed 60 seconds");
        Duration::from_millis(millis)
    }

    fn default_api_base() -> String {
        "https://api.stripe.com".to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerSettings {
    #[serde(default)]
    pub signup_bonus: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl WebhookConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn ensure_bounds(&self) -> Result<()> {
        assert!(self.queue_capacity > 0, "Webhook queue capacity must be positive");
        assert!(
            self.queue_capacity <= 65_536,
            "Webhook queue capacity exceeds defensive limit"
        );
        assert!(self.max_attempts > 0, "Webhook attempts must be positive");
        assert!(self.max_attempts <= 20, "Webhook attempts exceed defensive limit");
        assert!(
            self.retry_backoff_ms <= 60_000,
            "Webhook retry backoff cannot exceed 60 seconds"
        );
        Ok(())
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            max_attempts: 5,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub recent_events_max_capacity: u64,
    pub recent_events_ttl_seconds: u64,
}

impl CacheConfig {
    pub fn recent_events_ttl(&self) -> Duration {
        Duration::from_secs(self.recent_events_ttl_seconds)
    }

    fn ensure_bounds(&self) -> Result<()> {
        assert!(
            self.recent_events_max_capacity >= 100,
            "Recent events cache capacity must be at least 100"
        );
        assert!(
            self.recent_events_ttl_seconds <= 86_400,
            "Recent events cache TTL cannot exceed one day"
        );
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recent_events_max_capacity: 10_000,
            recent_events_ttl_seconds: 3_600,
        }
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
