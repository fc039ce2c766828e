//! Service configuration.
//!
//! Loaded from an optional `configuration` file and `OTT__`-prefixed
//! environment variables (`OTT__GATEWAY__KEY_SECRET`, `OTT__SERVER__PORT`, ...).
//! Whether the gateway talks to its sandbox or production API is not
//! configurable here; it follows from the credential (see
//! [`crate::gateway::credential_kind`]).

use secrecy::Secret;
use serde::Deserialize;
use service_core::error::AppError;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub checkout: CheckoutConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    pub admin: AdminConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3010,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    pub url: Secret<String>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayProvider {
    Cashfree,
    Razorpay,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    pub provider: GatewayProvider,
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Only for pointing the client at a stub server.
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct CheckoutConfig {
    pub public_base_url: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    #[serde(default = "default_reference_prefix")]
    pub reference_prefix: String,
}

impl CheckoutConfig {
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    /// Where the gateway sends the customer back after payment.
    pub fn return_url(&self) -> String {
        format!(
            "{}/payment/response?order_id={{order_id}}",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn checkout_url(&self, reference: &str) -> String {
        format!(
            "{}/payment/checkout/{}",
            self.public_base_url.trim_end_matches('/'),
            reference
        )
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconciliationConfig {
    pub stale_after_secs: u64,
    /// 0 disables the periodic sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 900,
            sweep_interval_secs: 300,
        }
    }
}

impl ReconciliationConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct AdminConfig {
    pub token: Secret<String>,
}

fn default_log_level() -> String {
    "info,subscription_service=debug".to_string()
}

fn default_service_name() -> String {
    "subscription-service".to_string()
}

fn default_backend() -> StoreBackend {
    StoreBackend::Mongo
}

fn default_db_name() -> String {
    "subscription_db".to_string()
}

fn default_api_version() -> String {
    "2023-08-01".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_verify_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_currency() -> String {
    "INR".to_string()
}

fn default_duplicate_window_secs() -> u64 {
    600
}

fn default_reference_prefix() -> String {
    "123456".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("OTT").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
