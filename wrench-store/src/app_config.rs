use serde::Deserialize;
use std::env;
use wrench_core::settings::{MaintenanceSettings, ReconciliationSettings, ReferralSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationSettings,
    #[serde(default)]
    pub referral: ReferralSettings,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    #[serde(default = "default_booking_topic")]
    pub booking_topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// How long a send may wait for room in the local queue.
    #[serde(default)]
    pub queue_wait_ms: u64,
}

fn default_notification_topic() -> String { "notifications.email".to_string() }
fn default_booking_topic() -> String { "booking.confirmed".to_string() }
fn default_client_id() -> String { "wrench-api".to_string() }
fn default_delivery_timeout_ms() -> u64 { 5000 }

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub api_base: String,
    pub secret_key: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
}

fn default_gateway_timeout() -> u64 { 10 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked developer overrides
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `WRENCH__REFERRAL__BONUS_AMOUNT=1500`
            .add_source(config::Environment::with_prefix("WRENCH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
