use serde::Deserialize;
use std::collections::HashMap;
use wrench_shared::Pence;

/// Tunables for checkout reconciliation
#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationSettings {
    #[serde(default = "default_double_submit_window")]
    pub double_submit_window_secs: i64,
    #[serde(default = "default_inflight_ttl")]
    pub inflight_ttl_secs: u64,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_settlement_grace")]
    pub settlement_grace_secs: i64,
    /// Appointment time used when a trigger carries none, `HH:MM`
    #[serde(default = "default_time")]
    pub default_time: String,
}

fn default_double_submit_window() -> i64 { 30 }
fn default_inflight_ttl() -> u64 { 30 }
fn default_max_write_attempts() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 50 }
fn default_settlement_grace() -> i64 { 60 }
fn default_time() -> String { "09:00".to_string() }

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            double_submit_window_secs: default_double_submit_window(),
            inflight_ttl_secs: default_inflight_ttl(),
            max_write_attempts: default_max_write_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            settlement_grace_secs: default_settlement_grace(),
            default_time: default_time(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReferralSettings {
    #[serde(default = "default_bonus")]
    pub bonus_amount: Pence,
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
}

fn default_bonus() -> Pence { 1000 }
fn default_code_prefix() -> String { "WR".to_string() }
fn default_code_length() -> usize { 6 }
fn default_max_code_attempts() -> u32 { 5 }

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            bonus_amount: default_bonus(),
            code_prefix: default_code_prefix(),
            code_length: default_code_length(),
            max_code_attempts: default_max_code_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceSettings {
    #[serde(default = "default_look_ahead")]
    pub look_ahead_days: i64,
    #[serde(default = "default_look_behind")]
    pub look_behind_days: i64,
    #[serde(default = "default_interval")]
    pub default_interval_days: i64,
    /// Service label → interval in days. Keys are normalized on load.
    #[serde(default)]
    pub intervals: HashMap<String, i64>,
}

fn default_look_ahead() -> i64 { 30 }
fn default_look_behind() -> i64 { 7 }
fn default_interval() -> i64 { 180 }

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            look_ahead_days: default_look_ahead(),
            look_behind_days: default_look_behind(),
            default_interval_days: default_interval(),
            intervals: HashMap::new(),
        }
    }
}
