//! Configuration loading and validation.
//!
//! The proxy runs from a typed snapshot parsed once at load; unknown
//! top-level keys are rejected rather than silently ignored. Snapshots
//! are re-applied atomically on reload: sessions to changed pools are
//! recreated, unchanged pools are left intact, and an invalid snapshot
//! leaves the previous one running.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::events::EventKind;

/// Configuration errors surfaced at snapshot-apply time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("weights may not both be zero")]
    ZeroWeights,

    #[error("blend_short must be within 0..=1, got {0}")]
    BlendOutOfRange(f64),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("stratum.extranonce2_size must be within 1..=8, got {0}")]
    BadExtranonce2Size(usize),

    #[error("pool {0} host is empty")]
    EmptyHost(&'static str),
}

/// Upstream pool flavour.
///
/// `ck-type` pools require `mining.extranonce.subscribe` before
/// authorize and may send difficulty ahead of the first job; the flavour
/// affects only initialization ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolFlavour {
    #[default]
    Generic,
    CkType,
}

/// One upstream pool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Wallet / username sent in `mining.authorize`.
    pub user: String,
    /// Worker tag appended as `user.worker` when non-empty.
    #[serde(default)]
    pub worker: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    #[serde(default)]
    pub flavour: PoolFlavour,
    #[serde(default)]
    pub extranonce_subscribe: bool,
    /// Lower clamp on the difficulty advertised downstream for this
    /// pool's jobs. Zero disables.
    #[serde(default)]
    pub diff_min: f64,
    /// Upper clamp; zero disables.
    #[serde(default)]
    pub diff_max: f64,
}

fn default_pass() -> String {
    "x".to_string()
}

/// Scheduling weights, relative (need not sum to 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Weights {
    pub a: u32,
    pub b: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self { a: 50, b: 50 }
    }
}

/// Scheduler mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Fixed,
    Autobalance,
}

/// Auto-balance smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoBalanceConfig {
    #[serde(default = "default_autobalance_period")]
    pub period_seconds: u64,
    #[serde(default = "default_short_halflife")]
    pub short_halflife_seconds: u64,
    #[serde(default = "default_long_halflife")]
    pub long_halflife_seconds: u64,
    /// Weight of the short-term EMA in the blend, 0..=1.
    #[serde(default = "default_blend_short")]
    pub blend_short: f64,
}

fn default_autobalance_period() -> u64 {
    300
}
fn default_short_halflife() -> u64 {
    1800
}
fn default_long_halflife() -> u64 {
    86_400
}
fn default_blend_short() -> f64 {
    0.6
}

impl Default for AutoBalanceConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_autobalance_period(),
            short_halflife_seconds: default_short_halflife(),
            long_halflife_seconds: default_long_halflife(),
            blend_short: default_blend_short(),
        }
    }
}

/// Event subset to emit; empty means all.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub events: Vec<EventKind>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "0.0.0.0:9210".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind: default_metrics_bind(),
        }
    }
}

/// Downstream listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StratumConfig {
    #[serde(default = "default_stratum_bind")]
    pub bind: String,
    /// extranonce2 size advertised to miners.
    #[serde(default = "default_extranonce2_size")]
    pub extranonce2_size: usize,
    /// Worker names accepted by `mining.authorize`; empty allows all.
    #[serde(default)]
    pub allowed_workers: Vec<String>,
}

fn default_stratum_bind() -> String {
    "0.0.0.0:3351".to_string()
}
fn default_extranonce2_size() -> usize {
    4
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            bind: default_stratum_bind(),
            extranonce2_size: default_extranonce2_size(),
            allowed_workers: Vec::new(),
        }
    }
}

/// Status API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

fn default_api_bind() -> String {
    "127.0.0.1:8855".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

/// Full configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pool_a: PoolEntry,
    pub pool_b: PoolEntry,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub mode: ScheduleMode,
    #[serde(default = "default_slot_seconds")]
    pub slot_seconds: u64,
    #[serde(default = "default_dwell_floor")]
    pub dwell_floor_seconds: u64,
    #[serde(default = "default_stale_grace")]
    pub stale_grace_seconds: u64,
    #[serde(default)]
    pub autobalance: AutoBalanceConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub stratum: StratumConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

fn default_slot_seconds() -> u64 {
    60
}
fn default_dwell_floor() -> u64 {
    30
}
fn default_stale_grace() -> u64 {
    20
}

impl Config {
    /// Load and validate a snapshot from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject snapshots that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weights.a == 0 && self.weights.b == 0 {
            return Err(ConfigError::ZeroWeights);
        }
        if !(0.0..=1.0).contains(&self.autobalance.blend_short) {
            return Err(ConfigError::BlendOutOfRange(self.autobalance.blend_short));
        }
        if self.slot_seconds == 0 {
            return Err(ConfigError::ZeroDuration("slot_seconds"));
        }
        if self.autobalance.period_seconds == 0 {
            return Err(ConfigError::ZeroDuration("autobalance.period_seconds"));
        }
        if self.autobalance.short_halflife_seconds == 0 {
            return Err(ConfigError::ZeroDuration("autobalance.short_halflife_seconds"));
        }
        if self.autobalance.long_halflife_seconds == 0 {
            return Err(ConfigError::ZeroDuration("autobalance.long_halflife_seconds"));
        }
        if !(1..=8).contains(&self.stratum.extranonce2_size) {
            return Err(ConfigError::BadExtranonce2Size(self.stratum.extranonce2_size));
        }
        if self.pool_a.host.is_empty() {
            return Err(ConfigError::EmptyHost("a"));
        }
        if self.pool_b.host.is_empty() {
            return Err(ConfigError::EmptyHost("b"));
        }
        Ok(())
    }
}
