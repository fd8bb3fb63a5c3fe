//! Configuration loading and validation for the codec service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is present but invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::keys::KeyPolicy;

/// Validated codec service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// KMS alias of the master key, resolved to an ARN once at startup.
    pub master_key_alias: String,
    /// How long (seconds) a data key stays current before rotation.
    pub data_key_rotation_interval_secs: u64,
    /// How long (seconds) an unwrapped historical data key stays cached.
    pub decryption_cache_ttl_secs: u64,
    /// How often (seconds) expired cache entries are swept.
    pub cache_sweep_interval_secs: u64,
    /// Remaining lifetime (seconds) below which the low-expiry warning fires.
    pub low_expiry_warning_threshold_secs: u64,
    /// How often (seconds) the current key's expiry is checked.
    pub expiry_check_interval_secs: u64,
    /// Delay (seconds) before a failed scheduled rotation is retried.
    pub rotation_retry_interval_secs: u64,
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Override for the KMS endpoint, e.g. a local emulator.
    pub kms_endpoint_url: Option<String>,
    /// OTLP endpoint for span export. Logs only when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,
    /// Tracing log level (e.g. `"info"`, `"debug"`).
    pub log_level: String,
}

/// Environment as read, before legacy names are folded in.
///
/// `KMS_KEY_ALIAS`, `KMS_CACHE_TTL` and `DATA_KEY_ROTATION_INTERVAL` are the
/// legacy names. They are honoured only when the current name is unset, so
/// both may be present during a migration.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    master_key_alias: Option<String>,
    #[serde(default)]
    kms_key_alias: Option<String>,

    #[serde(default)]
    data_key_rotation_interval_secs: Option<u64>,
    #[serde(default)]
    data_key_rotation_interval: Option<u64>,

    #[serde(default)]
    decryption_cache_ttl_secs: Option<u64>,
    #[serde(default)]
    kms_cache_ttl: Option<u64>,

    #[serde(default = "default_sweep_interval")]
    cache_sweep_interval_secs: u64,
    #[serde(default = "default_low_expiry_threshold")]
    low_expiry_warning_threshold_secs: u64,
    #[serde(default = "default_expiry_check_interval")]
    expiry_check_interval_secs: u64,
    #[serde(default = "default_rotation_retry_interval")]
    rotation_retry_interval_secs: u64,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    kms_endpoint_url: Option<String>,
    #[serde(default)]
    otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Self {
            master_key_alias: raw
                .master_key_alias
                .or(raw.kms_key_alias)
                .unwrap_or_else(default_master_key_alias),
            data_key_rotation_interval_secs: raw
                .data_key_rotation_interval_secs
                .or(raw.data_key_rotation_interval)
                .unwrap_or_else(default_rotation_interval),
            decryption_cache_ttl_secs: raw
                .decryption_cache_ttl_secs
                .or(raw.kms_cache_ttl)
                .unwrap_or_else(default_cache_ttl),
            cache_sweep_interval_secs: raw.cache_sweep_interval_secs,
            low_expiry_warning_threshold_secs: raw.low_expiry_warning_threshold_secs,
            expiry_check_interval_secs: raw.expiry_check_interval_secs,
            rotation_retry_interval_secs: raw.rotation_retry_interval_secs,
            port: raw.port,
            kms_endpoint_url: raw.kms_endpoint_url,
            otel_exporter_otlp_endpoint: raw.otel_exporter_otlp_endpoint,
            log_level: raw.log_level,
        }
    }
}

fn default_master_key_alias() -> String {
    "alias/temporal-codec-latest".into()
}
fn default_rotation_interval() -> u64 {
    3600
}
fn default_cache_ttl() -> u64 {
    86_400
}
fn default_sweep_interval() -> u64 {
    900
}
fn default_low_expiry_threshold() -> u64 {
    300
}
fn default_expiry_check_interval() -> u64 {
    60
}
fn default_rotation_retry_interval() -> u64 {
    30
}
fn default_port() -> u16 {
    8081
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let raw: RawConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;
        let c = Config::from(raw);

        c.validate()?;
        Ok(c)
    }

    /// Timing policy handed to the key manager.
    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            rotation_interval: Duration::from_secs(self.data_key_rotation_interval_secs),
            decryption_cache_ttl: Duration::from_secs(self.decryption_cache_ttl_secs),
            cache_sweep_interval: Duration::from_secs(self.cache_sweep_interval_secs),
            expiry_check_interval: Duration::from_secs(self.expiry_check_interval_secs),
            low_expiry_warning_threshold: Duration::from_secs(
                self.low_expiry_warning_threshold_secs,
            ),
            rotation_retry_interval: Duration::from_secs(self.rotation_retry_interval_secs),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.master_key_alias.trim().is_empty() {
            anyhow::bail!("MASTER_KEY_ALIAS must not be empty");
        }
        ensure_positive(self.data_key_rotation_interval_secs, "DATA_KEY_ROTATION_INTERVAL_SECS")?;
        ensure_positive(self.decryption_cache_ttl_secs, "DECRYPTION_CACHE_TTL_SECS")?;
        ensure_positive(self.cache_sweep_interval_secs, "CACHE_SWEEP_INTERVAL_SECS")?;
        ensure_positive(self.expiry_check_interval_secs, "EXPIRY_CHECK_INTERVAL_SECS")?;
        ensure_positive(self.rotation_retry_interval_secs, "ROTATION_RETRY_INTERVAL_SECS")?;

        if self.low_expiry_warning_threshold_secs >= self.data_key_rotation_interval_secs {
            anyhow::bail!(
                "LOW_EXPIRY_WARNING_THRESHOLD_SECS ({}) must be smaller than DATA_KEY_ROTATION_INTERVAL_SECS ({})",
                self.low_expiry_warning_threshold_secs,
                self.data_key_rotation_interval_secs
            );
        }
        Ok(())
    }
}

fn ensure_positive(value: u64, name: &str) -> Result<()> {
    if value == 0 {
        anyhow::bail!("{name} must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            master_key_alias: default_master_key_alias(),
            data_key_rotation_interval_secs: default_rotation_interval(),
            decryption_cache_ttl_secs: default_cache_ttl(),
            cache_sweep_interval_secs: default_sweep_interval(),
            low_expiry_warning_threshold_secs: default_low_expiry_threshold(),
            expiry_check_interval_secs: default_expiry_check_interval(),
            rotation_retry_interval_secs: default_rotation_retry_interval(),
            port: default_port(),
            kms_endpoint_url: None,
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_master_key_alias(), "alias/temporal-codec-latest");
        assert_eq!(default_rotation_interval(), 3600);
        assert_eq!(default_cache_ttl(), 86_400);
        assert_eq!(default_sweep_interval(), 900);
        assert_eq!(default_low_expiry_threshold(), 300);
        assert_eq!(default_expiry_check_interval(), 60);
        assert_eq!(default_port(), 8081);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn default_config_is_valid_and_matches_default_policy() {
        let cfg = valid();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.key_policy(), KeyPolicy::default());
    }

    #[test]
    fn validate_rejects_empty_alias() {
        let cfg = Config {
            master_key_alias: "  ".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rotation_interval() {
        let cfg = Config {
            data_key_rotation_interval_secs: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_threshold_not_below_rotation() {
        let cfg = Config {
            data_key_rotation_interval_secs: 300,
            low_expiry_warning_threshold_secs: 300,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    fn from_json(value: serde_json::Value) -> Config {
        Config::from(serde_json::from_value::<RawConfig>(value).unwrap())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = from_json(serde_json::json!({}));
        assert_eq!(cfg.master_key_alias, "alias/temporal-codec-latest");
        assert_eq!(cfg.key_policy(), KeyPolicy::default());
        assert_eq!(cfg.port, 8081);
    }

    #[test]
    fn legacy_variable_names_are_accepted() {
        let cfg = from_json(serde_json::json!({
            "kms_key_alias": "alias/other",
            "kms_cache_ttl": 60,
            "data_key_rotation_interval": 1800
        }));
        assert_eq!(cfg.master_key_alias, "alias/other");
        assert_eq!(cfg.decryption_cache_ttl_secs, 60);
        assert_eq!(cfg.data_key_rotation_interval_secs, 1800);
        assert_eq!(cfg.port, 8081);
    }

    #[test]
    fn current_names_win_when_legacy_names_are_also_set() {
        let cfg = from_json(serde_json::json!({
            "master_key_alias": "alias/new",
            "kms_key_alias": "alias/old",
            "decryption_cache_ttl_secs": 120,
            "kms_cache_ttl": 60,
            "data_key_rotation_interval_secs": 7200,
            "data_key_rotation_interval": 1800
        }));
        assert_eq!(cfg.master_key_alias, "alias/new");
        assert_eq!(cfg.decryption_cache_ttl_secs, 120);
        assert_eq!(cfg.data_key_rotation_interval_secs, 7200);
        assert!(cfg.validate().is_ok());
    }
}
