//! Runtime configuration
//!
//! Built in three layers: defaults, an optional JSON file, then environment
//! variables. The result is validated before use.

use crate::error::{Result, VauError};
use crate::hsm::{HsmBackend, PoolConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_HSM_BACKEND: &str = "ERP_HSM_BACKEND";
pub const ENV_HSM_MAX_SESSION_COUNT: &str = "ERP_HSM_MAX_SESSION_COUNT";
pub const ENV_HSM_IDLE_TIMEOUT_SECONDS: &str = "ERP_HSM_IDLE_TIMEOUT_SECONDS";
pub const ENV_HSM_ACQUIRE_TIMEOUT_SECONDS: &str = "ERP_HSM_ACQUIRE_TIMEOUT_SECONDS";
pub const ENV_HSM_DEVICE: &str = "ERP_HSM_DEVICE";
pub const ENV_TEE_TOKEN_UPDATE_SECONDS: &str = "ERP_TEE_TOKEN_UPDATE_SECONDS";
pub const ENV_TEE_TOKEN_RETRY_SECONDS: &str = "ERP_TEE_TOKEN_RETRY_SECONDS";
pub const ENV_PROOF_VALIDITY_SECONDS: &str = "ERP_PROOF_VALIDITY_SECONDS";

/// Upper bound for every timeout and interval setting: one day
pub const MAX_DURATION_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmSettings {
    pub backend: HsmBackend,
    pub max_session_count: usize,
    pub idle_timeout_seconds: u64,
    /// 0 waits forever
    pub acquire_timeout_seconds: u64,
    pub device: String,
}

impl Default for HsmSettings {
    fn default() -> Self {
        Self {
            backend: HsmBackend::Simulated,
            max_session_count: 5,
            idle_timeout_seconds: 900,
            acquire_timeout_seconds: 0,
            device: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeeTokenSettings {
    pub update_seconds: u64,
    pub retry_seconds: u64,
}

impl Default for TeeTokenSettings {
    fn default() -> Self {
        Self {
            update_seconds: 1200,
            retry_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsdmSettings {
    pub proof_validity_seconds: u64,
}

impl Default for VsdmSettings {
    fn default() -> Self {
        Self {
            proof_validity_seconds: 1800,
        }
    }
}

/// Complete configuration of the VAU core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VauConfig {
    pub hsm: HsmSettings,
    pub tee_token: TeeTokenSettings,
    pub vsdm: VsdmSettings,
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VauError::Config(format!("{} has invalid value '{}'", name, value)))
}

impl VauConfig {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VauError::Config(format!("can't read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| VauError::Config(format!("invalid config JSON: {}", e)))
    }

    /// Override fields from variables found by `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_HSM_BACKEND) {
            self.hsm.backend = v.parse()?;
        }
        if let Some(v) = lookup(ENV_HSM_MAX_SESSION_COUNT) {
            self.hsm.max_session_count = parse_env(ENV_HSM_MAX_SESSION_COUNT, &v)?;
        }
        if let Some(v) = lookup(ENV_HSM_IDLE_TIMEOUT_SECONDS) {
            self.hsm.idle_timeout_seconds = parse_env(ENV_HSM_IDLE_TIMEOUT_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_HSM_ACQUIRE_TIMEOUT_SECONDS) {
            self.hsm.acquire_timeout_seconds = parse_env(ENV_HSM_ACQUIRE_TIMEOUT_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_HSM_DEVICE) {
            self.hsm.device = v;
        }
        if let Some(v) = lookup(ENV_TEE_TOKEN_UPDATE_SECONDS) {
            self.tee_token.update_seconds = parse_env(ENV_TEE_TOKEN_UPDATE_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_TEE_TOKEN_RETRY_SECONDS) {
            self.tee_token.retry_seconds = parse_env(ENV_TEE_TOKEN_RETRY_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_PROOF_VALIDITY_SECONDS) {
            self.vsdm.proof_validity_seconds = parse_env(ENV_PROOF_VALIDITY_SECONDS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hsm.max_session_count < 1 {
            return Err(VauError::Config("hsm.max_session_count must be at least 1".into()));
        }
        if self.hsm.idle_timeout_seconds < 4 {
            return Err(VauError::Config("hsm.idle_timeout_seconds must be at least 4".into()));
        }
        if self.tee_token.update_seconds == 0 {
            return Err(VauError::Config("tee_token.update_seconds must be positive".into()));
        }
        if self.tee_token.retry_seconds == 0 {
            return Err(VauError::Config("tee_token.retry_seconds must be positive".into()));
        }
        for (name, seconds) in [
            ("hsm.idle_timeout_seconds", self.hsm.idle_timeout_seconds),
            ("hsm.acquire_timeout_seconds", self.hsm.acquire_timeout_seconds),
            ("tee_token.update_seconds", self.tee_token.update_seconds),
            ("tee_token.retry_seconds", self.tee_token.retry_seconds),
            ("vsdm.proof_validity_seconds", self.vsdm.proof_validity_seconds),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(VauError::Config(format!(
                    "{} must not exceed {} seconds, got {}",
                    name, MAX_DURATION_SECONDS, seconds
                )));
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_session_count: self.hsm.max_session_count,
            idle_timeout: Duration::from_secs(self.hsm.idle_timeout_seconds),
            acquire_timeout: match self.hsm.acquire_timeout_seconds {
                0 => None,
                seconds => Some(Duration::from_secs(seconds)),
            },
            token_update_interval: Duration::from_secs(self.tee_token.update_seconds),
            token_retry_interval: Duration::from_secs(self.tee_token.retry_seconds),
        }
    }

    pub fn proof_validity(&self) -> Duration {
        Duration::from_secs(self.vsdm.proof_validity_seconds)
    }

    /// One line per setting, for the startup log
    pub fn summary(&self) -> String {
        let device = if self.hsm.device.is_empty() {
            "<none>"
        } else {
            self.hsm.device.as_str()
        };
        format!(
            "hsm.backend = {:?}\n\
             hsm.max_session_count = {}\n\
             hsm.idle_timeout_seconds = {}\n\
             hsm.acquire_timeout_seconds = {}\n\
             hsm.device = {}\n\
             tee_token.update_seconds = {}\n\
             tee_token.retry_seconds = {}\n\
             vsdm.proof_validity_seconds = {}",
            self.hsm.backend,
            self.hsm.max_session_count,
            self.hsm.idle_timeout_seconds,
            self.hsm.acquire_timeout_seconds,
            device,
            self.tee_token.update_seconds,
            self.tee_token.retry_seconds,
            self.vsdm.proof_validity_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VauConfig::default();
        assert_eq!(config.hsm.max_session_count, 5);
        assert_eq!(config.hsm.idle_timeout_seconds, 900);
        assert_eq!(config.tee_token.update_seconds, 1200);
        assert_eq!(config.tee_token.retry_seconds, 60);
        assert_eq!(config.vsdm.proof_validity_seconds, 1800);
        assert!(config.validate().is_ok());
        assert!(config.pool_config().acquire_timeout.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = VauConfig::from_json(r#"{"hsm": {"max_session_count": 12}}"#).unwrap();
        assert_eq!(config.hsm.max_session_count, 12);
        assert_eq!(config.hsm.idle_timeout_seconds, 900);
        assert_eq!(config.tee_token, TeeTokenSettings::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = VauConfig::from_json(r#"{"tee_token": {"update_seconds": 10}}"#).unwrap();
        config
            .apply_env(env(&[
                (ENV_TEE_TOKEN_UPDATE_SECONDS, "30"),
                (ENV_HSM_ACQUIRE_TIMEOUT_SECONDS, "5"),
                (ENV_HSM_BACKEND, "direct"),
                (ENV_HSM_DEVICE, "3001@hsm"),
            ]))
            .unwrap();
        assert_eq!(config.tee_token.update_seconds, 30);
        assert_eq!(config.hsm.backend, HsmBackend::Direct);
        assert_eq!(config.hsm.device, "3001@hsm");
        assert_eq!(config.pool_config().acquire_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut config = VauConfig::default();
        let err = config
            .apply_env(env(&[(ENV_HSM_MAX_SESSION_COUNT, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_HSM_MAX_SESSION_COUNT));
    }

    #[test]
    fn test_validation() {
        let mut config = VauConfig::default();
        config.hsm.max_session_count = 0;
        assert!(config.validate().is_err());

        let mut config = VauConfig::default();
        config.hsm.idle_timeout_seconds = 3;
        assert!(config.validate().is_err());

        let mut config = VauConfig::default();
        config.tee_token.retry_seconds = 0;
        assert!(matches!(config.validate().unwrap_err(), VauError::Config(_)));
    }

    #[test]
    fn test_durations_are_bounded() {
        let mut config = VauConfig::default();
        config
            .apply_env(env(&[(ENV_HSM_ACQUIRE_TIMEOUT_SECONDS, "18446744073709551615")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VauError::Config(_)));
        assert!(err.to_string().contains("hsm.acquire_timeout_seconds"));

        let mut config = VauConfig::default();
        config.tee_token.update_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = VauConfig::default();
        config.hsm.idle_timeout_seconds = MAX_DURATION_SECONDS + 1;
        assert!(config.validate().is_err());

        let mut config = VauConfig::default();
        config.hsm.idle_timeout_seconds = MAX_DURATION_SECONDS;
        config.tee_token.update_seconds = MAX_DURATION_SECONDS;
        config.vsdm.proof_validity_seconds = MAX_DURATION_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_summary_lists_every_setting() {
        let summary = VauConfig::default().summary();
        assert_eq!(summary.lines().count(), 8);
        assert!(summary.contains("hsm.device = <none>"));
    }
}
