//! Service configuration.
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::certificate::{MAX_DURATION_DAYS, VALID_KEY_LENGTHS};
use crate::error::CredvaultError;

/// Longest audit retention window accepted, in days.
pub const MAX_DAYS_RETAINED: u32 = 36_500;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub audit_logs: AuditLogConfig,
    #[serde(default)]
    pub certificates: CertificateDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorizationConfig {
    /// When false, every existing credential is open to every caller.
    #[serde(default = "default_acls_enabled")]
    pub acls_enabled: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            acls_enabled: default_acls_enabled(),
        }
    }
}

fn default_acls_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditLogConfig {
    #[serde(default = "default_days_retained")]
    pub days_retained: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl AuditLogConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            days_retained: default_days_retained(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_days_retained() -> u32 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

/// Values applied when a generation request leaves them out.
#[derive(Debug, Deserialize, Clone)]
pub struct CertificateDefaults {
    #[serde(default = "default_duration_days")]
    pub default_duration_days: u32,
    #[serde(default = "default_key_length")]
    pub default_key_length: u32,
}

impl Default for CertificateDefaults {
    fn default() -> Self {
        Self {
            default_duration_days: default_duration_days(),
            default_key_length: default_key_length(),
        }
    }
}

fn default_duration_days() -> u32 {
    365
}

fn default_key_length() -> u32 {
    2048
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, CredvaultError> {
        let config: Self = toml::from_str(raw).map_err(|e| CredvaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), CredvaultError> {
        let audit = &self.audit_logs;
        if audit.cleanup_interval_secs == 0 {
            return Err(CredvaultError::Config(
                "audit_logs.cleanup_interval_secs must be greater than zero".into(),
            ));
        }
        if !(1..=MAX_DAYS_RETAINED).contains(&audit.days_retained) {
            return Err(CredvaultError::Config(format!(
                "audit_logs.days_retained must be between 1 and {MAX_DAYS_RETAINED}, got {}",
                audit.days_retained
            )));
        }

        let certificates = &self.certificates;
        if !VALID_KEY_LENGTHS.contains(&certificates.default_key_length) {
            return Err(CredvaultError::Config(format!(
                "certificates.default_key_length must be one of {VALID_KEY_LENGTHS:?}, got {}",
                certificates.default_key_length
            )));
        }
        if !(1..=MAX_DURATION_DAYS).contains(&certificates.default_duration_days) {
            return Err(CredvaultError::Config(format!(
                "certificates.default_duration_days must be between 1 and {MAX_DURATION_DAYS}, got {}",
                certificates.default_duration_days
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredvaultError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            CredvaultError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.authorization.acls_enabled);
        assert_eq!(config.audit_logs.days_retained, 30);
        assert_eq!(config.audit_logs.cleanup_interval(), Duration::from_secs(86_400));
        assert_eq!(config.certificates.default_duration_days, 365);
        assert_eq!(config.certificates.default_key_length, 2048);
    }

    #[test]
    fn test_partial_sections_override() {
        let config = Config::from_toml_str(
            r#"
            [authorization]
            acls_enabled = false

            [audit_logs]
            days_retained = 15
            "#,
        )
        .unwrap();

        assert!(!config.authorization.acls_enabled);
        assert_eq!(config.audit_logs.days_retained, 15);
        assert_eq!(config.audit_logs.cleanup_interval_secs, 86_400);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credvault.toml");
        fs::write(&path, "[certificates]\ndefault_key_length = 4096\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.certificates.default_key_length, 4096);
    }

    #[test]
    fn test_zero_cleanup_interval_is_rejected() {
        let err = Config::from_toml_str("[audit_logs]\ncleanup_interval_secs = 0\n").unwrap_err();
        match err {
            CredvaultError::Config(message) => assert!(message.contains("cleanup_interval_secs")),
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn test_retention_window_bounds() {
        for days in ["0", "4294967295", "36501"] {
            let raw = format!("[audit_logs]\ndays_retained = {days}\n");
            assert!(
                matches!(Config::from_toml_str(&raw), Err(CredvaultError::Config(_))),
                "days_retained = {days} was accepted"
            );
        }
        let config = Config::from_toml_str("[audit_logs]\ndays_retained = 36500\n").unwrap();
        assert_eq!(config.audit_logs.days_retained, MAX_DAYS_RETAINED);
    }

    #[test]
    fn test_certificate_defaults_are_validated() {
        let err = Config::from_toml_str("[certificates]\ndefault_key_length = 1024\n").unwrap_err();
        assert!(matches!(err, CredvaultError::Config(_)));
        let err = Config::from_toml_str("[certificates]\ndefault_duration_days = 0\n").unwrap_err();
        assert!(matches!(err, CredvaultError::Config(_)));
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        let err = Config::from_toml_str("[audit_logs]\ndays_retained = \"many\"").unwrap_err();
        assert!(matches!(err, CredvaultError::Config(_)));
    }
}
