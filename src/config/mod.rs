use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::orchestrator::Concurrency;
use crate::retry::RetryConfig;
use crate::rules::policy::ExceptionPolicy;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".cloudposture.toml";

/// Top-level configuration from `.cloudposture.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub policy: ExceptionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_account_concurrency")]
    pub account_concurrency: usize,
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,
    /// Rule set directory.
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
    /// Where the report bundle is written. Not persisted when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_account_concurrency() -> usize {
    Concurrency::default().accounts
}

fn default_unit_concurrency() -> usize {
    Concurrency::default().units
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            account_concurrency: default_account_concurrency(),
            unit_concurrency: default_unit_concurrency(),
            rules_dir: None,
            output_dir: None,
        }
    }
}

impl ScanSettings {
    pub fn concurrency(&self) -> Concurrency {
        Concurrency {
            accounts: self.account_concurrency,
            units: self.unit_concurrency,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scan.account_concurrency == 0 || self.scan.unit_concurrency == 0 {
            return Err(ScanError::Config("concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScanError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(ScanError::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Generate a starter config file.
    pub fn starter_toml() -> &'static str {
        r#"# cloudposture configuration

[scan]
# Accounts scanned concurrently.
account_concurrency = 3
# Scan units (service x region) running concurrently within one account.
unit_concurrency = 10
# rules_dir = "rules"
# output_dir = "report"

[retry]
# Total attempts per external call, including the first.
max_attempts = 5
base_delay_ms = 1000
backoff_factor = 2.0

[policy]
# Minimum severity of a FAIL that fails the scan (info, low, medium, high, critical).
fail_on = "low"

# Per-check severity overrides.
# [policy.overrides]
# "s3_bucket_versioning" = "info"

# Exceptions force matching results to SKIP. The first match wins.
# [[policy.exceptions]]
# id = "legacy-logs-bucket"
# reason = "Accepted risk, tracked in SEC-123"
# account = "1111*"
# region = "global"
# rule = "s3_bucket_encrypted"        # or: service = "s3"
# expires_at = "2027-01-01T00:00:00Z"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::policy::ExceptionTarget;
    use crate::rules::Severity;

    #[test]
    fn starter_config_parses() {
        let config: Config = toml::from_str(Config::starter_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.scan.concurrency(), Concurrency::default());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.policy.fail_on, Severity::Low);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.scan.account_concurrency, 3);
        assert!(config.policy.exceptions.is_empty());
    }

    #[test]
    fn loads_exceptions_and_rejects_zero_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[scan]
unit_concurrency = 2

[[policy.exceptions]]
id = "ex-1"
reason = "shared logging account"
service = "s3"
"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.scan.unit_concurrency, 2);
        assert_eq!(config.policy.exceptions[0].target, ExceptionTarget::Service("s3".into()));
        assert_eq!(config.policy.exceptions[0].account, "*");

        std::fs::write(&path, "[scan]\naccount_concurrency = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ScanError::Config(_))));
    }

    #[test]
    fn unquoted_exception_expiry_loads() {
        let config: Config = toml::from_str(
            "[[policy.exceptions]]\nid = \"x\"\nservice = \"s3\"\nexpires_at = 2099-01-01T00:00:00Z\n",
        )
        .unwrap();
        let expiry = config.policy.exceptions[0].expires_at.unwrap();
        assert_eq!(expiry.to_rfc3339(), "2099-01-01T00:00:00+00:00");
    }
}
