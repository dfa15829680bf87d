use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{CheckResult, Outcome, Severity, SkipReason};

/// Policy verdict: the final pass/fail decision after exceptions and
/// severity overrides have been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub pass: bool,
    pub total_results: usize,
    /// FAIL results at or above the threshold.
    pub failing_results: usize,
    pub error_results: usize,
    pub highest_severity: Option<Severity>,
    pub fail_threshold: Severity,
}

/// Configured override forcing matching results to SKIP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRule {
    pub id: String,
    #[serde(default)]
    pub reason: String,
    /// Account glob.
    #[serde(default = "match_any")]
    pub account: String,
    /// Region glob; `global` matches global-scope results. Absent matches
    /// every region.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(flatten)]
    pub target: ExceptionTarget,
    /// RFC 3339 string, TOML datetime or bare `YYYY-MM-DD` (midnight UTC).
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionTarget {
    /// A single check id.
    Rule(String),
    /// Every check of a service.
    Service(String),
}

impl ExceptionRule {
    pub fn matches(&self, result: &CheckResult, now: DateTime<Utc>) -> bool {
        if self.expires_at.is_some_and(|expiry| expiry <= now) {
            return false;
        }
        if !glob_matches(&self.account, &result.account) {
            return false;
        }
        if let Some(region) = &self.region {
            if !glob_matches(region, result.region_key()) {
                return false;
            }
        }
        match &self.target {
            ExceptionTarget::Rule(rule_id) => rule_id == &result.rule_id,
            ExceptionTarget::Service(service) => service == &result.service,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpiry {
    Text(String),
    Toml(toml::value::Datetime),
}

fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<RawExpiry>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let text = match raw {
        RawExpiry::Text(text) => text,
        RawExpiry::Toml(datetime) => datetime.to_string(),
    };
    parse_expiry(&text).map(Some).ok_or_else(|| {
        serde::de::Error::custom(format!(
            "invalid expires_at '{text}': expected an RFC 3339 date-time or YYYY-MM-DD"
        ))
    })
}

fn parse_expiry(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.with_timezone(&Utc));
    }
    let midnight = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}

fn match_any() -> String {
    "*".into()
}

/// Shell-style glob match; a malformed pattern falls back to exact
/// comparison.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => pattern == value,
    }
}

/// Exception rules plus the severity mapping, loaded once per scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPolicy {
    /// Minimum severity of a FAIL that fails the scan.
    #[serde(default = "default_fail_on")]
    pub fail_on: Severity,
    /// Matched in declaration order; the first match wins.
    #[serde(default)]
    pub exceptions: Vec<ExceptionRule>,
    /// Per-check severity overrides.
    #[serde(default)]
    pub overrides: HashMap<String, Severity>,
}

fn default_fail_on() -> Severity {
    Severity::Low
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self {
            fail_on: default_fail_on(),
            exceptions: Vec::new(),
            overrides: HashMap::new(),
        }
    }
}

impl ExceptionPolicy {
    pub fn apply(&self, result: CheckResult) -> CheckResult {
        self.apply_at(result, Utc::now())
    }

    /// Apply severity overrides, then the first matching, unexpired exception.
    ///
    /// Only PASS/FAIL/ERROR results are downgraded; a result that is already
    /// SKIP keeps its original reason.
    pub fn apply_at(&self, mut result: CheckResult, now: DateTime<Utc>) -> CheckResult {
        if let Some(&severity) = self.overrides.get(&result.rule_id) {
            result.severity = severity;
        }
        if result.outcome == Outcome::Skip {
            return result;
        }
        if let Some(rule) = self.exceptions.iter().find(|r| r.matches(&result, now)) {
            tracing::debug!(
                exception = %rule.id,
                rule_id = %result.rule_id,
                account = %result.account,
                "exception matched, skipping result"
            );
            result.downgrade_to_skip(SkipReason::Exception {
                rule_id: rule.id.clone(),
                reason: rule.reason.clone(),
            });
        }
        result
    }

    /// Evaluate final results against this policy and produce a verdict.
    pub fn evaluate<'r>(&self, results: impl IntoIterator<Item = &'r CheckResult>) -> PolicyVerdict {
        let mut total_results = 0;
        let mut failing_results = 0;
        let mut error_results = 0;
        let mut highest: Option<Severity> = None;

        for result in results {
            total_results += 1;
            match result.outcome {
                Outcome::Fail => {
                    highest = highest.max(Some(result.severity));
                    if result.severity >= self.fail_on {
                        failing_results += 1;
                    }
                }
                Outcome::Error => error_results += 1,
                Outcome::Pass | Outcome::Skip => {}
            }
        }

        PolicyVerdict {
            pass: failing_results == 0 && error_results == 0,
            total_results,
            failing_results,
            error_results,
            highest_severity: highest,
            fail_threshold: self.fail_on,
        }
    }
}
