use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scope::ScanUnit;

/// One evaluated check instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check identifier from the rule set (e.g., "s3_bucket_encrypted").
    pub rule_id: String,
    /// Human-readable check title.
    pub title: String,
    /// Service whose rule set produced this result.
    pub service: String,
    pub severity: Severity,
    pub outcome: Outcome,
    pub account: String,
    /// `None` for global-scope services.
    pub region: Option<String>,
    /// Provider-formatted resource identifier (absent for resource-less checks).
    pub resource_id: Option<String>,
    /// Discovery id the item came from, or the item's own `resource_type`.
    pub resource_type: Option<String>,
    /// Stable opaque join key, see [`crate::output::bundle::synthesize`].
    pub finding_id: String,
    pub remediation: Option<String>,
    #[serde(default)]
    pub compliance: Vec<String>,
    /// Error text for ERROR outcomes.
    pub error: Option<String>,
    /// Why the outcome is SKIP. Set if and only if `outcome == Skip`.
    pub skip: Option<SkipReason>,
    /// Every field of the inventory item the check ran against.
    #[serde(default)]
    pub evidence: Map<String, Value>,
}

impl CheckResult {
    /// Single ERROR pseudo-result standing in for a whole scan unit that
    /// could not be evaluated.
    pub fn unit_error(unit: &ScanUnit, error: impl std::fmt::Display) -> Self {
        let rule_id = format!("{}.unavailable", unit.service);
        Self {
            finding_id: crate::output::bundle::synthesize(&[
                unit.account.as_str(),
                unit.region_key(),
                unit.service.as_str(),
                rule_id.as_str(),
            ]),
            title: format!("{} scan could not complete", unit.service),
            rule_id,
            service: unit.service.clone(),
            severity: Severity::High,
            outcome: Outcome::Error,
            account: unit.account.clone(),
            region: unit.region.clone(),
            resource_id: None,
            resource_type: None,
            remediation: None,
            compliance: Vec::new(),
            error: Some(error.to_string()),
            skip: None,
            evidence: Map::new(),
        }
    }

    pub fn region_key(&self) -> &str {
        self.region.as_deref().unwrap_or(crate::scope::GLOBAL_REGION)
    }

    /// Force the outcome to SKIP. Everything except outcome and skip
    /// metadata is left alone.
    pub fn downgrade_to_skip(&mut self, reason: SkipReason) {
        self.outcome = Outcome::Skip;
        self.skip = Some(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Skip,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Error => write!(f, "ERROR"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Exactly one reason per skipped result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A configured exception rule matched.
    Exception { rule_id: String, reason: String },
    /// The discovery the check iterates produced no items.
    NoResources { discovery: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" | "informational" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" | "med" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Metadata about a loaded check, used for `list-rules` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMetadata {
    pub id: String,
    pub service: String,
    pub title: String,
    pub severity: Severity,
    pub resource_type: Option<String>,
    pub compliance: Vec<String>,
}
