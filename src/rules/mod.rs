//! Rule set definitions: discovery steps, checks and the exception policy.
//!
//! A rule set is a declarative document for one cloud service. It is parsed
//! into the types below once, frozen behind an `Arc`, and shared read-only
//! by every scan unit of that service.

pub mod condition;
pub mod finding;
pub mod loader;
pub mod policy;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::scope::ServiceScope;

pub use condition::{Condition, Operator};
pub use finding::{CheckResult, Outcome, RuleMetadata, Severity, SkipReason};
pub use loader::{DirectoryLoader, InMemoryLoader, RuleCatalog, RuleSetLoader};

/// Immutable per-service definition.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    /// Service name. Defaults to the document's file name when omitted.
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub scope: ServiceScope,
    #[serde(default)]
    pub discovery: Vec<DiscoveryStep>,
    #[serde(default)]
    pub checks: Vec<CheckDef>,
}

impl RuleSet {
    pub fn from_yaml_str(content: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Metadata for every check, for `list-rules`.
    pub fn rule_metadata(&self) -> Vec<RuleMetadata> {
        self.checks
            .iter()
            .map(|check| RuleMetadata {
                id: check.id.clone(),
                service: self.service.clone(),
                title: check.display_title().to_string(),
                severity: check.severity,
                resource_type: check.for_each.clone(),
                compliance: check.compliance.clone(),
            })
            .collect()
    }
}

/// One named discovery phase.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryStep {
    pub id: String,
    /// Executed strictly in declaration order.
    #[serde(default)]
    pub calls: Vec<CallDef>,
    #[serde(default)]
    pub emit: Option<EmitSpec>,
}

/// Where an action is dispatched: client namespace plus optional
/// product/API version qualifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallTarget {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One external action invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct CallDef {
    #[serde(flatten)]
    pub target: CallTarget,
    pub action: String,
    /// Parameter templates, resolved per invocation.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Key (itself a template) the response is stored under.
    #[serde(default)]
    pub save_as: Option<String>,
    /// List expression to iterate; one invocation per element.
    #[serde(default)]
    pub for_each: Option<String>,
    #[serde(default = "default_loop_var", rename = "as")]
    pub loop_var: String,
    #[serde(default)]
    pub on_error: OnError,
}

impl CallDef {
    /// `client.action`, used in logs and errors.
    pub fn qualified_action(&self) -> String {
        if self.target.client.is_empty() {
            self.action.clone()
        } else {
            format!("{}.{}", self.target.client, self.action)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
}

/// How a discovery step turns saved responses into inventory items.
#[derive(Debug, Clone, Deserialize)]
pub struct EmitSpec {
    /// List expression; when absent `item` is evaluated once.
    #[serde(default)]
    pub items_for: Option<String>,
    #[serde(default = "default_loop_var", rename = "as")]
    pub item_var: String,
    /// Field name → template.
    #[serde(default)]
    pub item: Map<String, Value>,
}

/// One declarative check.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckDef {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    /// Discovery id whose items this check iterates.
    #[serde(default)]
    pub for_each: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(alias = "condition")]
    pub conditions: Condition,
    #[serde(default)]
    pub remediation: Option<String>,
    /// Compliance framework references (e.g., "CIS-2.1.1").
    #[serde(default)]
    pub compliance: Vec<String>,
}

impl CheckDef {
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

fn default_loop_var() -> String {
    "item".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const S3_RULES: &str = r#"
service: s3
scope: global
discovery:
  - id: buckets
    calls:
      - client: s3
        action: list_buckets
        save_as: listing
      - client: s3
        action: get_bucket_encryption
        for_each: listing.Buckets[]
        as: bucket
        params:
          Bucket: "{{ bucket.Name }}"
        save_as: "enc_{{ bucket.Name }}"
        on_error: continue
    emit:
      items_for: listing.Buckets[]
      as: bucket
      item:
        id: "{{ bucket.Name }}"
checks:
  - id: s3_bucket_encrypted
    title: S3 buckets are encrypted
    severity: high
    for_each: buckets
    conditions:
      var: item.id
      op: exists
"#;

    #[test]
    fn parses_rule_set_document() {
        let rules = RuleSet::from_yaml_str(S3_RULES).unwrap();
        assert_eq!(rules.service, "s3");
        assert_eq!(rules.scope, ServiceScope::Global);
        let calls = &rules.discovery[0].calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].loop_var, "item");
        assert_eq!(calls[0].on_error, OnError::Fail);
        assert_eq!(calls[1].loop_var, "bucket");
        assert_eq!(calls[1].on_error, OnError::Continue);
        assert_eq!(calls[1].qualified_action(), "s3.get_bucket_encryption");
        let emit = rules.discovery[0].emit.as_ref().unwrap();
        assert_eq!(emit.item_var, "bucket");
        assert_eq!(rules.checks[0].severity, Severity::High);
    }

    #[test]
    fn metadata_lists_every_check() {
        let rules = RuleSet::from_yaml_str(S3_RULES).unwrap();
        let meta = rules.rule_metadata();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].service, "s3");
        assert_eq!(meta[0].resource_type.as_deref(), Some("buckets"));
    }
}
