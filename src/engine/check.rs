use serde_json::{Map, Value};

use super::discovery::Inventory;
use super::context::EvaluationContext;
use crate::adapter::ProviderAdapter;
use crate::output::bundle::synthesize;
use crate::rules::{CheckDef, CheckResult, Outcome, RuleSet, SkipReason};
use crate::scope::ScanUnit;

/// Item fields tried, in order, for a resource's native id.
const ID_FIELDS: [&str; 4] = ["resource_id", "id", "arn", "name"];

/// Evaluates a rule set's checks against an inventory for one scan unit.
pub struct CheckExecutor<'a> {
    unit: &'a ScanUnit,
    adapter: Option<&'a dyn ProviderAdapter>,
}

impl<'a> CheckExecutor<'a> {
    pub fn new(unit: &'a ScanUnit) -> Self {
        Self { unit, adapter: None }
    }

    /// Format resource ids through the provider adapter.
    pub fn with_adapter(mut self, adapter: &'a dyn ProviderAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn run(&self, rule_set: &RuleSet, inventory: &Inventory) -> Vec<CheckResult> {
        rule_set
            .checks
            .iter()
            .flat_map(|check| self.run_check(check, inventory))
            .collect()
    }

    fn run_check(&self, check: &CheckDef, inventory: &Inventory) -> Vec<CheckResult> {
        let placeholder = [Value::Object(Map::new())];
        let items: &[Value] = match &check.for_each {
            None => &placeholder[..],
            Some(discovery) => match inventory.get(discovery) {
                Some(items) if !items.is_empty() => items.as_slice(),
                found => {
                    if found.is_none() {
                        tracing::warn!(check = %check.id, discovery = %discovery, "check references unknown discovery");
                    }
                    let mut result = self.base_result(check, &Value::Null);
                    result.downgrade_to_skip(SkipReason::NoResources {
                        discovery: discovery.clone(),
                    });
                    return vec![result];
                }
            },
        };

        items.iter().map(|item| self.evaluate_item(check, item)).collect()
    }

    fn evaluate_item(&self, check: &CheckDef, item: &Value) -> CheckResult {
        let mut ctx = EvaluationContext::new();
        ctx.insert("item", item.clone());
        ctx.insert("params", Value::Object(check.params.clone()));

        let mut result = self.base_result(check, item);
        match check.conditions.evaluate(ctx.as_value()) {
            Ok(true) => result.outcome = Outcome::Pass,
            Ok(false) => result.outcome = Outcome::Fail,
            Err(e) => {
                tracing::debug!(check = %check.id, resource = ?result.resource_id, error = %e, "check evaluation failed");
                result.outcome = Outcome::Error;
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Result skeleton carrying scope, metadata and evidence. The outcome is
    /// filled in by the caller.
    fn base_result(&self, check: &CheckDef, item: &Value) -> CheckResult {
        let evidence = match item {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".into(), other.clone());
                wrapped
            }
        };

        let resource_id = native_id(item).map(|id| match self.adapter {
            Some(adapter) => adapter.resource_id(self.unit, &id),
            None => id,
        });
        let resource_type = item
            .get("resource_type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| check.for_each.clone());

        CheckResult {
            finding_id: synthesize(&[
                self.unit.account.as_str(),
                self.unit.region_key(),
                self.unit.service.as_str(),
                check.id.as_str(),
                resource_id.as_deref().unwrap_or_default(),
            ]),
            rule_id: check.id.clone(),
            title: check.display_title().to_string(),
            service: self.unit.service.clone(),
            severity: check.severity,
            outcome: Outcome::Skip,
            account: self.unit.account.clone(),
            region: self.unit.region.clone(),
            resource_id,
            resource_type,
            remediation: check.remediation.clone(),
            compliance: check.compliance.clone(),
            error: None,
            skip: None,
            evidence,
        }
    }
}

fn native_id(item: &Value) -> Option<String> {
    ID_FIELDS.iter().find_map(|field| match item.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
