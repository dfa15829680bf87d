use std::collections::BTreeMap;

use crate::error::Result;
use crate::rules::{CheckResult, Outcome, Severity};

use super::bundle::ReportBundle;

use serde_json::{json, Value};

/// Render FAIL and ERROR results as SARIF 2.1.0.
///
/// Cloud resources have no source location, so each result carries a
/// logical location (`account/region/service` plus the resource id) and the
/// finding id as its partial fingerprint.
pub fn render(bundle: &ReportBundle) -> Result<String> {
    let flagged: Vec<&CheckResult> = bundle
        .results()
        .filter(|r| matches!(r.outcome, Outcome::Fail | Outcome::Error))
        .collect();

    let mut by_rule: BTreeMap<&str, &CheckResult> = BTreeMap::new();
    for result in flagged.iter().copied() {
        by_rule.entry(result.rule_id.as_str()).or_insert(result);
    }

    let rules: Vec<Value> = by_rule
        .values()
        .map(|r| {
            let mut rule = json!({
                "id": r.rule_id,
                "name": r.title,
                "shortDescription": { "text": r.title },
                "defaultConfiguration": {
                    "level": severity_to_sarif_level(r.severity),
                },
            });
            if !r.compliance.is_empty() {
                rule["properties"] = json!({
                    "tags": r.compliance,
                });
            }
            if let Some(remediation) = &r.remediation {
                rule["help"] = json!({ "text": remediation });
            }
            rule
        })
        .collect();

    let results: Vec<Value> = flagged
        .iter()
        .map(|r| {
            let message = match (&r.outcome, &r.error) {
                (Outcome::Error, Some(error)) => format!("{}: {}", r.title, error),
                _ => r.title.clone(),
            };
            let scope = format!("{}/{}/{}", r.account, r.region_key(), r.service);
            let qualified_name = match &r.resource_id {
                Some(id) => format!("{scope}/{id}"),
                None => scope,
            };
            let level = match r.outcome {
                Outcome::Error => "error",
                _ => severity_to_sarif_level(r.severity),
            };
            let mut result = json!({
                "ruleId": r.rule_id,
                "level": level,
                "message": { "text": message },
                "partialFingerprints": { "findingId/v1": r.finding_id },
                "locations": [{
                    "logicalLocations": [{
                        "fullyQualifiedName": qualified_name,
                        "kind": "resource",
                    }],
                }],
            });

            if !r.evidence.is_empty() {
                result["properties"] = json!({ "evidence": r.evidence });
            }

            result
        })
        .collect();

    let sarif = json!({
        "$schema": "https://docs.oasis-open.org/sarif/sarif/v2.1.0/errata01/os/schemas/sarif-schema-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "cloudposture",
                    "version": env!("CARGO_PKG_VERSION"),
                    "semanticVersion": env!("CARGO_PKG_VERSION"),
                    "rules": rules,
                },
            },
            "results": results,
            "automationDetails": {
                "id": format!("cloudposture/{}/{}", bundle.metadata.provider, bundle.metadata.scan_id),
            },
        }],
    });

    let output = serde_json::to_string_pretty(&sarif)?;
    Ok(output)
}

fn severity_to_sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical | Severity::High => "error",
        Severity::Medium => "warning",
        Severity::Low | Severity::Info => "note",
    }
}
