use crate::rules::policy::PolicyVerdict;
use crate::rules::{CheckResult, Outcome, Severity};

use super::bundle::ReportBundle;

/// Render FAIL and ERROR results as console output, grouped by severity then
/// account and region, followed by the outcome summary and verdict.
pub fn render(bundle: &ReportBundle, verdict: &PolicyVerdict) -> String {
    let mut output = String::new();
    let summary = bundle.summary();

    if summary.total == 0 {
        output.push_str("\n  No checks were evaluated.\n\n");
        return output;
    }

    let mut flagged: Vec<&CheckResult> = bundle
        .results()
        .filter(|r| matches!(r.outcome, Outcome::Fail | Outcome::Error))
        .collect();
    flagged.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.account.cmp(&b.account))
            .then_with(|| a.region_key().cmp(b.region_key()))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    if flagged.is_empty() {
        output.push_str("\n  No failing checks.\n\n");
    } else {
        output.push_str(&format!("\n  {} result(s) need attention:\n\n", flagged.len()));
    }

    for result in &flagged {
        let severity_tag = match result.severity {
            Severity::Critical => "[CRITICAL]",
            Severity::High => "[HIGH]    ",
            Severity::Medium => "[MEDIUM]  ",
            Severity::Low => "[LOW]     ",
            Severity::Info => "[INFO]    ",
        };

        output.push_str(&format!(
            "  {} {} {} {}\n",
            severity_tag, result.outcome, result.rule_id, result.title
        ));
        output.push_str(&format!(
            "           at {}/{}/{} {}\n",
            result.account,
            result.region_key(),
            result.service,
            result.resource_id.as_deref().unwrap_or("-"),
        ));
        if let Some(error) = &result.error {
            output.push_str(&format!("           error: {}\n", error));
        }
        if let Some(remediation) = &result.remediation {
            output.push_str(&format!("           fix: {}\n", remediation));
        }
        output.push('\n');
    }

    output.push_str(&format!(
        "  Checks: {} passed, {} failed, {} errored, {} skipped ({} total)\n",
        summary.pass, summary.fail, summary.error, summary.skip, summary.total
    ));

    let status = if verdict.pass { "PASS" } else { "FAIL" };
    output.push_str(&format!(
        "  Result: {} (threshold: {}, highest: {})\n\n",
        status,
        verdict.fail_threshold,
        verdict
            .highest_severity
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".into()),
    ));

    output
}
