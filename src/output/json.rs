use crate::error::Result;
use crate::rules::policy::PolicyVerdict;
use crate::rules::CheckResult;

use super::bundle::{Counts, ReportBundle, ScanMetadata};

use serde::Serialize;

#[derive(Serialize)]
struct JsonReport<'a> {
    metadata: &'a ScanMetadata,
    summary: Counts,
    verdict: &'a PolicyVerdict,
    results: Vec<&'a CheckResult>,
}

/// Render the bundle as a single JSON report with flat results.
pub fn render(bundle: &ReportBundle, verdict: &PolicyVerdict) -> Result<String> {
    let report = JsonReport {
        metadata: &bundle.metadata,
        summary: bundle.summary(),
        verdict,
        results: bundle.results().collect(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    Ok(json)
}
