//! cloudposture: cloud security posture scanner.
//!
//! Rule sets describe, per cloud service, which API calls discover
//! resources and which conditions those resources must satisfy. The engine
//! interprets them across accounts and regions through a provider adapter
//! and assembles the results into a partitioned report bundle.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use cloudposture::adapter::FixtureAdapter;
//! use cloudposture::{scan, ScanOptions};
//!
//! let adapter = FixtureAdapter::load(Path::new("provider.json")).unwrap();
//! let options = ScanOptions::new("rules");
//! let report = scan(&adapter, &options).unwrap();
//! println!("Pass: {}, Results: {}", report.verdict.pass, report.bundle.summary().total);
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod retry;
pub mod rules;
pub mod scope;
pub mod template;

use std::path::{Path, PathBuf};

use adapter::ProviderAdapter;
use config::Config;
use error::Result;
use orchestrator::{CancelToken, Orchestrator};
use output::bundle::ReportBundle;
use output::OutputFormat;
use retry::Retrier;
use rules::policy::PolicyVerdict;
use rules::{CheckResult, DirectoryLoader, RuleCatalog, RuleMetadata, RuleSetLoader};
use scope::ScanRequest;

/// Options for a scan invocation.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Rule set directory. Falls back to `scan.rules_dir` from the config.
    pub rules_dir: Option<PathBuf>,
    /// Path to config file (defaults to `.cloudposture.toml` in the working
    /// directory).
    pub config_path: Option<PathBuf>,
    /// Which accounts, regions, services and resources to scan.
    pub request: ScanRequest,
    /// CLI override for fail_on threshold.
    pub fail_on_override: Option<rules::Severity>,
    pub account_concurrency: Option<usize>,
    pub unit_concurrency: Option<usize>,
    /// Write the bundle here. Overrides `scan.output_dir`.
    pub output_dir: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl ScanOptions {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: Some(rules_dir.into()),
            ..Default::default()
        }
    }
}

/// Complete scan report.
#[derive(Debug)]
pub struct ScanReport {
    pub bundle: ReportBundle,
    pub verdict: PolicyVerdict,
}

impl ScanReport {
    pub fn results(&self) -> impl Iterator<Item = &CheckResult> {
        self.bundle.results()
    }
}

/// Run a complete scan: load config and rule sets, resolve scope, scan
/// every unit, persist the bundle and evaluate the policy verdict.
pub fn scan(adapter: &dyn ProviderAdapter, options: &ScanOptions) -> Result<ScanReport> {
    let config_path = options
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE));
    let mut config = Config::load(&config_path)?;

    if let Some(fail_on) = options.fail_on_override {
        config.policy.fail_on = fail_on;
    }
    if let Some(width) = options.account_concurrency {
        config.scan.account_concurrency = width.max(1);
    }
    if let Some(width) = options.unit_concurrency {
        config.scan.unit_concurrency = width.max(1);
    }

    let rules_dir = resolve_rules_dir(options.rules_dir.as_deref(), &config)?;
    let loader = DirectoryLoader::new(&rules_dir)?;
    let scope = scope::resolve(&options.request, adapter, &loader);
    let catalog = RuleCatalog::load(&loader, &scope.services);
    let retrier = Retrier::new(config.retry.clone());

    let bundle = Orchestrator::new(adapter, &catalog, &config.policy, &retrier)
        .with_concurrency(config.scan.concurrency())
        .with_cancel_token(options.cancel.clone())
        .scan(&scope);

    if let Some(dir) = options.output_dir.as_ref().or(config.scan.output_dir.as_ref()) {
        bundle.write(dir)?;
    }

    let verdict = config.policy.evaluate(bundle.results());

    Ok(ScanReport { bundle, verdict })
}

/// Metadata for every check in the rule set directory, sorted by service
/// then check id. Rule sets that fail to parse are skipped with a warning.
pub fn list_rules(rules_dir: &Path) -> Result<Vec<RuleMetadata>> {
    let loader = DirectoryLoader::new(rules_dir)?;
    let mut rules = Vec::new();
    for service in loader.services() {
        match loader.load(&service) {
            Ok(rule_set) => rules.extend(rule_set.rule_metadata()),
            Err(e) => tracing::warn!(service = %service, error = %e, "skipping unreadable rule set"),
        }
    }
    rules.sort_by(|a, b| a.service.cmp(&b.service).then_with(|| a.id.cmp(&b.id)));
    Ok(rules)
}

/// Render a scan report in the specified format.
pub fn render_report(report: &ScanReport, format: OutputFormat) -> Result<String> {
    output::render(&report.bundle, &report.verdict, format)
}

fn resolve_rules_dir(explicit: Option<&Path>, config: &Config) -> Result<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| config.scan.rules_dir.clone())
        .ok_or_else(|| error::ScanError::Config("no rules directory given (--rules or scan.rules_dir)".into()))
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use adapter::FixtureAdapter;
    use pretty_assertions::assert_eq;
    use rules::{Outcome, SkipReason};
    use scope::{ResourceFilter, Selector};

    const RULES: &str = "tests/fixtures/rules";
    const PROVIDER: &str = "tests/fixtures/provider.json";
    const CONFIG: &str = "tests/fixtures/cloudposture.toml";

    fn options() -> ScanOptions {
        ScanOptions {
            config_path: Some(CONFIG.into()),
            ..ScanOptions::new(RULES)
        }
    }

    fn fixture_scan(options: &ScanOptions) -> ScanReport {
        let adapter = FixtureAdapter::load(Path::new(PROVIDER)).unwrap();
        scan(&adapter, options).unwrap()
    }

    fn find<'a>(report: &'a ScanReport, rule_id: &str, resource: &str) -> &'a CheckResult {
        report
            .results()
            .find(|r| r.rule_id == rule_id && r.resource_id.as_deref().is_some_and(|id| id.ends_with(resource)))
            .unwrap_or_else(|| panic!("no result for {rule_id} on {resource}"))
    }

    #[test]
    fn encrypted_and_unencrypted_buckets() {
        let report = fixture_scan(&options());
        let logs = find(&report, "s3_bucket_encrypted", "logs-bucket");
        assert_eq!(logs.outcome, Outcome::Pass);
        assert_eq!(logs.region, None);
        let media = find(&report, "s3_bucket_encrypted", "media-bucket");
        assert_eq!(media.outcome, Outcome::Fail);
        assert_eq!(media.resource_id.as_deref(), Some("arn:fixture:s3::111111111111:media-bucket"));
        assert!(!report.verdict.pass);
    }

    #[test]
    fn failed_lookup_with_continue_keeps_going() {
        // get_bucket_policy_status errors for media-bucket only
        let report = fixture_scan(&options());
        let public = find(&report, "s3_bucket_not_public", "logs-bucket");
        assert_eq!(public.outcome, Outcome::Pass);
        assert!(report
            .results()
            .all(|r| !(r.rule_id == "s3_bucket_not_public" && r.resource_id.as_deref().is_some_and(|id| id.ends_with("media-bucket")))));

        let versioning = find(&report, "s3_bucket_versioning", "media-bucket");
        assert_eq!(versioning.outcome, Outcome::Pass);
        assert_eq!(versioning.severity, rules::Severity::Low);
    }

    #[test]
    fn regional_service_runs_per_region() {
        let report = fixture_scan(&options());
        let volumes: Vec<_> = report.results().filter(|r| r.service == "ec2").collect();
        let regions: std::collections::BTreeSet<_> = volumes.iter().map(|r| r.region_key()).collect();
        assert_eq!(regions.into_iter().collect::<Vec<_>>(), vec!["eu-west-1", "us-east-1"]);

        let empty_region = volumes
            .iter()
            .find(|r| r.region.as_deref() == Some("eu-west-1"))
            .unwrap();
        assert_eq!(empty_region.outcome, Outcome::Skip);
        assert_eq!(
            empty_region.skip,
            Some(SkipReason::NoResources {
                discovery: "volumes".into()
            })
        );
    }

    #[test]
    fn configured_exception_skips_result() {
        let report = fixture_scan(&options());
        let root_mfa = report
            .results()
            .find(|r| r.rule_id == "iam_root_mfa_enabled" && r.account == "222222222222")
            .unwrap();
        assert_eq!(root_mfa.outcome, Outcome::Skip);
        assert!(matches!(
            &root_mfa.skip,
            Some(SkipReason::Exception { rule_id, .. }) if rule_id == "sandbox-root-mfa"
        ));
        assert_eq!(root_mfa.severity, rules::Severity::Critical);
    }

    #[test]
    fn broken_rule_set_is_one_error() {
        let report = fixture_scan(&options());
        let broken: Vec<_> = report.results().filter(|r| r.service == "broken").collect();
        assert_eq!(broken.len(), 2);
        assert!(broken.iter().all(|r| r.outcome == Outcome::Error && r.region.is_none()));
    }

    #[test]
    fn selectors_and_resource_filter() {
        let mut opts = options();
        opts.request.accounts = Selector::only("111111111111");
        opts.request.services = Selector::exclude(["broken", "ec2"]);
        opts.request.resource_filter = Some(ResourceFilter::parse("*media*").unwrap());
        let report = fixture_scan(&opts);

        assert!(report.results().all(|r| r.account == "111111111111"));
        let ids: Vec<_> = report
            .results()
            .map(|r| (r.rule_id.as_str(), r.outcome))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("s3_bucket_encrypted", Outcome::Fail),
                ("s3_bucket_versioning", Outcome::Pass),
            ]
        );
    }

    #[test]
    fn bundle_is_written_and_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.output_dir = Some(dir.path().to_path_buf());
        let report = fixture_scan(&opts);

        assert!(dir.path().join("index.json").is_file());
        assert!(dir.path().join("111111111111/global/s3.json").is_file());
        assert!(dir.path().join("111111111111/us-east-1/results.json").is_file());

        let json = render_report(&report, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed["summary"]["total"].as_u64(),
            Some(report.bundle.summary().total as u64)
        );

        let sarif = render_report(&report, OutputFormat::Sarif).unwrap();
        assert!(sarif.contains("s3_bucket_encrypted"));
        let console = render_report(&report, OutputFormat::Console).unwrap();
        assert!(console.contains("Result: FAIL"));
    }

    #[test]
    fn cancelled_scan_still_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.output_dir = Some(dir.path().to_path_buf());
        opts.cancel.cancel();
        let report = fixture_scan(&opts);

        assert!(report.bundle.is_empty());
        assert!(report.verdict.pass);
        assert!(dir.path().join("index.json").is_file());
    }

    #[test]
    fn lists_rules_from_directory() {
        let rules = list_rules(Path::new(RULES)).unwrap();
        assert!(rules.iter().any(|r| r.id == "s3_bucket_encrypted" && r.service == "s3"));
        assert!(rules.iter().all(|r| r.service != "broken"));
    }

    #[test]
    fn missing_rules_dir_is_fatal() {
        let adapter = FixtureAdapter::from_json_str("{}").unwrap();
        let opts = ScanOptions {
            rules_dir: Some("tests/fixtures/does-not-exist".into()),
            config_path: Some(CONFIG.into()),
            ..Default::default()
        };
        let err = scan(&adapter, &opts).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
