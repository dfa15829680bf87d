//! Scan orchestration: accounts on a bounded outer pool, each account's
//! scan units on a bounded inner pool.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adapter::{Client, ProviderAdapter};
use crate::engine::{CheckExecutor, DiscoveryExecutor};
use crate::error::{Result, ScanError};
use crate::output::bundle::{ReportBundle, ScanMetadata};
use crate::retry::Retrier;
use crate::rules::policy::ExceptionPolicy;
use crate::rules::{CheckResult, RuleCatalog};
use crate::scope::{ResolvedScope, ScanUnit};

pub use pool::{run_bounded, CancelToken};

/// Pool widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    /// Accounts scanned at once.
    pub accounts: usize,
    /// Scan units running at once within one account.
    pub units: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            accounts: 3,
            units: 10,
        }
    }
}

/// Region key → client, or the reason none could be built.
type ClientMap = HashMap<Option<String>, std::result::Result<Arc<dyn Client>, String>>;

pub struct Orchestrator<'a> {
    adapter: &'a dyn ProviderAdapter,
    catalog: &'a RuleCatalog,
    policy: &'a ExceptionPolicy,
    retrier: &'a Retrier,
    concurrency: Concurrency,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        adapter: &'a dyn ProviderAdapter,
        catalog: &'a RuleCatalog,
        policy: &'a ExceptionPolicy,
        retrier: &'a Retrier,
    ) -> Self {
        Self {
            adapter,
            catalog,
            policy,
            retrier,
            concurrency: Concurrency::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Scan every account of `scope` and assemble the bundle.
    ///
    /// Always returns a bundle: unit failures become ERROR results and a
    /// cancelled scan returns whatever finished.
    pub fn scan(&self, scope: &ResolvedScope) -> ReportBundle {
        let metadata = ScanMetadata::start(self.adapter.provider(), self.adapter.current_account().ok());
        tracing::info!(
            scan_id = %metadata.scan_id,
            accounts = scope.accounts.len(),
            account_concurrency = self.concurrency.accounts,
            unit_concurrency = self.concurrency.units,
            "scan started"
        );

        let mut bundle = ReportBundle::new(metadata);
        let per_account = run_bounded(
            self.concurrency.accounts,
            scope.accounts.clone(),
            &self.cancel,
            |account| self.scan_account(scope, &account),
        );
        for results in per_account {
            bundle.extend(results);
        }
        bundle.finalize();

        if self.cancel.is_cancelled() {
            tracing::warn!(scan_id = %bundle.metadata.scan_id, "scan cancelled, bundle is partial");
        }
        let summary = bundle.summary();
        tracing::info!(
            scan_id = %bundle.metadata.scan_id,
            pass = summary.pass,
            fail = summary.fail,
            error = summary.error,
            skip = summary.skip,
            "scan finished"
        );
        bundle
    }

    fn scan_account(&self, scope: &ResolvedScope, account: &str) -> Vec<CheckResult> {
        let units = scope.units(account, self.catalog);
        tracing::info!(account = %account, units = units.len(), "scanning account");

        let clients = self.build_clients(account, &units);
        let run = |unit: &ScanUnit| {
            if self.cancel.is_cancelled() {
                return Vec::new();
            }
            self.run_unit(scope, unit, &clients)
        };

        let width = self.concurrency.units.max(1);
        let results: Vec<Vec<CheckResult>> = match rayon::ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(|i| format!("scan-unit-{i}"))
            .build()
        {
            Ok(pool) => pool.install(|| units.par_iter().map(run).collect()),
            Err(e) => {
                tracing::warn!(account = %account, error = %e, "unit pool unavailable, running units sequentially");
                units.iter().map(run).collect()
            }
        };

        tracing::debug!(account = %account, "account complete");
        results.into_iter().flatten().collect()
    }

    /// One client per (account, region-or-global), built before any unit runs.
    fn build_clients(&self, account: &str, units: &[ScanUnit]) -> ClientMap {
        let mut clients = ClientMap::new();
        for unit in units {
            clients.entry(unit.region.clone()).or_insert_with(|| {
                self.adapter
                    .client(account, unit.region.as_deref())
                    .map_err(|e| {
                        tracing::warn!(account = %account, region = %unit.region_key(), error = %e, "client creation failed");
                        e.to_string()
                    })
            });
        }
        clients
    }

    /// Leaf task. Never fails: any error becomes one ERROR result for the unit.
    fn run_unit(&self, scope: &ResolvedScope, unit: &ScanUnit, clients: &ClientMap) -> Vec<CheckResult> {
        let results = match self.evaluate_unit(unit, clients) {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(unit = %unit, error = %e, "scan unit failed");
                vec![CheckResult::unit_error(unit, &e)]
            }
        };

        let results = match &scope.resource_filter {
            Some(filter) => filter.retain(results),
            None => results,
        };

        tracing::debug!(unit = %unit, results = results.len(), "scan unit complete");
        results.into_iter().map(|r| self.policy.apply(r)).collect()
    }

    fn evaluate_unit(&self, unit: &ScanUnit, clients: &ClientMap) -> Result<Vec<CheckResult>> {
        let rule_set = match self.catalog.get(&unit.service) {
            Some(Ok(rule_set)) => Arc::clone(rule_set),
            Some(Err(message)) => {
                return Err(ScanError::RuleSet {
                    service: unit.service.clone(),
                    message: message.clone(),
                })
            }
            None => {
                return Err(ScanError::RuleSet {
                    service: unit.service.clone(),
                    message: "rule set was not loaded".into(),
                })
            }
        };

        let client = match clients.get(&unit.region) {
            Some(Ok(client)) => Arc::clone(client),
            Some(Err(message)) => {
                return Err(ScanError::Client {
                    account: unit.account.clone(),
                    message: message.clone(),
                })
            }
            None => {
                return Err(ScanError::Internal(format!("no client slot for {unit}")));
            }
        };

        let inventory = DiscoveryExecutor::new(client.as_ref(), self.retrier).run(&rule_set)?;
        Ok(CheckExecutor::new(unit)
            .with_adapter(self.adapter)
            .run(&rule_set, &inventory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RegistryClient;
    use crate::retry::{RetryConfig, Sleeper};
    use crate::rules::policy::{ExceptionRule, ExceptionTarget};
    use crate::rules::{InMemoryLoader, Outcome, RuleSet, SkipReason};
    use crate::scope::{self, ResourceFilter, ScanRequest, Selector};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _delay: Duration) {}
    }

    /// Three accounts with two regions each. Every call is recorded with the
    /// account it was made for. Region `broken` has no client.
    struct RecordingAdapter {
        calls: Arc<Mutex<Vec<String>>>,
        regions: Vec<String>,
    }

    impl RecordingAdapter {
        fn new(regions: &[&str]) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                regions: regions.iter().map(|r| r.to_string()).collect(),
            }
        }
    }

    impl ProviderAdapter for RecordingAdapter {
        fn provider(&self) -> &str {
            "test"
        }

        fn client(&self, account: &str, region: Option<&str>) -> Result<Arc<dyn Client>> {
            if region == Some("broken") {
                return Err(ScanError::Client {
                    account: account.into(),
                    message: "credentials expired".into(),
                });
            }
            let calls = self.calls.clone();
            let account = account.to_string();
            let client = RegistryClient::new().with("list_volumes", move |_| {
                calls.lock().unwrap().push(account.clone());
                std::thread::sleep(Duration::from_millis(1));
                Ok(json!({"Volumes": [{"Id": "v1", "Encrypted": true}, {"Id": "v2", "Encrypted": false}]}))
            });
            Ok(Arc::new(client))
        }

        fn accounts(&self) -> Result<Vec<String>> {
            Ok(vec!["a".into(), "b".into(), "c".into()])
        }

        fn regions(&self, _account: &str) -> Result<Vec<String>> {
            Ok(self.regions.clone())
        }

        fn current_account(&self) -> Result<String> {
            Ok("a".into())
        }

        fn current_region(&self) -> Option<String> {
            None
        }
    }

    const VOLUMES: &str = r#"
service: volumes
discovery:
  - id: volumes
    calls:
      - action: list_volumes
        save_as: resp
    emit:
      items_for: resp.Volumes[]
      item:
        id: "{{ item.Id }}"
        encrypted: "{{ item.Encrypted }}"
checks:
  - id: volume_encrypted
    severity: high
    for_each: volumes
    conditions:
      var: item.encrypted
      op: is_true
"#;

    const SNAPSHOTS: &str = r#"
service: snapshots
scope: global
discovery:
  - id: snapshots
    calls:
      - action: list_volumes
        save_as: resp
    emit:
      items_for: resp.Volumes[]
checks:
  - id: snapshot_listed
    for_each: snapshots
    conditions:
      var: item.Id
      op: exists
"#;

    fn loader() -> InMemoryLoader {
        InMemoryLoader::new()
            .with(RuleSet::from_yaml_str(VOLUMES).unwrap())
            .with(RuleSet::from_yaml_str(SNAPSHOTS).unwrap())
    }

    fn retrier() -> Retrier {
        Retrier::with_sleeper(RetryConfig::default(), Arc::new(NoSleep))
    }

    fn run(
        adapter: &RecordingAdapter,
        request: &ScanRequest,
        policy: &ExceptionPolicy,
        concurrency: Concurrency,
    ) -> ReportBundle {
        let loader = loader();
        let scope = scope::resolve(request, adapter, &loader);
        let catalog = RuleCatalog::load(&loader, &scope.services);
        let retrier = retrier();
        Orchestrator::new(adapter, &catalog, policy, &retrier)
            .with_concurrency(concurrency)
            .scan(&scope)
    }

    #[test]
    fn scans_every_unit() {
        let adapter = RecordingAdapter::new(&["r1", "r2"]);
        let bundle = run(&adapter, &ScanRequest::default(), &ExceptionPolicy::default(), Concurrency::default());

        // 3 accounts × (2 regional units + 1 global unit)
        assert_eq!(adapter.calls.lock().unwrap().len(), 9);
        let summary = bundle.summary();
        // per account: one PASS and one FAIL per regional unit, two PASS globally
        assert_eq!(summary.pass, 3 * (2 + 2));
        assert_eq!(summary.fail, 3 * 2);
        assert!(bundle.accounts()["b"]["global"].contains_key("snapshots"));
        assert_eq!(bundle.metadata.identity.as_deref(), Some("a"));
    }

    #[test]
    fn single_account_width_is_strictly_sequential() {
        let adapter = RecordingAdapter::new(&["r1", "r2", "r3"]);
        let concurrency = Concurrency { accounts: 1, units: 4 };
        run(&adapter, &ScanRequest::default(), &ExceptionPolicy::default(), concurrency);

        let calls = adapter.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 12);
        let mut sorted = calls.clone();
        sorted.sort();
        assert_eq!(calls, sorted, "an account started before the previous one finished");
    }

    #[test]
    fn failing_unit_does_not_affect_siblings() {
        let adapter = RecordingAdapter::new(&["r1", "broken"]);
        let request = ScanRequest {
            accounts: Selector::only("a"),
            ..Default::default()
        };
        let bundle = run(&adapter, &request, &ExceptionPolicy::default(), Concurrency::default());

        let broken = &bundle.accounts()["a"]["broken"]["volumes"];
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].outcome, Outcome::Error);
        assert_eq!(broken[0].rule_id, "volumes.unavailable");
        assert!(broken[0].error.as_deref().unwrap().contains("credentials expired"));

        let healthy = &bundle.accounts()["a"]["r1"]["volumes"];
        assert_eq!(healthy.len(), 2);
    }

    #[test]
    fn missing_rule_set_reports_once_per_account() {
        let adapter = RecordingAdapter::new(&["r1", "r2"]);
        let request = ScanRequest {
            accounts: Selector::only("a"),
            services: Selector::include(["volumes", "ghost"]),
            ..Default::default()
        };
        let bundle = run(&adapter, &request, &ExceptionPolicy::default(), Concurrency::default());

        let ghost: Vec<_> = bundle.results().filter(|r| r.service == "ghost").collect();
        assert_eq!(ghost.len(), 1);
        assert_eq!(ghost[0].outcome, Outcome::Error);
        assert!(ghost[0].region.is_none());
        assert_eq!(bundle.results().filter(|r| r.service == "volumes").count(), 4);
    }

    #[test]
    fn filter_and_exceptions_apply_per_unit() {
        let adapter = RecordingAdapter::new(&["r1"]);
        let request = ScanRequest {
            accounts: Selector::only("a"),
            services: Selector::only("volumes"),
            resource_filter: Some(ResourceFilter::parse("v2").unwrap()),
            ..Default::default()
        };
        let policy = ExceptionPolicy {
            exceptions: vec![ExceptionRule {
                id: "accepted-risk".into(),
                reason: "legacy volume".into(),
                account: "*".into(),
                region: Some("r1".into()),
                target: ExceptionTarget::Rule("volume_encrypted".into()),
                expires_at: None,
            }],
            ..Default::default()
        };
        let bundle = run(&adapter, &request, &policy, Concurrency::default());

        let results: Vec<_> = bundle.results().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_id.as_deref(), Some("v2"));
        assert_eq!(results[0].outcome, Outcome::Skip);
        assert!(matches!(results[0].skip, Some(SkipReason::Exception { .. })));
        assert_eq!(results[0].severity, crate::rules::Severity::High);
    }

    #[test]
    fn cancelled_scan_still_returns_a_bundle() {
        let adapter = RecordingAdapter::new(&["r1"]);
        let loader = loader();
        let scope = scope::resolve(&ScanRequest::default(), &adapter, &loader);
        let catalog = RuleCatalog::load(&loader, &scope.services);
        let retrier = retrier();
        let policy = ExceptionPolicy::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let bundle = Orchestrator::new(&adapter, &catalog, &policy, &retrier)
            .with_cancel_token(cancel)
            .scan(&scope);
        assert!(bundle.is_empty());
        assert!(adapter.calls.lock().unwrap().is_empty());
    }
}
