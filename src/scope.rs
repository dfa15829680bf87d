//! Expansion of a scan request into concrete (account, region, service)
//! work units.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapter::ProviderAdapter;
use crate::error::{Result, ScanError};
use crate::rules::policy::glob_matches;
use crate::rules::{CheckResult, Outcome, RuleCatalog, RuleSetLoader};

/// Partition key used for global-scope services.
pub const GLOBAL_REGION: &str = "global";

/// Whether a service is scanned once per account or once per region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceScope {
    Global,
    #[default]
    Regional,
}

/// Atomic work item, handled by one leaf task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanUnit {
    pub account: String,
    /// `None` for global services.
    pub region: Option<String>,
    pub service: String,
    pub scope: ServiceScope,
}

impl ScanUnit {
    pub fn region_key(&self) -> &str {
        self.region.as_deref().unwrap_or(GLOBAL_REGION)
    }
}

impl std::fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.region_key(), self.service)
    }
}

/// Selection for one dimension (accounts, regions or services).
///
/// Precedence: `only` > `include` > everything known minus `exclude`.
/// `exclude` entries may be globs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub only: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Selector {
    pub fn only(value: impl Into<String>) -> Self {
        Self {
            only: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn include<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: values.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn exclude<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: values.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Apply the selector. `known` is only consulted when nothing explicit
    /// was requested.
    pub fn select(&self, known: impl FnOnce() -> Vec<String>) -> Vec<String> {
        if let Some(only) = &self.only {
            return vec![only.clone()];
        }
        if !self.include.is_empty() {
            return dedup(self.include.clone());
        }
        dedup(
            known()
                .into_iter()
                .filter(|v| !self.exclude.iter().any(|pattern| glob_matches(pattern, v)))
                .collect(),
        )
    }
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Post-scan resource filter.
#[derive(Debug, Clone)]
pub enum ResourceFilter {
    Id(String),
    Glob(glob::Pattern),
    ResourceType(String),
}

impl ResourceFilter {
    /// `type:<name>` filters by resource type, a value with glob
    /// metacharacters is a glob, anything else an exact id.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(kind) = s.strip_prefix("type:") {
            return Ok(Self::ResourceType(kind.to_string()));
        }
        if s.contains(['*', '?', '[']) {
            return glob::Pattern::new(s)
                .map(Self::Glob)
                .map_err(|e| ScanError::Config(format!("invalid resource glob '{s}': {e}")));
        }
        Ok(Self::Id(s.to_string()))
    }

    /// ERROR results always pass so failures never disappear from a report.
    pub fn matches(&self, result: &CheckResult) -> bool {
        if result.outcome == Outcome::Error {
            return true;
        }
        match self {
            Self::ResourceType(kind) => result
                .resource_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(kind)),
            Self::Id(id) => result.resource_id.as_deref() == Some(id.as_str()),
            Self::Glob(pattern) => result
                .resource_id
                .as_deref()
                .is_some_and(|id| pattern.matches(id)),
        }
    }

    pub fn retain(&self, results: Vec<CheckResult>) -> Vec<CheckResult> {
        results.into_iter().filter(|r| self.matches(r)).collect()
    }
}

/// What the caller asked to scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub accounts: Selector,
    pub regions: Selector,
    pub services: Selector,
    pub resource_filter: Option<ResourceFilter>,
}

/// Concrete scan lists.
#[derive(Debug, Clone, Default)]
pub struct ResolvedScope {
    pub accounts: Vec<String>,
    /// Regions per account.
    pub regions: BTreeMap<String, Vec<String>>,
    pub services: Vec<String>,
    pub resource_filter: Option<ResourceFilter>,
}

impl ResolvedScope {
    /// Expand one account into scan units. Global services run once per
    /// account no matter how many regions are selected; a service whose rule
    /// set failed to load gets one unit so its error is reported once.
    pub fn units(&self, account: &str, catalog: &RuleCatalog) -> Vec<ScanUnit> {
        let regions = self.regions.get(account).map(Vec::as_slice).unwrap_or_default();
        let mut units = Vec::new();
        for service in &self.services {
            let scope = match catalog.get(service) {
                Some(Ok(rule_set)) => rule_set.scope,
                _ => ServiceScope::Global,
            };
            match scope {
                ServiceScope::Global => units.push(ScanUnit {
                    account: account.to_string(),
                    region: None,
                    service: service.clone(),
                    scope,
                }),
                ServiceScope::Regional => {
                    if regions.is_empty() {
                        tracing::warn!(account = %account, service = %service, "no regions resolved, regional service not scanned");
                    }
                    units.extend(regions.iter().map(|region| ScanUnit {
                        account: account.to_string(),
                        region: Some(region.clone()),
                        service: service.clone(),
                        scope,
                    }));
                }
            }
        }
        units
    }
}

/// Resolve a request against what the provider and loader know about.
///
/// Never fails: when enumeration is unavailable the currently authenticated
/// account/region is used instead.
pub fn resolve(
    request: &ScanRequest,
    adapter: &dyn ProviderAdapter,
    loader: &dyn RuleSetLoader,
) -> ResolvedScope {
    let accounts = request.accounts.select(|| known_accounts(adapter));

    let regions = accounts
        .iter()
        .map(|account| {
            let regions = request.regions.select(|| known_regions(adapter, account));
            (account.clone(), regions)
        })
        .collect();

    let services = request.services.select(|| loader.services());

    tracing::info!(
        accounts = accounts.len(),
        services = services.len(),
        "resolved scan scope"
    );

    ResolvedScope {
        accounts,
        regions,
        services,
        resource_filter: request.resource_filter.clone(),
    }
}

fn known_accounts(adapter: &dyn ProviderAdapter) -> Vec<String> {
    match adapter.accounts() {
        Ok(accounts) if !accounts.is_empty() => return accounts,
        Ok(_) => tracing::warn!("account enumeration returned nothing, using current account"),
        Err(e) => tracing::warn!(error = %e, "account enumeration unavailable, using current account"),
    }
    match adapter.current_account() {
        Ok(account) => vec![account],
        Err(e) => {
            let err = ScanError::ScopeResolution(format!("no account could be determined: {e}"));
            tracing::error!(error = %err, "scan scope is empty");
            Vec::new()
        }
    }
}

fn known_regions(adapter: &dyn ProviderAdapter, account: &str) -> Vec<String> {
    match adapter.regions(account) {
        Ok(regions) if !regions.is_empty() => return regions,
        Ok(_) => tracing::warn!(account = %account, "region enumeration returned nothing, using current region"),
        Err(e) => tracing::warn!(account = %account, error = %e, "region enumeration unavailable, using current region"),
    }
    adapter.current_region().into_iter().collect()
}
