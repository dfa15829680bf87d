//! Assembly of check results into the partitioned report bundle.
//!
//! Results arrive in any order from the scan workers; the bundle keys them
//! by account, region and service so the assembled and written output is
//! the same no matter how the work was scheduled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ScanError};
use crate::rules::{CheckResult, Outcome};

/// Length of a synthesized id, in hex characters.
const ID_LEN: usize = 32;

/// Stable opaque identifier for a tuple of parts.
///
/// SHA-256 over the NUL-joined parts, hex encoded and truncated. The
/// separator keeps `["ab", "c"]` and `["a", "bc"]` apart.
pub fn synthesize(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(ID_LEN);
    id
}

/// Facts about the scan invocation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub scan_id: String,
    pub provider: String,
    /// Account the credentials belong to, when known.
    pub identity: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tool_version: String,
}

impl ScanMetadata {
    pub fn start(provider: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            identity,
            started_at: Utc::now(),
            finished_at: None,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Outcome tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub skip: usize,
    pub total: usize,
}

impl Counts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.pass += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Error => self.error += 1,
            Outcome::Skip => self.skip += 1,
        }
        self.total += 1;
    }

    pub fn tally<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        let mut counts = Self::default();
        for result in results {
            counts.record(result.outcome);
        }
        counts
    }
}

/// service → results
pub type ServiceResults = BTreeMap<String, Vec<CheckResult>>;

/// The hierarchical result of one scan: account → region (or `global`) →
/// service → results.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub metadata: ScanMetadata,
    accounts: BTreeMap<String, BTreeMap<String, ServiceResults>>,
}

impl ReportBundle {
    pub fn new(metadata: ScanMetadata) -> Self {
        Self {
            metadata,
            accounts: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, result: CheckResult) {
        self.accounts
            .entry(result.account.clone())
            .or_default()
            .entry(result.region_key().to_string())
            .or_default()
            .entry(result.service.clone())
            .or_default()
            .push(result);
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = CheckResult>) {
        for result in results {
            self.insert(result);
        }
    }

    /// Stamp the finish time and put every partition in a stable order.
    pub fn finalize(&mut self) {
        for regions in self.accounts.values_mut() {
            for services in regions.values_mut() {
                for results in services.values_mut() {
                    results.sort_by(|a, b| {
                        a.rule_id
                            .cmp(&b.rule_id)
                            .then_with(|| a.resource_id.cmp(&b.resource_id))
                            .then_with(|| a.finding_id.cmp(&b.finding_id))
                    });
                }
            }
        }
        self.metadata.finished_at = Some(Utc::now());
    }

    pub fn accounts(&self) -> &BTreeMap<String, BTreeMap<String, ServiceResults>> {
        &self.accounts
    }

    /// Every result, in partition order.
    pub fn results(&self) -> impl Iterator<Item = &CheckResult> {
        self.accounts
            .values()
            .flat_map(|regions| regions.values())
            .flat_map(|services| services.values())
            .flatten()
    }

    pub fn summary(&self) -> Counts {
        Counts::tally(self.results())
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Flat index of partitions with their counts.
    pub fn index(&self) -> BundleIndex {
        let mut partitions = Vec::new();
        for (account, regions) in &self.accounts {
            for (region, services) in regions {
                for (service, results) in services {
                    partitions.push(PartitionEntry {
                        account: account.clone(),
                        region: region.clone(),
                        service: service.clone(),
                        counts: Counts::tally(results),
                        path: partition_path(account, region)
                            .join(format!("{}.json", sanitize(service))),
                    });
                }
            }
        }
        BundleIndex {
            metadata: self.metadata.clone(),
            summary: self.summary(),
            partitions,
        }
    }

    /// Persist the bundle under `dir`:
    ///
    /// - `index.json`
    /// - `<account>/<region>/<service>.json` per partition
    /// - `<account>/<region>/results.json` with every service of the region
    pub fn write(&self, dir: &Path) -> Result<BundleIndex> {
        std::fs::create_dir_all(dir)?;
        let index = self.index();

        for (account, regions) in &self.accounts {
            for (region, services) in regions {
                let partition_dir = dir.join(partition_path(account, region));
                std::fs::create_dir_all(&partition_dir)?;

                for (service, results) in services {
                    write_json(&partition_dir.join(format!("{}.json", sanitize(service))), results)?;
                }

                let flat: Vec<&CheckResult> = services.values().flatten().collect();
                write_json(&partition_dir.join("results.json"), &flat)?;
            }
        }

        write_json(&dir.join("index.json"), &index)?;
        tracing::info!(
            dir = %dir.display(),
            partitions = index.partitions.len(),
            results = index.summary.total,
            "report bundle written"
        );
        Ok(index)
    }
}

/// Merge results into a fresh bundle and finalize it.
pub fn assemble(metadata: ScanMetadata, results: impl IntoIterator<Item = CheckResult>) -> ReportBundle {
    let mut bundle = ReportBundle::new(metadata);
    bundle.extend(results);
    bundle.finalize();
    bundle
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleIndex {
    pub metadata: ScanMetadata,
    pub summary: Counts,
    pub partitions: Vec<PartitionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub account: String,
    pub region: String,
    pub service: String,
    pub counts: Counts,
    /// Relative to the bundle directory.
    pub path: PathBuf,
}

fn partition_path(account: &str, region: &str) -> PathBuf {
    Path::new(&sanitize(account)).join(sanitize(region))
}

/// Make a key safe to use as a single path component.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| ScanError::Output(format!("failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Severity;
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn result(account: &str, region: Option<&str>, service: &str, rule_id: &str, outcome: Outcome) -> CheckResult {
        CheckResult {
            rule_id: rule_id.into(),
            title: rule_id.into(),
            service: service.into(),
            severity: Severity::Medium,
            outcome,
            account: account.into(),
            region: region.map(Into::into),
            resource_id: Some(format!("{service}-res")),
            resource_type: None,
            finding_id: synthesize(&[account, region.unwrap_or("global"), service, rule_id]),
            remediation: None,
            compliance: vec![],
            error: None,
            skip: None,
            evidence: Map::new(),
        }
    }

    fn sample() -> Vec<CheckResult> {
        vec![
            result("111", Some("us-east-1"), "ec2", "ec2_b", Outcome::Fail),
            result("111", None, "iam", "iam_mfa", Outcome::Pass),
            result("222", Some("eu-west-1"), "ec2", "ec2_a", Outcome::Error),
            result("111", Some("us-east-1"), "ec2", "ec2_a", Outcome::Pass),
            result("111", Some("us-east-1"), "s3", "s3_enc", Outcome::Skip),
        ]
    }

    #[test]
    fn synthesized_ids_are_stable_and_separated() {
        let id = synthesize(&["a", "bc"]);
        assert_eq!(id.len(), ID_LEN);
        assert_eq!(id, synthesize(&["a", "bc"]));
        assert_ne!(id, synthesize(&["ab", "c"]));
    }

    #[test]
    fn assembly_ignores_arrival_order() {
        let meta = ScanMetadata::start("fixture", None);
        let forward = assemble(meta.clone(), sample());
        let backward = assemble(meta, sample().into_iter().rev());
        let ids = |b: &ReportBundle| b.results().map(|r| r.finding_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&forward), ids(&backward));

        let ec2 = &forward.accounts()["111"]["us-east-1"]["ec2"];
        assert_eq!(ec2[0].rule_id, "ec2_a");
        assert!(forward.accounts()["111"].contains_key("global"));
    }

    #[test]
    fn summary_counts_outcomes() {
        let bundle = assemble(ScanMetadata::start("fixture", None), sample());
        assert_eq!(
            bundle.summary(),
            Counts {
                pass: 2,
                fail: 1,
                error: 1,
                skip: 1,
                total: 5
            }
        );
        assert!(bundle.metadata.finished_at.is_some());
    }

    #[test]
    fn writes_partitioned_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = assemble(ScanMetadata::start("fixture", Some("111".into())), sample());
        let index = bundle.write(dir.path()).unwrap();

        assert!(dir.path().join("index.json").is_file());
        assert!(dir.path().join("111/us-east-1/ec2.json").is_file());
        assert!(dir.path().join("111/global/iam.json").is_file());
        assert!(dir.path().join("222/eu-west-1/results.json").is_file());
        assert_eq!(index.partitions.len(), 4);

        let flat: Vec<CheckResult> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("111/us-east-1/results.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(flat.len(), 3);

        let written: BundleIndex =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(written.summary.total, 5);
        assert_eq!(written.metadata.identity.as_deref(), Some("111"));
    }

    #[test]
    fn sanitizes_path_components() {
        assert_eq!(sanitize("../etc"), ".._etc");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("acct/1"), "acct_1");
    }
}
