use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::RuleSet;
use crate::error::{Result, ScanError};

/// Source of rule sets, keyed by service name.
pub trait RuleSetLoader: Send + Sync {
    /// Every service this loader knows about.
    fn services(&self) -> Vec<String>;

    /// Load and parse one service's rule set.
    fn load(&self, service: &str) -> Result<RuleSet>;
}

/// Loads rule sets from a directory of YAML/JSON documents.
///
/// `<root>/s3.yaml` defines service `s3`; so does `<root>/s3/rules.yaml`.
pub struct DirectoryLoader {
    index: BTreeMap<String, PathBuf>,
}

impl DirectoryLoader {
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ScanError::Config(format!(
                "rules directory not found: {}",
                root.display()
            )));
        }

        let mut index = BTreeMap::new();
        for entry in WalkDir::new(root).max_depth(2).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable rules entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !is_rule_document(path) {
                continue;
            }
            if let Some(service) = service_name(root, path) {
                if let Some(previous) = index.insert(service.clone(), path.to_path_buf()) {
                    tracing::warn!(
                        service = %service,
                        kept = %path.display(),
                        dropped = %previous.display(),
                        "duplicate rule set for service"
                    );
                }
            }
        }

        tracing::debug!(root = %root.display(), services = index.len(), "indexed rule sets");
        Ok(Self { index })
    }
}

impl RuleSetLoader for DirectoryLoader {
    fn services(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn load(&self, service: &str) -> Result<RuleSet> {
        let path = self.index.get(service).ok_or_else(|| ScanError::RuleSet {
            service: service.into(),
            message: "no rule set defined".into(),
        })?;
        let content = std::fs::read_to_string(path)?;
        let parsed = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str::<RuleSet>(&content).map_err(ScanError::from)
        } else {
            serde_yaml::from_str::<RuleSet>(&content).map_err(ScanError::from)
        };
        let mut rule_set = parsed.map_err(|e| ScanError::RuleSet {
            service: service.into(),
            message: format!("{}: {}", path.display(), e),
        })?;
        if rule_set.service.is_empty() {
            rule_set.service = service.to_string();
        }
        Ok(rule_set)
    }
}

fn is_rule_document(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

fn service_name(root: &Path, path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy().to_string();
    if stem == "rules" {
        let parent = path.parent()?;
        if parent == root {
            return None;
        }
        return Some(parent.file_name()?.to_string_lossy().to_string());
    }
    Some(stem)
}

/// Rule sets held in memory, mostly for embedding and tests.
#[derive(Default)]
pub struct InMemoryLoader {
    rule_sets: BTreeMap<String, RuleSet>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rule_set: RuleSet) -> Self {
        self.rule_sets.insert(rule_set.service.clone(), rule_set);
        self
    }
}

impl RuleSetLoader for InMemoryLoader {
    fn services(&self) -> Vec<String> {
        self.rule_sets.keys().cloned().collect()
    }

    fn load(&self, service: &str) -> Result<RuleSet> {
        self.rule_sets
            .get(service)
            .cloned()
            .ok_or_else(|| ScanError::RuleSet {
                service: service.into(),
                message: "no rule set defined".into(),
            })
    }
}

/// Rule sets for one scan, loaded and frozen before any discovery runs.
///
/// A load failure is kept per service: it turns that service's scan units
/// into ERROR results and leaves every other service alone.
#[derive(Debug, Default)]
pub struct RuleCatalog {
    entries: BTreeMap<String, std::result::Result<Arc<RuleSet>, String>>,
}

impl RuleCatalog {
    pub fn load(loader: &dyn RuleSetLoader, services: &[String]) -> Self {
        let entries = services
            .iter()
            .map(|service| {
                let entry = loader.load(service).map(Arc::new).map_err(|e| {
                    tracing::error!(service = %service, error = %e, "failed to load rule set");
                    e.to_string()
                });
                (service.clone(), entry)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, service: &str) -> Option<&std::result::Result<Arc<RuleSet>, String>> {
        self.entries.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &Arc<RuleSet>> {
        self.entries.values().filter_map(|e| e.as_ref().ok())
    }
}
