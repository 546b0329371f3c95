//! Persisted record of what is installed, where, and under which scope.
//!
//! Every mutation is a full load-modify-save cycle under one in-process
//! read/write lock. Two separate processes racing on the same file are not
//! coordinated.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};
use crate::model::scope::{Scope, ScopeFilter};
use crate::plugin::manifest::PluginId;

pub const LEDGER_VERSION: u32 = 1;

/// A copied skill directory or command file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub name: String,
    #[serde(rename = "plugin")]
    pub owner_plugin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub marketplace: String,
    #[serde(default)]
    pub url: String,
    pub cache_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub scope: Scope,
    /// Present iff `scope` is project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub source: SourceRef,
    #[serde(default)]
    pub skills: Vec<ArtifactEntry>,
    #[serde(default)]
    pub commands: Vec<ArtifactEntry>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerEntry>,
}

impl InstallRecord {
    pub fn project(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    fn same_key(&self, other: &InstallRecord) -> bool {
        self.scope == other.scope && self.project_path == other.project_path
    }

    pub fn scope_label(&self) -> String {
        match (&self.scope, &self.project_path) {
            (Scope::Project, Some(path)) => format!("project:{}", path.display()),
            (scope, _) => scope.to_string(),
        }
    }
}

/// The on-disk document: `{ version, plugins: { id: [record, ...] } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub version: u32,
    #[serde(default)]
    pub plugins: BTreeMap<String, Vec<InstallRecord>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            plugins: BTreeMap::new(),
        }
    }
}

impl Ledger {
    /// Replaces the record with the same (scope, project) key in place, or appends.
    pub fn upsert(&mut self, id: &PluginId, record: InstallRecord) {
        let records = self.plugins.entry(id.to_string()).or_default();
        match records.iter_mut().find(|r| r.same_key(&record)) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub fn remove_by_scope(&mut self, id: &PluginId, filter: &ScopeFilter) -> Vec<InstallRecord> {
        let key = id.to_string();
        let Some(records) = self.plugins.remove(&key) else {
            return Vec::new();
        };

        let (removed, remaining): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| filter.matches(r.scope, r.project()));

        if !remaining.is_empty() {
            self.plugins.insert(key, remaining);
        }
        removed
    }

    pub fn query(&self, id: &PluginId, filter: &ScopeFilter) -> Vec<InstallRecord> {
        self.plugins
            .get(&id.to_string())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.matches(r.scope, r.project()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.plugins.values().map(Vec::len).sum()
    }
}

/// File-backed ledger store, constructed once by the command entry point.
#[derive(Debug)]
pub struct InstallLedger {
    path: PathBuf,
    lock: RwLock<()>,
}

impl InstallLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty ledger; a malformed one is a parse error.
    pub fn load(&self) -> Result<Ledger> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.read_unlocked()
    }

    /// Full overwrite; the parent directory is created when missing.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.write_unlocked(ledger)
    }

    pub fn upsert(&self, id: &PluginId, record: InstallRecord) -> Result<()> {
        self.mutate(|ledger| ledger.upsert(id, record))
    }

    /// Removes matching records and hands them back for artifact cleanup.
    pub fn remove_by_scope(&self, id: &PluginId, filter: &ScopeFilter) -> Result<Vec<InstallRecord>> {
        let removed = self.mutate(|ledger| ledger.remove_by_scope(id, filter))?;
        tracing::info!(
            "ledger: removed {} record(s) of {id} ({})",
            removed.len(),
            filter.label()
        );
        Ok(removed)
    }

    pub fn query(&self, id: &PluginId, filter: &ScopeFilter) -> Result<Vec<InstallRecord>> {
        Ok(self.load()?.query(id, filter))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> Result<T> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut ledger = self.read_unlocked()?;
        let out = f(&mut ledger);
        self.write_unlocked(&ledger)?;
        Ok(out)
    }

    fn read_unlocked(&self) -> Result<Ledger> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(err) => {
                return Err(MarketError::io(
                    format!("failed to read {}", self.path.display()),
                    err,
                ));
            }
        };

        serde_json::from_str(&raw).map_err(|err| MarketError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn write_unlocked(&self, ledger: &Ledger) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MarketError::io(format!("failed to create {}", parent.display()), err))?;
        }

        let json = serde_json::to_string_pretty(ledger).map_err(|err| MarketError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|err| MarketError::io(format!("failed to write {}", tmp.display()), err))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| MarketError::io(format!("failed to replace {}", self.path.display()), err))?;

        tracing::debug!("ledger saved to {}", self.path.display());
        Ok(())
    }
}
