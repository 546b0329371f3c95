use std::path::{Component, Path, PathBuf};

use crate::error::{MarketError, Result};
use crate::model::config::AppConfig;
use crate::model::scope::Scope;

/// Where Codex reads artifacts for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    pub skills_dir: PathBuf,
    pub commands_dir: PathBuf,
    /// Shared server-declaration file (`config.toml`).
    pub mcp_config: PathBuf,
}

/// Resolves every path the tool reads or writes.
#[derive(Debug, Clone)]
pub struct Locations {
    codex_home: PathBuf,
    data_dir: PathBuf,
}

impl Locations {
    pub fn new(codex_home: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            codex_home: codex_home.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.codex_home(), config.data_dir())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("installed.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("marketplaces.toml")
    }

    pub fn marketplaces_dir(&self) -> PathBuf {
        self.data_dir.join("marketplaces")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// `cache/<marketplace>/<plugin>/<version>`; each part must be a plain directory name.
    pub fn cache_dir(&self, marketplace: &str, plugin: &str, version: &str) -> Result<PathBuf> {
        Ok(self
            .cache_root()
            .join(dir_name("marketplace", marketplace)?)
            .join(dir_name("plugin", plugin)?)
            .join(dir_name("version", version)?))
    }

    /// Strictly below the cache root, without `..` steps.
    pub fn is_cache_path(&self, path: &Path) -> bool {
        let root = self.cache_root();
        path != root.as_path()
            && path.starts_with(&root)
            && !path.components().any(|c| c == Component::ParentDir)
    }

    /// Host directories for `scope`; project scope needs the project root.
    pub fn target(&self, scope: Scope, project: Option<&Path>) -> TargetPaths {
        let base = match (scope, project) {
            (Scope::Project, Some(root)) => root.join(".codex"),
            _ => self.codex_home.clone(),
        };

        TargetPaths {
            skills_dir: base.join("skills"),
            commands_dir: base.join("prompts"),
            mcp_config: base.join("config.toml"),
        }
    }
}

fn dir_name<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(MarketError::SourceUnavailable(format!(
            "{kind} '{value}' is not a valid directory name"
        )));
    }
    Ok(value)
}
