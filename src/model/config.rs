use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

use crate::model::scope::Scope;

const DEFAULTS: &str = include_str!("../../config/default.toml");

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub paths: PathsConfig,
    pub install: InstallConfig,
    /// User file merged over the defaults, if one was found.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    pub codex_home: String,
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallConfig {
    pub default_scope: Scope,
}

impl AppConfig {
    /// Load configuration with layering: defaults → user config.
    pub fn load() -> Result<Self> {
        let user_path = project_dirs().map(|d| d.config_dir().join("config.toml"));
        Self::load_from(user_path.as_deref())
    }

    /// Layers `user_path` over the defaults when it exists.
    fn load_from(user_path: Option<&Path>) -> Result<Self> {
        let mut user = None;
        let mut source = None;
        if let Some(path) = user_path.filter(|p| p.exists()) {
            let user_str = fs::read_to_string(path)?;
            let table: Table =
                toml::from_str(&user_str).map_err(|e| anyhow!("{}: {e}", path.display()))?;
            user = Some(table);
            source = Some(path.to_path_buf());
        }

        let mut config = Self::layered(user)?;
        config.source = source;
        config.paths.codex_home = expand_tilde(&config.paths.codex_home)?;
        config.paths.data_dir = expand_tilde(&config.paths.data_dir)?;

        Ok(config)
    }

    pub fn defaults() -> Result<Self> {
        Self::layered(None)
    }

    /// Compiled-in defaults with `user` merged over them key by key.
    fn layered(user: Option<Table>) -> Result<Self> {
        let mut base: Table = toml::from_str(DEFAULTS)?;
        if let Some(user) = user {
            merge(&mut base, user);
        }
        Ok(Value::Table(base).try_into()?)
    }

    pub fn codex_home(&self) -> PathBuf {
        PathBuf::from(&self.paths.codex_home)
    }

    /// Directory holding the ledger, registry, marketplace clones and cache.
    pub fn data_dir(&self) -> PathBuf {
        if !self.paths.data_dir.is_empty() {
            return PathBuf::from(&self.paths.data_dir);
        }

        project_dirs()
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".codex-market"))
    }
}

pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "codex-market")
}

fn merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(nested)) => merge(existing, nested),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn expand_tilde(raw: &str) -> Result<String> {
    if !raw.starts_with('~') {
        return Ok(raw.to_string());
    }

    let home = dirs_home().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(raw.replacen('~', &home.to_string_lossy(), 1))
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
