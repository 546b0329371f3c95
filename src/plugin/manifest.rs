use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{MarketError, Result};

pub const MANIFEST_DIR: &str = ".claude-plugin";
pub const MANIFEST_FILE: &str = "marketplace.json";

/// `<name>@<marketplace>`, the ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId {
    pub name: String,
    pub marketplace: String,
}

impl PluginId {
    pub fn new(name: impl Into<String>, marketplace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            marketplace: marketplace.into(),
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.marketplace)
    }
}

impl FromStr for PluginId {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(marketplace), None) if !name.is_empty() && !marketplace.is_empty() => {
                Ok(Self::new(name, marketplace))
            }
            _ => Err(MarketError::InvalidIdentifier(s.to_string())),
        }
    }
}

/// `.claude-plugin/marketplace.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: Option<Owner>,
    #[serde(default)]
    pub metadata: Option<MarketplaceMetadata>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Owner {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceMetadata {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub plugin_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl PluginDescriptor {
    pub fn display_version(&self) -> &str {
        self.version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("latest")
    }
}

/// Plugin source as written in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    /// Relative to the marketplace root (and `pluginRoot`).
    Path(String),
    Remote(RemoteSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum RemoteSpec {
    Url { url: String },
    /// `owner/repo` shorthand on GitHub.
    Github { repo: String },
}

/// Where a plugin's files come from once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Local(PathBuf),
    Remote(String),
}

impl MarketplaceManifest {
    pub fn path_in(marketplace_dir: &Path) -> PathBuf {
        marketplace_dir.join(MANIFEST_DIR).join(MANIFEST_FILE)
    }

    pub fn load(marketplace_dir: &Path) -> Result<Self> {
        let path = Self::path_in(marketplace_dir);
        let raw = fs::read_to_string(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                MarketError::not_found("marketplace manifest", path.display().to_string())
            }
            _ => MarketError::io(format!("failed to read {}", path.display()), err),
        })?;

        serde_json::from_str(&raw).map_err(|err| MarketError::Parse {
            path,
            message: err.to_string(),
        })
    }

    pub fn find_plugin(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|plugin| plugin.name == name)
    }

    pub fn source_of(&self, marketplace_dir: &Path, plugin: &PluginDescriptor) -> PluginSource {
        match &plugin.source {
            SourceSpec::Remote(RemoteSpec::Url { url }) => PluginSource::Remote(url.clone()),
            SourceSpec::Remote(RemoteSpec::Github { repo }) => {
                PluginSource::Remote(github_url(repo))
            }
            SourceSpec::Path(relative) => {
                let base = match self
                    .metadata
                    .as_ref()
                    .and_then(|m| m.plugin_root.as_deref())
                    .filter(|root| !root.is_empty())
                {
                    Some(root) => marketplace_dir.join(root),
                    None => marketplace_dir.to_path_buf(),
                };
                PluginSource::Local(base.join(relative))
            }
        }
    }
}

fn github_url(repo: &str) -> String {
    let repo = repo.trim_matches('/').trim_end_matches(".git");
    format!("https://github.com/{repo}.git")
}
