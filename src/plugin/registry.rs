//! Known marketplaces, persisted in `marketplaces.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};
use crate::plugin::git::GitClient;
use crate::plugin::manifest::{MarketplaceManifest, PluginDescriptor, PluginId, PluginSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceEntry {
    pub url: String,
    pub install_location: PathBuf,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    marketplaces: BTreeMap<String, MarketplaceEntry>,
}

/// A plugin located in a registered marketplace.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub descriptor: PluginDescriptor,
    pub source: PluginSource,
    pub marketplace: MarketplaceEntry,
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    marketplaces_dir: PathBuf,
    lock: RwLock<()>,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>, marketplaces_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            marketplaces_dir: marketplaces_dir.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn list(&self) -> Result<BTreeMap<String, MarketplaceEntry>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_unlocked()?.marketplaces)
    }

    pub fn get(&self, name: &str) -> Result<MarketplaceEntry> {
        self.list()?
            .remove(name)
            .ok_or_else(|| MarketError::not_found("marketplace", name))
    }

    /// Clones `url`, validates its manifest and registers it under the manifest's name.
    pub fn add(&self, git: &dyn GitClient, url: &str) -> Result<(String, MarketplaceManifest)> {
        let repo = repo_slug(url)
            .ok_or_else(|| MarketError::SourceUnavailable(format!("cannot derive a name from '{url}'")))?;

        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read_unlocked()?;
        let dest = self.marketplaces_dir.join(&repo);
        if file.marketplaces.contains_key(&repo) || dest.exists() {
            return Err(MarketError::SourceUnavailable(format!(
                "marketplace '{repo}' already exists"
            )));
        }

        fs::create_dir_all(&self.marketplaces_dir).map_err(|err| {
            MarketError::io(
                format!("failed to create {}", self.marketplaces_dir.display()),
                err,
            )
        })?;
        git.clone_shallow(url, &dest)?;

        let manifest = match MarketplaceManifest::load(&dest) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!("invalid marketplace at {url}: {err}");
                let _ = fs::remove_dir_all(&dest);
                return Err(err);
            }
        };

        let name = if manifest.name.is_empty() {
            repo.clone()
        } else {
            manifest.name.clone()
        };
        if file.marketplaces.contains_key(&name) {
            let _ = fs::remove_dir_all(&dest);
            return Err(MarketError::SourceUnavailable(format!(
                "marketplace '{name}' already exists"
            )));
        }

        file.marketplaces.insert(
            name.clone(),
            MarketplaceEntry {
                url: url.to_string(),
                install_location: dest.clone(),
                last_updated: Utc::now(),
            },
        );
        if let Err(err) = self.write_unlocked(&file) {
            let _ = fs::remove_dir_all(&dest);
            return Err(err);
        }

        tracing::info!("marketplace {name} added from {url}");
        Ok((name, manifest))
    }

    /// Unregisters `name` and deletes its clone; a failed delete is only logged.
    pub fn remove(&self, name: &str) -> Result<MarketplaceEntry> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read_unlocked()?;
        let entry = file
            .marketplaces
            .remove(name)
            .ok_or_else(|| MarketError::not_found("marketplace", name))?;

        if let Err(err) = fs::remove_dir_all(&entry.install_location) {
            tracing::warn!(
                "failed to remove {}: {err}",
                entry.install_location.display()
            );
        }
        self.write_unlocked(&file)?;
        tracing::info!("marketplace {name} removed");
        Ok(entry)
    }

    /// Pulls one marketplace and refreshes its timestamp.
    pub fn update(&self, git: &dyn GitClient, name: &str) -> Result<()> {
        let entry = self.get(name)?;
        git.pull(&entry.install_location)?;
        self.touch(name)?;
        tracing::info!("marketplace {name} updated");
        Ok(())
    }

    fn touch(&self, name: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read_unlocked()?;
        if let Some(entry) = file.marketplaces.get_mut(name) {
            entry.last_updated = Utc::now();
            self.write_unlocked(&file)?;
        }
        Ok(())
    }

    pub fn manifest(&self, name: &str) -> Result<(MarketplaceEntry, MarketplaceManifest)> {
        let entry = self.get(name)?;
        let manifest = MarketplaceManifest::load(&entry.install_location)?;
        Ok((entry, manifest))
    }

    /// Finds the plugin descriptor and where its files come from.
    pub fn resolve(&self, id: &PluginId) -> Result<ResolvedPlugin> {
        let (marketplace, manifest) = self.manifest(&id.marketplace)?;
        let descriptor = manifest
            .find_plugin(&id.name)
            .cloned()
            .ok_or_else(|| MarketError::not_found("plugin", id.to_string()))?;
        let source = manifest.source_of(&marketplace.install_location, &descriptor);

        Ok(ResolvedPlugin {
            descriptor,
            source,
            marketplace,
        })
    }

    fn read_unlocked(&self) -> Result<RegistryFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default());
            }
            Err(err) => {
                return Err(MarketError::io(
                    format!("failed to read {}", self.path.display()),
                    err,
                ));
            }
        };

        toml::from_str(&raw).map_err(|err| MarketError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn write_unlocked(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MarketError::io(format!("failed to create {}", parent.display()), err))?;
        }
        let raw = toml::to_string_pretty(file).map_err(|err| MarketError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        fs::write(&self.path, raw)
            .map_err(|err| MarketError::io(format!("failed to write {}", self.path.display()), err))
    }
}

/// Last path segment of a git URL without `.git`.
pub fn repo_slug(url: &str) -> Option<String> {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit(['/', ':'])
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}
