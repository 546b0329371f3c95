use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::error::{MarketError, Result, Warning};
use crate::mcp::server::parse_server_file;
use crate::mcp::{ServerDeclaration, codec, conflict};
use crate::model::paths::Locations;
use crate::model::scope::{Scope, ScopeFilter};
use crate::plugin::git::{GitClient, fallback_version};
use crate::plugin::installer;
use crate::plugin::ledger::{InstallLedger, InstallRecord, Ledger, McpServerEntry, SourceRef};
use crate::plugin::manifest::{PluginId, PluginSource};
use crate::plugin::registry::{Registry, ResolvedPlugin};

/// Server declarations shipped inside a plugin.
pub const SERVER_FILE: &str = ".mcp.json";

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub id: PluginId,
    pub scope: Scope,
    /// Required for project scope, ignored for global.
    pub project: Option<PathBuf>,
    /// Carried over by update so the original install time survives.
    pub installed_at: Option<DateTime<Utc>>,
}

impl InstallRequest {
    pub fn new(id: PluginId, scope: Scope, cwd: &Path) -> Self {
        Self {
            id,
            scope,
            project: (scope == Scope::Project).then(|| cwd.to_path_buf()),
            installed_at: None,
        }
    }
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub record: InstallRecord,
    pub warnings: Vec<Warning>,
    /// `(original, installed)` names of artifacts renamed on collision.
    pub renamed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct UninstallOutcome {
    pub removed: Vec<InstallRecord>,
    pub warnings: Vec<Warning>,
}

/// A ledger record that `update` would reinstall.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub id: PluginId,
    pub record: InstallRecord,
    /// `None` when the marketplace or plugin can no longer be resolved.
    pub available: Option<String>,
}

#[derive(Debug)]
pub struct UpdateReport {
    pub pending: PendingUpdate,
    pub result: Result<InstallOutcome>,
}

/// Plugin source checked out for the duration of one install.
struct Checkout {
    root: PathBuf,
    _scratch: Option<TempDir>,
}

/// Sequences install, uninstall and update over the ledger and the host directories.
pub struct PluginManager<'a> {
    locations: &'a Locations,
    ledger: &'a InstallLedger,
    registry: &'a Registry,
    git: &'a dyn GitClient,
}

impl<'a> PluginManager<'a> {
    pub fn new(
        locations: &'a Locations,
        ledger: &'a InstallLedger,
        registry: &'a Registry,
        git: &'a dyn GitClient,
    ) -> Self {
        Self {
            locations,
            ledger,
            registry,
            git,
        }
    }

    pub fn installed(&self) -> Result<Ledger> {
        self.ledger.load()
    }

    /// Resolve, fetch, copy artifacts, merge servers, cache, then record.
    ///
    /// Nothing is written to the ledger unless every step succeeds. Artifacts
    /// copied before a failing step are left behind.
    pub fn install(&self, request: &InstallRequest) -> Result<InstallOutcome> {
        let id = &request.id;
        let project = match request.scope {
            Scope::Global => None,
            Scope::Project => Some(request.project.as_deref().ok_or_else(|| {
                MarketError::InvalidScope("project (no project directory given)".into())
            })?),
        };

        let key = ScopeFilter::exact(request.scope, project);
        if !self.ledger.query(id, &key)?.is_empty() {
            return Err(MarketError::AlreadyInstalled {
                plugin: id.to_string(),
                scope: request.scope.to_string(),
            });
        }

        tracing::info!("installing {id} ({})", request.scope);
        let resolved = self.registry.resolve(id)?;
        let checkout = self.checkout(&resolved.source)?;
        let root = checkout.root.as_path();
        let version = self.version_of(&resolved);
        let cache_path = self
            .locations
            .cache_dir(&id.marketplace, &id.name, &version)?;
        let target = self.locations.target(request.scope, project);

        let skills = installer::install_skills(&root.join("skills"), &target.skills_dir)?;
        let commands = installer::install_commands(&root.join("commands"), &target.commands_dir)?;

        let mut warnings = Vec::new();
        let mcp_servers = self.install_servers(id, root, &target.mcp_config, &mut warnings)?;
        if skills.is_empty() && commands.is_empty() && mcp_servers.is_empty() {
            tracing::warn!("{id} contributes no artifacts");
            warnings.push(Warning::EmptyPlugin);
        }

        installer::cache_copy(root, &cache_path)?;

        let renamed = skills
            .iter()
            .chain(&commands)
            .filter(|copied| copied.renamed())
            .map(|copied| (copied.original_name.clone(), copied.entry.name.clone()))
            .collect();

        let now = Utc::now();
        let record = InstallRecord {
            scope: request.scope,
            project_path: project.map(Path::to_path_buf),
            version,
            installed_at: request.installed_at.unwrap_or(now),
            last_updated: now,
            source: SourceRef {
                marketplace: id.marketplace.clone(),
                url: resolved.marketplace.url.clone(),
                cache_path,
            },
            skills: skills.into_iter().map(|c| c.entry).collect(),
            commands: commands.into_iter().map(|c| c.entry).collect(),
            mcp_servers,
        };
        self.ledger.upsert(id, record.clone())?;

        tracing::info!(
            "installed {id} {}: {} skill(s), {} command(s), {} server(s)",
            record.version,
            record.skills.len(),
            record.commands.len(),
            record.mcp_servers.len()
        );
        Ok(InstallOutcome {
            record,
            warnings,
            renamed,
        })
    }

    /// Removes every record matching `filter` and its artifacts.
    ///
    /// Each artifact removal is best effort; the ledger entry goes last and always.
    pub fn uninstall(&self, id: &PluginId, filter: &ScopeFilter) -> Result<UninstallOutcome> {
        let (targets, kept): (Vec<_>, Vec<_>) = self
            .ledger
            .query(id, &ScopeFilter::All)?
            .into_iter()
            .partition(|r| filter.matches(r.scope, r.project()));

        if targets.is_empty() {
            return Err(MarketError::not_found(
                "installation",
                format!("{id} ({})", filter.label()),
            ));
        }

        let mut warnings = Vec::new();
        for record in &targets {
            self.remove_artifacts(id, record, &kept, &mut warnings);
        }

        let removed = self.ledger.remove_by_scope(id, filter)?;
        for warning in &warnings {
            tracing::warn!("uninstall {id}: {warning}");
        }
        Ok(UninstallOutcome { removed, warnings })
    }

    /// Records whose version differs from the marketplace's, or all with `force`.
    pub fn pending_updates(&self, only: Option<&PluginId>, force: bool) -> Result<Vec<PendingUpdate>> {
        let ledger = self.ledger.load()?;
        let mut pending = Vec::new();

        for (key, records) in &ledger.plugins {
            let id = key.parse::<PluginId>().map_err(|err| MarketError::Parse {
                path: self.ledger.path().to_path_buf(),
                message: format!("malformed plugin key: {err}"),
            })?;
            if only.is_some_and(|wanted| *wanted != id) {
                continue;
            }

            let available = match self.registry.resolve(&id) {
                Ok(resolved) => Some(self.version_of(&resolved)),
                Err(err) => {
                    tracing::warn!("cannot resolve {id} for update: {err}");
                    None
                }
            };

            for record in records {
                if force || available.as_deref() != Some(record.version.as_str()) {
                    pending.push(PendingUpdate {
                        id: id.clone(),
                        record: record.clone(),
                        available: available.clone(),
                    });
                }
            }
        }

        if let Some(id) = only {
            if !ledger.plugins.contains_key(&id.to_string()) {
                return Err(MarketError::not_found("installation", id.to_string()));
            }
        }
        Ok(pending)
    }

    /// Uninstall then reinstall one record under its own scope and project.
    pub fn apply_update(&self, pending: &PendingUpdate) -> Result<InstallOutcome> {
        let record = &pending.record;
        self.registry.resolve(&pending.id)?;
        if let Some(project) = record.project() {
            if !project.is_dir() {
                return Err(MarketError::not_found(
                    "project directory",
                    project.display().to_string(),
                ));
            }
        }

        let removed = self.uninstall(
            &pending.id,
            &ScopeFilter::exact(record.scope, record.project()),
        )?;
        let mut outcome = self.install(&InstallRequest {
            id: pending.id.clone(),
            scope: record.scope,
            project: record.project_path.clone(),
            installed_at: Some(record.installed_at),
        })?;

        let mut warnings = removed.warnings;
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;
        tracing::info!(
            "updated {} ({}) {} -> {}",
            pending.id,
            record.scope_label(),
            record.version,
            outcome.record.version
        );
        Ok(outcome)
    }

    /// Updates every record of `id`; one failing record does not stop the rest.
    pub fn update(&self, id: &PluginId, force: bool) -> Result<Vec<UpdateReport>> {
        Ok(self
            .pending_updates(Some(id), force)?
            .into_iter()
            .map(|pending| {
                let result = self.apply_update(&pending);
                UpdateReport { pending, result }
            })
            .collect())
    }

    fn version_of(&self, resolved: &ResolvedPlugin) -> String {
        match resolved.descriptor.version.as_deref() {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => fallback_version(self.git, &resolved.marketplace.install_location),
        }
    }

    fn checkout(&self, source: &PluginSource) -> Result<Checkout> {
        match source {
            PluginSource::Local(path) => {
                if !path.is_dir() {
                    return Err(MarketError::SourceUnavailable(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                Ok(Checkout {
                    root: path.clone(),
                    _scratch: None,
                })
            }
            PluginSource::Remote(url) => {
                let scratch = TempDir::new()
                    .map_err(|err| MarketError::io("failed to create fetch directory", err))?;
                let root = scratch.path().join("plugin");
                tracing::info!("fetching {url}");
                self.git
                    .clone_shallow(url, &root)
                    .map_err(|err| MarketError::SourceUnavailable(format!("{url}: {err}")))?;
                Ok(Checkout {
                    root,
                    _scratch: Some(scratch),
                })
            }
        }
    }

    /// Merges the plugin's servers into `config`, minus names owned elsewhere.
    fn install_servers(
        &self,
        id: &PluginId,
        root: &Path,
        config: &Path,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<McpServerEntry>> {
        let server_file = root.join(SERVER_FILE);
        let parsed = match fs::read_to_string(&server_file) {
            Ok(raw) => parse_server_file(&raw).map_err(|err| err.to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => Err(err.to_string()),
        };
        let file = match parsed {
            Ok(file) => file,
            Err(reason) => {
                warnings.push(Warning::InvalidServerFile {
                    path: server_file,
                    reason,
                });
                return Ok(Vec::new());
            }
        };
        for (server, reason) in file.rejected {
            tracing::warn!("{id}: ignoring server {server}: {reason}");
            warnings.push(Warning::InvalidServer { server, reason });
        }
        let servers = file.servers;
        if servers.is_empty() {
            return Ok(Vec::new());
        }

        warnings.extend(
            servers
                .iter()
                .filter(|server| server.cwd.is_some())
                .map(|server| Warning::UnsupportedCwd {
                    server: server.name.clone(),
                }),
        );

        let plugin_id = id.to_string();
        let text = read_config(config)?;
        let conflicts =
            conflict::find_conflicts(&text, &plugin_id, servers.iter().map(|s| s.name.as_str()));
        for name in &conflicts {
            let owner = conflict::owner_of(&text, name);
            tracing::warn!("{id}: server {name} already exists ({owner})");
            warnings.push(Warning::ConflictDetected {
                server: name.clone(),
                owner,
            });
        }

        let accepted: Vec<ServerDeclaration> = servers
            .into_iter()
            .filter(|server| !conflicts.contains(&server.name))
            .collect();

        let patched = if accepted.is_empty() {
            codec::remove(&text, &plugin_id)
        } else {
            let encoded = codec::encode(&plugin_id, &id.marketplace, &accepted);
            warnings.extend(encoded.mismatches.into_iter().map(|m| Warning::EnvVarMismatch {
                server: m.server,
                key: m.key,
                var: m.var,
            }));
            codec::replace(&text, &plugin_id, &encoded.text)
        };

        let Ok(patched) = patched else {
            warnings.push(Warning::MalformedMarker {
                plugin: plugin_id,
                file: config.to_path_buf(),
            });
            return Ok(Vec::new());
        };

        if patched != text {
            write_config(config, &patched)?;
            tracing::info!("updated managed block for {id} in {}", config.display());
        }

        Ok(accepted
            .into_iter()
            .map(|server| McpServerEntry {
                name: server.name,
                owner_plugin: plugin_id.clone(),
            })
            .collect())
    }

    fn remove_artifacts(
        &self,
        id: &PluginId,
        record: &InstallRecord,
        kept: &[InstallRecord],
        warnings: &mut Vec<Warning>,
    ) {
        if let Some(project) = record.project() {
            if !project.is_dir() {
                warnings.push(Warning::MissingProject {
                    path: project.to_path_buf(),
                });
            }
        }

        for skill in &record.skills {
            if let Err(err) = installer::remove_skill(skill) {
                warnings.push(partial_failure(format!("skill {}", skill.name), &skill.path, &err));
            }
        }
        for command in &record.commands {
            if let Err(err) = installer::remove_command(command) {
                warnings.push(partial_failure(
                    format!("command {}", command.name),
                    &command.path,
                    &err,
                ));
            }
        }

        if !record.mcp_servers.is_empty() {
            let config = self.locations.target(record.scope, record.project()).mcp_config;
            if let Some(warning) = remove_block(id, &config) {
                warnings.push(warning);
            }
        }

        let shared = kept
            .iter()
            .any(|other| other.source.cache_path == record.source.cache_path);
        let cache = &record.source.cache_path;
        if !shared && !self.locations.is_cache_path(cache) {
            tracing::warn!("{id}: cache path {} is outside the cache", cache.display());
            warnings.push(Warning::PartialFailure {
                artifact: "cache".to_string(),
                path: cache.clone(),
                reason: "outside the cache directory, left in place".to_string(),
            });
        } else if !shared {
            match fs::remove_dir_all(cache) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warnings.push(partial_failure("cache".to_string(), cache, &err)),
            }
        }
    }
}

fn remove_block(id: &PluginId, config: &Path) -> Option<Warning> {
    let text = match fs::read_to_string(config) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => return Some(partial_failure("mcp block".to_string(), config, &err)),
    };

    let plugin_id = id.to_string();
    let Ok(stripped) = codec::remove(&text, &plugin_id) else {
        return Some(Warning::MalformedMarker {
            plugin: plugin_id,
            file: config.to_path_buf(),
        });
    };

    if stripped == text {
        return None;
    }
    match fs::write(config, stripped) {
        Ok(()) => {
            tracing::info!("removed managed block for {id} from {}", config.display());
            None
        }
        Err(err) => Some(partial_failure("mcp block".to_string(), config, &err)),
    }
}

fn partial_failure(artifact: String, path: &Path, err: &io::Error) -> Warning {
    Warning::PartialFailure {
        artifact,
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// A missing config file reads as empty.
fn read_config(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(MarketError::io(format!("failed to read {}", path.display()), err)),
    }
}

fn write_config(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| MarketError::io(format!("failed to create {}", parent.display()), err))?;
    }
    fs::write(path, text).map_err(|err| MarketError::io(format!("failed to write {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::codec::MARKER_START;
    use crate::mcp::conflict::Owner;
    use crate::plugin::git::testing::FakeGit;
    use crate::plugin::manifest::MarketplaceManifest;

    const ACME_URL: &str = "https://example.com/acme.git";
    const REMOTE_URL: &str = "https://example.com/remote-plugin.git";

    struct Fixture {
        tmp: TempDir,
        locations: Locations,
        ledger: InstallLedger,
        registry: Registry,
        git: FakeGit,
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn manifest_json(formatter_version: &str) -> String {
        format!(
            r#"{{
                "name": "acme",
                "plugins": [
                    {{ "name": "formatter", "source": "./formatter", "version": "{formatter_version}" }},
                    {{ "name": "linter", "source": "./linter", "version": "0.1.0" }},
                    {{ "name": "remote", "source": {{ "source": "url", "url": "{REMOTE_URL}" }} }},
                    {{ "name": "offline", "source": {{ "source": "url", "url": "https://example.com/offline.git" }} }},
                    {{ "name": "ghost", "source": "./ghost" }},
                    {{ "name": "odd", "source": "./odd", "version": "0.0.1" }},
                    {{ "name": "empty", "source": "./empty", "version": "0.0.1" }}
                ]
            }}"#
        )
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let repo = tmp.path().join("remote/acme");
            write(&MarketplaceManifest::path_in(&repo), &manifest_json("1.0.0"));

            write(&repo.join("formatter/skills/fmt/SKILL.md"), "# fmt");
            write(&repo.join("formatter/commands/format.md"), "Format the file.");
            write(
                &repo.join("formatter/.mcp.json"),
                r#"{ "mcpServers": { "fmt-server": {
                    "command": "fmt", "args": ["--stdio"], "env": { "TOKEN": "${FMT_TOKEN}" }
                } } }"#,
            );

            write(&repo.join("linter/skills/reviewer/SKILL.md"), "# reviewer");
            write(
                &repo.join("linter/.mcp.json"),
                r#"{ "github": { "command": "gh-mcp" }, "lint": { "url": "https://lint.example.com/mcp" } }"#,
            );

            write(&repo.join("odd/commands/odd.md"), "Odd one out.");
            write(&repo.join("empty/README.md"), "nothing to install");

            let remote = tmp.path().join("remote/remote-plugin");
            write(&remote.join("skills/r/SKILL.md"), "# r");

            let locations = Locations::new(tmp.path().join("codex"), tmp.path().join("data"));
            let ledger = InstallLedger::new(locations.ledger_path());
            let registry = Registry::new(locations.registry_path(), locations.marketplaces_dir());
            let git = FakeGit {
                commit: Some("0123456789abcdef".into()),
                remotes: vec![(ACME_URL.into(), repo), (REMOTE_URL.into(), remote)],
                ..Default::default()
            };
            registry.add(&git, ACME_URL).unwrap();

            Self {
                tmp,
                locations,
                ledger,
                registry,
                git,
            }
        }

        fn manager(&self) -> PluginManager<'_> {
            PluginManager::new(&self.locations, &self.ledger, &self.registry, &self.git)
        }

        fn codex(&self) -> PathBuf {
            self.tmp.path().join("codex")
        }

        fn project(&self, name: &str) -> PathBuf {
            let dir = self.tmp.path().join("projects").join(name);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        /// Writes into the registered clone of `acme`.
        fn plugin_file(&self, rel: &str, content: &str) {
            write(&self.locations.marketplaces_dir().join("acme").join(rel), content);
        }

        fn bump_formatter(&self, version: &str) {
            let clone = self.locations.marketplaces_dir().join("acme");
            write(&MarketplaceManifest::path_in(&clone), &manifest_json(version));
        }
    }

    fn formatter() -> PluginId {
        PluginId::new("formatter", "acme")
    }

    fn global(id: PluginId) -> InstallRequest {
        InstallRequest::new(id, Scope::Global, Path::new("/unused"))
    }

    #[test]
    fn install_then_uninstall_formatter() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let outcome = manager.install(&global(formatter())).unwrap();
        let record = &outcome.record;
        assert_eq!(record.scope, Scope::Global);
        assert_eq!(record.project_path, None);
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.skills.len(), 1);
        assert_eq!(record.skills[0].name, "fmt");
        assert_eq!(record.skills[0].path, fx.codex().join("skills/fmt"));
        assert_eq!(record.commands[0].name, "format");
        assert_eq!(record.mcp_servers.len(), 1);
        assert_eq!(record.mcp_servers[0].name, "fmt-server");
        assert_eq!(record.mcp_servers[0].owner_plugin, "formatter@acme");
        assert!(record.source.cache_path.join("skills/fmt/SKILL.md").is_file());
        assert!(outcome.warnings.contains(&Warning::EnvVarMismatch {
            server: "fmt-server".into(),
            key: "TOKEN".into(),
            var: "FMT_TOKEN".into(),
        }));

        let config = fs::read_to_string(fx.codex().join("config.toml")).unwrap();
        assert!(config.starts_with(
            "# [codex-market:start] plugin=formatter@acme marketplace=acme\n[mcp_servers.\"fmt-server\"]\n"
        ));
        assert!(config.contains("env_vars = [\n  \"TOKEN\",\n]\n"));
        assert!(!config.contains(".env]"));
        assert!(!config.contains("FMT_TOKEN"));
        assert_eq!(fx.ledger.load().unwrap().record_count(), 1);

        let removed = manager.uninstall(&formatter(), &ScopeFilter::All).unwrap();
        assert_eq!(removed.removed.len(), 1);
        assert!(removed.warnings.is_empty());

        let config = fs::read_to_string(fx.codex().join("config.toml")).unwrap();
        assert!(!config.contains(MARKER_START));
        assert!(!config.contains("fmt-server"));
        assert!(!fx.codex().join("skills/fmt").exists());
        assert!(!fx.codex().join("prompts/format.md").exists());
        assert!(!record.source.cache_path.exists());
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn repeated_install_is_rejected_without_side_effects() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.install(&global(formatter())).unwrap();

        let ledger_before = fs::read(fx.locations.ledger_path()).unwrap();
        let config_before = fs::read(fx.codex().join("config.toml")).unwrap();

        let err = manager.install(&global(formatter())).unwrap_err();
        assert!(matches!(err, MarketError::AlreadyInstalled { .. }));
        assert_eq!(fs::read(fx.locations.ledger_path()).unwrap(), ledger_before);
        assert_eq!(fs::read(fx.codex().join("config.toml")).unwrap(), config_before);
        assert!(!fx.codex().join("skills").read_dir().unwrap().any(|e| {
            e.unwrap().file_name().to_string_lossy().starts_with("fmt-")
        }));
    }

    #[test]
    fn unmanaged_server_names_are_skipped() {
        let fx = Fixture::new();
        let user = "[mcp_servers.github]\ncommand = \"my-own-gh\"\n";
        write(&fx.codex().join("config.toml"), user);

        let outcome = fx
            .manager()
            .install(&global(PluginId::new("linter", "acme")))
            .unwrap();

        let names: Vec<&str> = outcome
            .record
            .mcp_servers
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["lint"]);
        assert!(outcome.warnings.contains(&Warning::ConflictDetected {
            server: "github".into(),
            owner: Owner::User,
        }));

        let config = fs::read_to_string(fx.codex().join("config.toml")).unwrap();
        assert!(config.starts_with(user));
        assert_eq!(config.matches("[mcp_servers.github]").count(), 1);
        assert!(!config.contains("gh-mcp"));
        assert!(config.contains("url = \"https://lint.example.com/mcp\""));
    }

    #[test]
    fn forced_update_keeps_project_scope() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let project = fx.project("app");
        let request = InstallRequest::new(formatter(), Scope::Project, &project);
        let first = manager.install(&request).unwrap().record;

        let reports = manager.update(&formatter(), true).unwrap();
        assert_eq!(reports.len(), 1);
        let updated = &reports[0].result.as_ref().unwrap().record;

        assert_eq!(updated.scope, Scope::Project);
        assert_eq!(updated.project_path.as_deref(), Some(project.as_path()));
        assert_eq!(updated.installed_at, first.installed_at);
        assert_eq!(updated.skills[0].path, project.join(".codex/skills/fmt"));
        assert!(project.join(".codex/config.toml").is_file());
        assert!(!fx.codex().join("skills/fmt").exists());
        assert_eq!(fx.ledger.load().unwrap().record_count(), 1);
    }

    #[test]
    fn update_skips_current_versions_unless_newer() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let old_cache = manager.install(&global(formatter())).unwrap().record.source.cache_path;

        assert!(manager.update(&formatter(), false).unwrap().is_empty());

        fx.bump_formatter("2.0.0");
        let pending = manager.pending_updates(None, false).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].available.as_deref(), Some("2.0.0"));

        let outcome = manager.apply_update(&pending[0]).unwrap();
        assert_eq!(outcome.record.version, "2.0.0");
        assert!(!old_cache.exists());
        assert!(outcome.record.source.cache_path.ends_with("formatter/2.0.0"));

        let records = fx.ledger.query(&formatter(), &ScopeFilter::All).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, "2.0.0");
    }

    #[test]
    fn update_of_unknown_plugin_is_not_found() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager().update(&formatter(), true),
            Err(MarketError::NotFound { .. })
        ));
    }

    #[test]
    fn remote_sources_fall_back_to_commit_version() {
        let fx = Fixture::new();
        let outcome = fx
            .manager()
            .install(&global(PluginId::new("remote", "acme")))
            .unwrap();
        assert_eq!(outcome.record.version, "0123456789ab");
        assert!(fx.codex().join("skills/r/SKILL.md").is_file());
    }

    #[test]
    fn unavailable_sources_leave_no_record() {
        let fx = Fixture::new();
        let manager = fx.manager();

        for name in ["offline", "ghost"] {
            let err = manager
                .install(&global(PluginId::new(name, "acme")))
                .unwrap_err();
            assert!(matches!(err, MarketError::SourceUnavailable(_)), "{name}: {err}");
        }
        assert!(matches!(
            manager.install(&global(PluginId::new("nope", "acme"))),
            Err(MarketError::NotFound { .. })
        ));
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn colliding_skills_from_two_plugins_coexist() {
        let fx = Fixture::new();
        write(&fx.codex().join("skills/fmt/SKILL.md"), "user skill");

        let outcome = fx.manager().install(&global(formatter())).unwrap();
        assert_eq!(outcome.renamed.len(), 1);
        assert_eq!(outcome.renamed[0].0, "fmt");
        assert_ne!(outcome.record.skills[0].path, fx.codex().join("skills/fmt"));
        assert_eq!(
            fs::read_to_string(fx.codex().join("skills/fmt/SKILL.md")).unwrap(),
            "user skill"
        );
    }

    #[test]
    fn project_uninstall_leaves_other_projects() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let a = fx.project("a");
        let b = fx.project("b");
        manager
            .install(&InstallRequest::new(formatter(), Scope::Project, &a))
            .unwrap();
        manager
            .install(&InstallRequest::new(formatter(), Scope::Project, &b))
            .unwrap();

        manager
            .uninstall(&formatter(), &ScopeFilter::Project(a.clone()))
            .unwrap();

        assert!(!a.join(".codex/skills/fmt").exists());
        assert!(b.join(".codex/skills/fmt").is_dir());
        let left = fx.ledger.query(&formatter(), &ScopeFilter::All).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].project(), Some(b.as_path()));
        // Same version, same cache: still referenced by project b.
        assert!(left[0].source.cache_path.is_dir());
    }

    #[test]
    fn missing_project_directories_warn_and_still_purge() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let gone = fx.project("gone");
        manager
            .install(&InstallRequest::new(formatter(), Scope::Project, &gone))
            .unwrap();
        manager.install(&global(formatter())).unwrap();
        fs::remove_dir_all(&gone).unwrap();

        let outcome = manager.uninstall(&formatter(), &ScopeFilter::All).unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert!(outcome.warnings.contains(&Warning::MissingProject { path: gone }));
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn unterminated_own_block_is_left_alone() {
        let fx = Fixture::new();
        let broken = "# [codex-market:start] plugin=formatter@acme marketplace=acme\n[mcp_servers.x]\ncommand = \"x\"\n";
        write(&fx.codex().join("config.toml"), broken);

        let outcome = fx.manager().install(&global(formatter())).unwrap();
        assert!(outcome.record.mcp_servers.is_empty());
        assert!(matches!(
            outcome.warnings.last(),
            Some(Warning::MalformedMarker { .. })
        ));
        assert_eq!(
            fs::read_to_string(fx.codex().join("config.toml")).unwrap(),
            broken
        );
    }

    #[test]
    fn uninstalling_nothing_is_not_found() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager().uninstall(&formatter(), &ScopeFilter::All),
            Err(MarketError::NotFound { .. })
        ));
    }

    #[test]
    fn unsafe_version_is_rejected_before_copying() {
        let fx = Fixture::new();
        let victim = fx.tmp.path().join("victim");
        write(&victim.join("precious.txt"), "keep me");
        fx.bump_formatter("../../../../victim");

        let err = fx.manager().install(&global(formatter())).unwrap_err();
        assert!(matches!(err, MarketError::SourceUnavailable(_)), "{err}");
        assert_eq!(fs::read_to_string(victim.join("precious.txt")).unwrap(), "keep me");
        assert!(!victim.join("skills").exists());
        assert!(!fx.codex().join("skills/fmt").exists());
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn uninstall_never_deletes_a_cache_path_outside_the_cache() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.install(&global(formatter())).unwrap();

        let victim = fx.tmp.path().join("victim");
        write(&victim.join("precious.txt"), "keep me");
        let mut ledger = fx.ledger.load().unwrap();
        let records = ledger.plugins.get_mut("formatter@acme").unwrap();
        records[0].source.cache_path = fx
            .locations
            .cache_root()
            .join("acme/formatter/../../../../victim");
        fx.ledger.save(&ledger).unwrap();

        let outcome = manager.uninstall(&formatter(), &ScopeFilter::All).unwrap();
        assert!(outcome.warnings.iter().any(|w| matches!(
            w,
            Warning::PartialFailure { artifact, .. } if artifact == "cache"
        )));
        assert!(victim.join("precious.txt").is_file());
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn failed_artifact_removal_warns_and_still_drops_the_record() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.install(&global(formatter())).unwrap();

        // A directory where the command file was cannot be removed as a file.
        let command = fx.codex().join("prompts/format.md");
        fs::remove_file(&command).unwrap();
        write(&command.join("inner.txt"), "x");

        let outcome = manager.uninstall(&formatter(), &ScopeFilter::All).unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert!(outcome.warnings.iter().any(|w| matches!(
            w,
            Warning::PartialFailure { artifact, path, .. }
                if artifact == "command format" && *path == command
        )));
        assert!(!fx.codex().join("skills/fmt").exists());
        assert!(fx.ledger.load().unwrap().plugins.is_empty());
    }

    #[test]
    fn unreadable_server_file_warns_and_installs_the_rest() {
        let fx = Fixture::new();
        fx.plugin_file("odd/.mcp.json", "{ not json");

        let outcome = fx
            .manager()
            .install(&global(PluginId::new("odd", "acme")))
            .unwrap();
        assert!(outcome.record.mcp_servers.is_empty());
        assert_eq!(outcome.record.commands.len(), 1);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [Warning::InvalidServerFile { path, .. }] if path.ends_with(".mcp.json")
        ));
        assert!(!fx.codex().join("config.toml").exists());
    }

    #[test]
    fn mistyped_and_cwd_servers_are_reported() {
        let fx = Fixture::new();
        fx.plugin_file(
            "odd/.mcp.json",
            r#"{ "mcpServers": {
                "db": { "command": "db-mcp", "env": { "PORT": 5432 } },
                "svc": { "command": "svc-mcp", "cwd": "/srv" }
            } }"#,
        );

        let outcome = fx
            .manager()
            .install(&global(PluginId::new("odd", "acme")))
            .unwrap();
        let names: Vec<&str> = outcome
            .record
            .mcp_servers
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["svc"]);
        assert!(outcome.warnings.iter().any(|w| matches!(
            w,
            Warning::InvalidServer { server, .. } if server == "db"
        )));
        assert!(outcome.warnings.contains(&Warning::UnsupportedCwd {
            server: "svc".into()
        }));

        let config = fs::read_to_string(fx.codex().join("config.toml")).unwrap();
        assert!(config.contains("svc-mcp"));
        assert!(!config.contains("db-mcp"));
        assert!(!config.contains("/srv"));
    }

    #[test]
    fn plugin_without_artifacts_installs_with_a_warning() {
        let fx = Fixture::new();
        let outcome = fx
            .manager()
            .install(&global(PluginId::new("empty", "acme")))
            .unwrap();
        assert_eq!(outcome.warnings, vec![Warning::EmptyPlugin]);
        assert_eq!(fx.ledger.load().unwrap().record_count(), 1);
    }

    #[test]
    fn malformed_ledger_keys_fail_update_checks() {
        let fx = Fixture::new();
        let mut ledger = fx.ledger.load().unwrap();
        ledger.plugins.insert("no-marketplace".into(), Vec::new());
        fx.ledger.save(&ledger).unwrap();

        assert!(matches!(
            fx.manager().pending_updates(None, false),
            Err(MarketError::Parse { .. })
        ));
    }
}
