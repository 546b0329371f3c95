use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::{Command, MarketplaceCommand, PluginCommand};
use crate::error::{MarketError, Warning};
use crate::mcp::codec;
use crate::model::config::AppConfig;
use crate::model::paths::Locations;
use crate::model::scope::{Scope, ScopeFilter};
use crate::plugin::git::SystemGit;
use crate::plugin::ledger::{InstallLedger, InstallRecord};
use crate::plugin::manager::{InstallOutcome, InstallRequest, PendingUpdate, PluginManager};
use crate::plugin::manifest::{PluginDescriptor, PluginId};
use crate::plugin::registry::Registry;
use crate::plugin::search;
use crate::spinner::Spinner;

/// Owns the stores for one invocation and dispatches commands onto them.
pub struct App {
    config: AppConfig,
    locations: Locations,
    ledger: InstallLedger,
    registry: Registry,
    git: SystemGit,
    cwd: PathBuf,
}

impl App {
    pub fn new(config: AppConfig, locations: Locations) -> Result<Self> {
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        Ok(Self {
            ledger: InstallLedger::new(locations.ledger_path()),
            registry: Registry::new(locations.registry_path(), locations.marketplaces_dir()),
            git: SystemGit,
            config,
            locations,
            cwd,
        })
    }

    fn manager(&self) -> PluginManager<'_> {
        PluginManager::new(&self.locations, &self.ledger, &self.registry, &self.git)
    }

    pub fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Plugin { command } => self.run_plugin(command),
            Command::Marketplace { command } => self.run_marketplace(command),
        }
    }

    fn run_plugin(&self, command: PluginCommand) -> Result<()> {
        match command {
            PluginCommand::Install { id, scope } => {
                let id: PluginId = id.parse()?;
                let scope = match scope {
                    Some(raw) => raw.parse::<Scope>()?,
                    None => self.config.install.default_scope,
                };
                self.install(id, scope)
            }
            PluginCommand::Uninstall { id, scope } => {
                let id: PluginId = id.parse()?;
                let filter = ScopeFilter::parse(&scope, &self.cwd)?;
                self.uninstall(&id, &filter)
            }
            PluginCommand::Update { id, force } => {
                let id = id.map(|raw| raw.parse::<PluginId>()).transpose()?;
                self.update(id.as_ref(), force)
            }
            PluginCommand::List => self.list_installed(),
            PluginCommand::Show { id } => self.show(&id.parse()?),
            PluginCommand::Search { keyword } => self.search(&keyword),
        }
    }

    fn run_marketplace(&self, command: MarketplaceCommand) -> Result<()> {
        match command {
            MarketplaceCommand::Add { url } => {
                let spinner = Spinner::start(format!("Cloning {url}"));
                let added = self.registry.add(&self.git, &url);
                spinner.stop(added.is_ok());
                let (name, manifest) = added?;
                println!(
                    "Added marketplace {name} ({} plugin(s))",
                    manifest.plugins.len()
                );
                Ok(())
            }
            MarketplaceCommand::Remove { name } => {
                self.registry.remove(&name)?;
                println!("Removed marketplace {name}");
                Ok(())
            }
            MarketplaceCommand::List { all } => self.list_marketplaces(all),
            MarketplaceCommand::Update { name } => {
                match name {
                    Some(name) => self.pull_marketplace(&name)?,
                    None => self.pull_all_marketplaces()?,
                }
                Ok(())
            }
        }
    }

    fn install(&self, id: PluginId, scope: Scope) -> Result<()> {
        let request = InstallRequest::new(id, scope, &self.cwd);
        let spinner = Spinner::start(format!("Installing {} ({scope})", request.id));
        let result = self.manager().install(&request);
        spinner.stop(result.is_ok());

        let outcome = result?;
        print_install_summary(&outcome);
        Ok(())
    }

    fn uninstall(&self, id: &PluginId, filter: &ScopeFilter) -> Result<()> {
        let outcome = self.manager().uninstall(id, filter)?;
        for record in &outcome.removed {
            println!("Removed {id} from {}", record.scope_label());
        }
        print_warnings(&outcome.warnings);
        println!("Removed {} installation(s)", outcome.removed.len());
        Ok(())
    }

    fn update(&self, id: Option<&PluginId>, force: bool) -> Result<()> {
        match id {
            Some(id) => self.pull_marketplace(&id.marketplace)?,
            None => self.pull_all_marketplaces()?,
        }

        let pending = self.manager().pending_updates(id, force)?;
        if pending.is_empty() {
            println!("All plugins are up to date");
            return Ok(());
        }

        let mut updated = 0;
        for item in &pending {
            if self.apply_update(item) {
                updated += 1;
            }
        }
        println!("{updated} of {} plugin installation(s) updated", pending.len());
        Ok(())
    }

    fn apply_update(&self, item: &PendingUpdate) -> bool {
        let available = item.available.as_deref().unwrap_or("unknown");
        let label = format!(
            "Updating {} ({}) {} → {available}",
            item.id,
            item.record.scope_label(),
            item.record.version
        );

        let spinner = Spinner::start(label);
        let result = self.manager().apply_update(item);
        spinner.stop(result.is_ok());

        match result {
            Ok(outcome) => {
                print_warnings(&outcome.warnings);
                true
            }
            Err(err) => {
                println!("  error: {err}");
                false
            }
        }
    }

    fn pull_marketplace(&self, name: &str) -> Result<()> {
        let spinner = Spinner::start(format!("Updating marketplace {name}"));
        let result = self.registry.update(&self.git, name);
        spinner.stop(result.is_ok());
        Ok(result?)
    }

    /// Pulls every marketplace; failures are printed and skipped.
    fn pull_all_marketplaces(&self) -> Result<()> {
        for name in self.registry.list()?.into_keys() {
            if let Err(err) = self.pull_marketplace(&name) {
                println!("  error: {err}");
            }
        }
        Ok(())
    }

    fn list_installed(&self) -> Result<()> {
        let ledger = self.manager().installed()?;
        if ledger.plugins.is_empty() {
            println!("No plugins installed");
            return Ok(());
        }

        for (id, records) in &ledger.plugins {
            for record in records {
                println!("  {id} (v{})", record.version);
                println!("    Scope: {}", record.scope_label());
                println!("    Source: {}", record.source.url);
                print_artifacts(record);
                println!("    Installed: {}", record.installed_at.to_rfc3339());
            }
        }
        println!("\nTotal: {} installation(s)", ledger.record_count());
        Ok(())
    }

    fn show(&self, id: &PluginId) -> Result<()> {
        let records = self.ledger.query(id, &ScopeFilter::All)?;
        if records.is_empty() {
            return Err(MarketError::not_found("installation", id.to_string()).into());
        }

        println!("Plugin: {id}");
        for (idx, record) in records.iter().enumerate() {
            println!();
            println!("[{}] Scope: {}", idx + 1, record.scope_label());
            println!("    Version: {}", record.version);
            println!("    Source: {}", record.source.url);
            println!("    Cache: {}", record.source.cache_path.display());
            println!("    Installed: {}", record.installed_at.to_rfc3339());
            println!("    Updated: {}", record.last_updated.to_rfc3339());
            print_artifacts(record);
            if !record.mcp_servers.is_empty() {
                let config = self.locations.target(record.scope, record.project()).mcp_config;
                println!("    MCP Config: {}", describe_block(id, &config));
            }
        }
        println!("\nTotal: {} installation(s)", records.len());
        Ok(())
    }

    fn search(&self, keyword: &str) -> Result<()> {
        let hits = search::search(keyword, self.catalog()?);
        if hits.is_empty() {
            println!("No plugins match '{keyword}'");
            return Ok(());
        }

        for hit in hits {
            println!(
                "  {}@{} (v{})",
                hit.plugin.name,
                hit.marketplace,
                hit.plugin.display_version()
            );
            if let Some(description) = &hit.plugin.description {
                println!("    {description}");
            }
            if !hit.plugin.tags.is_empty() {
                println!("    Tags: {}", hit.plugin.tags.join(", "));
            }
            if let Some(category) = &hit.plugin.category {
                println!("    Category: {category}");
            }
        }
        Ok(())
    }

    fn list_marketplaces(&self, with_plugins: bool) -> Result<()> {
        let marketplaces = self.registry.list()?;
        if marketplaces.is_empty() {
            println!("No marketplaces registered");
            return Ok(());
        }

        for (name, entry) in &marketplaces {
            println!("  {name}");
            println!("    URL: {}", entry.url);
            println!("    Path: {}", entry.install_location.display());
            println!("    Updated: {}", entry.last_updated.to_rfc3339());
            if !with_plugins {
                continue;
            }
            match self.registry.manifest(name) {
                Ok((_, manifest)) => {
                    if let Some(owner) = &manifest.owner {
                        match &owner.email {
                            Some(email) => println!("    Owner: {} <{email}>", owner.name),
                            None => println!("    Owner: {}", owner.name),
                        }
                    }
                    if let Some(description) =
                        manifest.metadata.as_ref().and_then(|m| m.description.as_deref())
                    {
                        println!("    {description}");
                    }
                    for plugin in &manifest.plugins {
                        let description = plugin.description.as_deref().unwrap_or("");
                        println!(
                            "    - {} (v{}) {description}",
                            plugin.name,
                            plugin.display_version()
                        );
                    }
                }
                Err(err) => println!("    error: {err}"),
            }
        }
        Ok(())
    }

    /// Every plugin of every readable marketplace.
    fn catalog(&self) -> Result<Vec<(String, PluginDescriptor)>> {
        let mut catalog = Vec::new();
        for name in self.registry.list()?.into_keys() {
            match self.registry.manifest(&name) {
                Ok((_, manifest)) => catalog.extend(
                    manifest
                        .plugins
                        .into_iter()
                        .map(|plugin| (name.clone(), plugin)),
                ),
                Err(err) => tracing::warn!("skipping marketplace {name}: {err}"),
            }
        }
        Ok(catalog)
    }
}

/// Where the plugin's managed block sits in `config`, if it is still there.
fn describe_block(id: &PluginId, config: &Path) -> String {
    let text = match fs::read_to_string(config) {
        Ok(text) => text,
        Err(err) => return format!("{} ({err})", config.display()),
    };
    match codec::decode(&text, &id.to_string()) {
        Ok(Some(block)) => format!(
            "{} (lines {}-{}, marketplace {}: {})",
            config.display(),
            block.start_line + 1,
            block.end_line + 1,
            block.marketplace.as_deref().unwrap_or("?"),
            block.server_names().join(", ")
        ),
        Ok(None) => format!("{} (managed block missing)", config.display()),
        Err(err) => format!("{} ({err})", config.display()),
    }
}

fn print_install_summary(outcome: &InstallOutcome) {
    let record = &outcome.record;
    for (original, installed) in &outcome.renamed {
        println!("  '{original}' already exists, installed as '{installed}'");
    }
    println!("  Version: {}", record.version);
    print_artifacts(record);
    print_warnings(&outcome.warnings);
}

fn print_artifacts(record: &InstallRecord) {
    if !record.skills.is_empty() {
        println!("    Skills:");
        for skill in &record.skills {
            println!("      - {}: {}", skill.name, skill.path.display());
        }
    }
    if !record.commands.is_empty() {
        println!("    Commands:");
        for command in &record.commands {
            println!("      - /{}: {}", command.name, command.path.display());
        }
    }
    if !record.mcp_servers.is_empty() {
        println!("    MCP Servers:");
        for server in &record.mcp_servers {
            println!("      - {}", server.name);
        }
    }
}

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        println!("  warning: {warning}");
    }
}
