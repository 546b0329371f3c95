use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "codex-market",
    version,
    about = "Install skills, prompts and MCP servers from plugin marketplaces into Codex"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install, remove and inspect plugins
    #[command(visible_alias = "p")]
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },
    /// Manage git-backed plugin marketplaces
    #[command(visible_alias = "mp")]
    Marketplace {
        #[command(subcommand)]
        command: MarketplaceCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum PluginCommand {
    /// Install <plugin>@<marketplace>
    Install {
        id: String,
        /// global or project (defaults to install.default_scope)
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Remove an installed plugin
    #[command(visible_aliases = ["remove", "rm"])]
    Uninstall {
        id: String,
        /// global, project or all
        #[arg(short, long, default_value = "global")]
        scope: String,
    },
    /// Reinstall plugins whose marketplace version changed
    Update {
        id: Option<String>,
        /// Reinstall even when the version is unchanged
        #[arg(short, long)]
        force: bool,
    },
    /// List installed plugins
    List,
    /// Show every installation of one plugin
    Show { id: String },
    /// Fuzzy search across all marketplaces
    Search { keyword: String },
}

#[derive(Subcommand, Debug)]
pub enum MarketplaceCommand {
    /// Clone and register a marketplace
    Add { url: String },
    /// Unregister a marketplace and delete its clone
    #[command(visible_aliases = ["del", "rm"])]
    Remove { name: String },
    /// List registered marketplaces
    List {
        /// Also list the plugins each marketplace offers
        #[arg(short, long)]
        all: bool,
    },
    /// Pull one or every marketplace
    Update { name: Option<String> },
}
