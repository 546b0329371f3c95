use std::path::PathBuf;

use thiserror::Error;

use crate::mcp::conflict::Owner;

pub type Result<T> = std::result::Result<T, MarketError>;

/// Failures returned to the command layer for display.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{plugin} is already installed with scope '{scope}'")]
    AlreadyInstalled { plugin: String, scope: String },

    #[error("plugin source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid plugin identifier '{0}' (expected <plugin>@<marketplace>)")]
    InvalidIdentifier(String),

    #[error("invalid scope '{0}' (must be global, project, or all)")]
    InvalidScope(String),

    #[error("git: {0}")]
    Git(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl MarketError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Non-fatal conditions collected while installing or removing a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Warning {
    #[error("MCP server '{server}' already exists ({owner}), skipped")]
    ConflictDetected { server: String, owner: Owner },

    #[error("MCP server '{server}': env key '{key}' forwards shell variable '{key}', but the plugin referenced '{var}'")]
    EnvVarMismatch {
        server: String,
        key: String,
        var: String,
    },

    #[error("unterminated managed block for {plugin} in {}, file left unchanged", file.display())]
    MalformedMarker { plugin: String, file: PathBuf },

    #[error("MCP server '{server}': cwd is not supported by Codex and was dropped")]
    UnsupportedCwd { server: String },

    #[error("failed to remove {artifact} at {}: {reason}", path.display())]
    PartialFailure {
        artifact: String,
        path: PathBuf,
        reason: String,
    },

    #[error("ignoring {}: {reason}", path.display())]
    InvalidServerFile { path: PathBuf, reason: String },

    #[error("MCP server '{server}' ignored: {reason}")]
    InvalidServer { server: String, reason: String },

    #[error("no skills, commands, or MCP servers found in plugin")]
    EmptyPlugin,

    #[error("project directory {} no longer exists", path.display())]
    MissingProject { path: PathBuf },
}
