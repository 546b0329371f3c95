use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MarketError;

/// Installation breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// User-wide, under the Codex home directory.
    #[default]
    Global,
    /// Tied to one working directory.
    Project,
}

impl Scope {
    pub fn label(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Project => "project",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Scope {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Scope::Global),
            "project" => Ok(Scope::Project),
            other => Err(MarketError::InvalidScope(other.to_string())),
        }
    }
}

/// Selects ledger records for query and removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    All,
    Global,
    /// Only the record installed for this exact project directory.
    Project(PathBuf),
}

impl ScopeFilter {
    /// Builds a filter from the CLI scope flag; `project` binds to `cwd`.
    pub fn parse(raw: &str, cwd: &Path) -> Result<Self, MarketError> {
        match raw {
            "all" => Ok(ScopeFilter::All),
            "global" => Ok(ScopeFilter::Global),
            "project" => Ok(ScopeFilter::Project(cwd.to_path_buf())),
            other => Err(MarketError::InvalidScope(other.to_string())),
        }
    }

    /// The filter matching exactly one install key.
    pub fn exact(scope: Scope, project_path: Option<&Path>) -> Self {
        match (scope, project_path) {
            (Scope::Project, Some(path)) => ScopeFilter::Project(path.to_path_buf()),
            (Scope::Project, None) => ScopeFilter::Project(PathBuf::new()),
            (Scope::Global, _) => ScopeFilter::Global,
        }
    }

    pub fn matches(&self, scope: Scope, project_path: Option<&Path>) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Global => scope == Scope::Global,
            ScopeFilter::Project(path) => {
                scope == Scope::Project && project_path == Some(path.as_path())
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScopeFilter::All => "all",
            ScopeFilter::Global => "global",
            ScopeFilter::Project(_) => "project",
        }
    }
}
