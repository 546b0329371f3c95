use std::path::Path;
use std::process::Command;

use crate::error::{MarketError, Result};

const AUTH_PATTERNS: &[&str] = &[
    "Authentication failed",
    "Permission denied",
    "could not read Username",
    "fatal: repository",
    "not found",
    "403",
    "401",
];

/// Thin seam over `git`; the core never touches repositories directly.
pub trait GitClient {
    /// Shallow clone of `url` into `dest`.
    fn clone_shallow(&self, url: &str, dest: &Path) -> Result<()>;
    fn pull(&self, repo: &Path) -> Result<()>;
    fn current_commit(&self, repo: &Path) -> Result<String>;
}

/// Shells out to the `git` binary on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGit;

impl SystemGit {
    fn run(&self, args: &[&str], what: &str, target: &str) -> Result<String> {
        tracing::debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .output()
            .map_err(|err| MarketError::io("failed to run git", err))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if AUTH_PATTERNS.iter().any(|p| stderr.contains(p)) {
            return Err(MarketError::Git(format!(
                "authentication failed for '{target}': {stderr}"
            )));
        }
        Err(MarketError::Git(format!("{what} failed: {stderr}")))
    }
}

impl GitClient for SystemGit {
    fn clone_shallow(&self, url: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run(&["clone", "--depth", "1", url, &dest], "git clone", url)
            .map(|_| ())
    }

    fn pull(&self, repo: &Path) -> Result<()> {
        let repo = repo.to_string_lossy();
        self.run(&["-C", &repo, "pull", "--ff-only"], "git pull", &repo)
            .map(|_| ())
    }

    fn current_commit(&self, repo: &Path) -> Result<String> {
        let repo = repo.to_string_lossy();
        self.run(&["-C", &repo, "rev-parse", "HEAD"], "git rev-parse", &repo)
    }
}

/// Version recorded for plugins that declare none.
pub fn fallback_version(git: &dyn GitClient, marketplace_dir: &Path) -> String {
    match git.current_commit(marketplace_dir) {
        Ok(commit) if commit.len() >= 12 => commit[..12].to_string(),
        Ok(_) | Err(_) => "latest".to_string(),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Serves "remote" URLs from local directories.
    #[derive(Debug, Default)]
    pub struct FakeGit {
        pub commit: Option<String>,
        pub remotes: Vec<(String, std::path::PathBuf)>,
        pub pulls: RefCell<Vec<std::path::PathBuf>>,
    }

    impl GitClient for FakeGit {
        fn clone_shallow(&self, url: &str, dest: &Path) -> Result<()> {
            let (_, source) = self
                .remotes
                .iter()
                .find(|(u, _)| u == url)
                .ok_or_else(|| MarketError::Git(format!("git clone failed: {url} unreachable")))?;
            crate::plugin::installer::copy_dir(source, dest)
                .map_err(|err| MarketError::io("fake clone", err))
        }

        fn pull(&self, repo: &Path) -> Result<()> {
            self.pulls.borrow_mut().push(repo.to_path_buf());
            Ok(())
        }

        fn current_commit(&self, _repo: &Path) -> Result<String> {
            self.commit
                .clone()
                .ok_or_else(|| MarketError::Git("not a repository".into()))
        }
    }
}
