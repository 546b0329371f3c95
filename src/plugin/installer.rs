//! Copies skill directories and command prompts into the host's directories.
//!
//! Collisions at the destination never overwrite: the copied item gets a random
//! `-xxxxxxxx` suffix instead. Failures are per item. A failed copy removes only
//! that item's partial destination, and items already copied stay in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use rand::Rng;

use crate::error::{MarketError, Result};
use crate::plugin::ledger::ArtifactEntry;

/// A skill directory is recognised by this file.
pub const SKILL_MARKER: &str = "SKILL.md";
pub const COMMAND_EXTENSION: &str = "md";
const SUFFIX_LEN: usize = 8;

/// One installed item plus the name it had in the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedArtifact {
    pub entry: ArtifactEntry,
    pub original_name: String,
}

impl CopiedArtifact {
    pub fn renamed(&self) -> bool {
        self.entry.name != self.original_name
    }
}

/// Copies every `<src>/<name>/` holding a `SKILL.md` into `dest`.
pub fn install_skills(src: &Path, dest: &Path) -> Result<Vec<CopiedArtifact>> {
    let mut copied = Vec::new();
    for (name, source) in sorted_entries(src)? {
        if !source.is_dir() || !source.join(SKILL_MARKER).is_file() {
            continue;
        }

        let (target, actual) = unique_dir_path(dest, &name);
        if let Err(err) = copy_dir(&source, &target) {
            let _ = fs::remove_dir_all(&target);
            return Err(MarketError::io(format!("failed to copy skill '{name}'"), err));
        }

        tracing::info!("skill {name} -> {}", target.display());
        copied.push(CopiedArtifact {
            entry: ArtifactEntry {
                name: actual,
                path: target,
            },
            original_name: name,
        });
    }
    Ok(copied)
}

/// Copies every `<src>/*.md` file into `dest`. Command names drop the extension.
pub fn install_commands(src: &Path, dest: &Path) -> Result<Vec<CopiedArtifact>> {
    let entries = sorted_entries(src)?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(dest)
        .map_err(|err| MarketError::io(format!("failed to create {}", dest.display()), err))?;

    let mut copied = Vec::new();
    for (file_name, source) in entries {
        let is_prompt = Path::new(&file_name)
            .extension()
            .is_some_and(|ext| ext == COMMAND_EXTENSION);
        if source.is_dir() || !is_prompt {
            continue;
        }

        let (target, actual) = unique_file_path(dest, &file_name);
        if let Err(err) = fs::copy(&source, &target) {
            let _ = fs::remove_file(&target);
            return Err(MarketError::io(
                format!("failed to copy command '{file_name}'"),
                err,
            ));
        }

        tracing::info!("command {file_name} -> {}", target.display());
        copied.push(CopiedArtifact {
            entry: ArtifactEntry {
                name: strip_extension(&actual),
                path: target,
            },
            original_name: strip_extension(&file_name),
        });
    }
    Ok(copied)
}

pub fn remove_skill(entry: &ArtifactEntry) -> io::Result<()> {
    ignore_missing(fs::remove_dir_all(&entry.path))
}

pub fn remove_command(entry: &ArtifactEntry) -> io::Result<()> {
    ignore_missing(fs::remove_file(&entry.path))
}

/// Replaces `dest` with a fresh copy of the plugin tree.
pub fn cache_copy(src: &Path, dest: &Path) -> Result<()> {
    let _ = fs::remove_dir_all(dest);
    if let Err(err) = copy_dir(src, dest) {
        let _ = fs::remove_dir_all(dest);
        return Err(MarketError::io(
            format!("failed to cache plugin files in {}", dest.display()),
            err,
        ));
    }
    tracing::debug!("cached {} -> {}", src.display(), dest.display());
    Ok(())
}

/// Recursive copy of `src` into `dest`, hidden files included, `.git` skipped.
pub fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;

    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .hidden(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(relative);
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Eight lowercase hex characters from the thread-local CSPRNG.
pub fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_LEN / 2];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unique_dir_path(dir: &Path, name: &str) -> (PathBuf, String) {
    unique_path(dir, name, |suffix| format!("{name}-{suffix}"))
}

fn unique_file_path(dir: &Path, file_name: &str) -> (PathBuf, String) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    unique_path(dir, file_name, |suffix| format!("{stem}-{suffix}{ext}"))
}

fn unique_path(dir: &Path, name: &str, with_suffix: impl Fn(&str) -> String) -> (PathBuf, String) {
    let mut candidate = name.to_string();
    while fs::symlink_metadata(dir.join(&candidate)).is_ok() {
        candidate = with_suffix(&random_suffix());
    }
    (dir.join(&candidate), candidate)
}

/// Immediate children of `dir`, sorted by name; a missing dir has none.
fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(MarketError::io(format!("failed to read {}", dir.display()), err));
        }
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry =
            entry.map_err(|err| MarketError::io(format!("failed to read {}", dir.display()), err))?;
        entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    entries.sort();
    Ok(entries)
}

fn strip_extension(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map_or_else(|| file_name.to_string(), |s| s.to_string_lossy().into_owned())
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
