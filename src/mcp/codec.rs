//! Managed sections inside Codex's `config.toml`.
//!
//! Each plugin owns at most one block delimited by sentinel comment lines:
//!
//! ```text
//! # [codex-market:start] plugin=formatter@acme marketplace=acme
//! [mcp_servers."fmt-server"]
//! ...
//! # [codex-market:end] plugin=formatter@acme
//! ```
//!
//! The rest of the file is never parsed or reformatted. The sentinel lines
//! are matched by external tooling and must stay byte-stable.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::mcp::conflict;
use crate::mcp::server::{EnvValue, ServerDeclaration, Transport};

pub const MARKER_START: &str = "# [codex-market:start]";
pub const MARKER_END: &str = "# [codex-market:end]";

static BARE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid bare key regex"));

/// A start marker without its matching end marker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("start marker for {plugin_id} has no matching end marker")]
pub struct UnterminatedBlock {
    pub plugin_id: String,
}

/// An env binding whose key differs from the shell variable it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvMismatch {
    pub server: String,
    pub key: String,
    pub var: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub text: String,
    pub mismatches: Vec<EnvMismatch>,
}

/// A decoded block: its owner and the exact text between the markers (inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBlock {
    pub plugin_id: String,
    pub marketplace: Option<String>,
    /// Zero-based line of the start marker.
    pub start_line: usize,
    /// Zero-based line of the end marker.
    pub end_line: usize,
    pub text: String,
}

impl ManagedBlock {
    pub fn server_names(&self) -> Vec<String> {
        conflict::find_existing_names(&self.text)
            .into_iter()
            .collect()
    }
}

pub fn start_marker(plugin_id: &str, marketplace: &str) -> String {
    format!("{MARKER_START} plugin={plugin_id} marketplace={marketplace}")
}

pub fn end_marker(plugin_id: &str) -> String {
    format!("{MARKER_END} plugin={plugin_id}")
}

/// Renders the block for `plugin_id`. Servers are emitted in name order.
pub fn encode(plugin_id: &str, marketplace: &str, servers: &[ServerDeclaration]) -> Encoded {
    let mut sorted: Vec<&ServerDeclaration> = servers.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    let mut mismatches = Vec::new();

    out.push_str(&start_marker(plugin_id, marketplace));
    out.push('\n');

    for server in sorted {
        write_server(&mut out, server, &mut mismatches);
        out.push('\n');
    }

    out.push_str(&end_marker(plugin_id));
    out.push('\n');

    Encoded {
        text: out,
        mismatches,
    }
}

fn write_server(out: &mut String, server: &ServerDeclaration, mismatches: &mut Vec<EnvMismatch>) {
    let header = format!("mcp_servers.{}", quote(&server.name));
    out.push_str(&format!("[{header}]\n"));

    if let Some(kind) = &server.kind {
        out.push_str(&format!("type = {}\n", quote(kind)));
    }

    match &server.transport {
        Transport::Stdio { command, args } => {
            out.push_str(&format!("command = {}\n", quote(command)));
            write_array(out, "args", args.iter().map(String::as_str));
        }
        Transport::Http { url } => {
            out.push_str(&format!("url = {}\n", quote(url)));
        }
    }

    for (key, value) in &server.env {
        if let EnvValue::Forwarded(var) = value {
            if key != var {
                mismatches.push(EnvMismatch {
                    server: server.name.clone(),
                    key: key.clone(),
                    var: var.clone(),
                });
            }
        }
    }

    write_array(out, "env_vars", server.forwarded_keys().into_iter());

    let literal = server.literal_env();
    if !literal.is_empty() {
        out.push_str(&format!("\n[{header}.env]\n"));
        for (key, value) in literal {
            out.push_str(&format!("{} = {}\n", toml_key(key), quote(value)));
        }
    }
}

fn write_array<'a>(out: &mut String, key: &str, items: impl Iterator<Item = &'a str>) {
    let items: Vec<&str> = items.collect();
    if items.is_empty() {
        return;
    }

    out.push_str(&format!("{key} = [\n"));
    for item in items {
        out.push_str(&format!("  {},\n", quote(item)));
    }
    out.push_str("]\n");
}

fn quote(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_key(key: &str) -> String {
    if BARE_KEY_RE.is_match(key) {
        key.to_string()
    } else {
        quote(key)
    }
}

/// Locates the block owned by `plugin_id`, if any.
pub fn decode(text: &str, plugin_id: &str) -> Result<Option<ManagedBlock>, UnterminatedBlock> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    match find_block(&lines, plugin_id, 0) {
        None => Ok(None),
        Some(Err(err)) => Err(err),
        Some(Ok((start, end))) => Ok(Some(block_at(&lines, start, end))),
    }
}

/// Every well-formed block in the file, in file order.
pub fn managed_blocks(text: &str) -> Vec<ManagedBlock> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut blocks = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let Some((plugin_id, _)) = parse_start(lines[idx]) else {
            idx += 1;
            continue;
        };

        let end = lines
            .iter()
            .enumerate()
            .skip(idx + 1)
            .find(|(_, line)| parse_end(line) == Some(plugin_id))
            .map(|(j, _)| j);

        match end {
            Some(end) => {
                blocks.push(block_at(&lines, idx, end));
                idx = end + 1;
            }
            None => idx += 1,
        }
    }

    blocks
}

/// Drops the block owned by `plugin_id` plus the blank line before it.
///
/// A missing block is a no-op. An unterminated one leaves the text untouched.
pub fn remove(text: &str, plugin_id: &str) -> Result<String, UnterminatedBlock> {
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut removed_any = false;

    while let Some(found) = find_block(&lines, plugin_id, 0) {
        let (start, end) = found?;
        let from = if start > 0 && lines[start - 1].trim().is_empty() {
            start - 1
        } else {
            start
        };
        lines.drain(from..=end);
        removed_any = true;
    }

    if !removed_any {
        return Ok(text.to_string());
    }

    tracing::debug!("removed managed block for {plugin_id}");
    Ok(lines.concat())
}

/// Remove then append, so re-encoding identical inputs is byte-stable.
pub fn replace(text: &str, plugin_id: &str, block: &str) -> Result<String, UnterminatedBlock> {
    let rest = remove(text, plugin_id)?;
    let base = rest.trim_end_matches(['\n', '\r']);

    if base.is_empty() {
        return Ok(block.to_string());
    }

    Ok(format!("{base}\n\n{block}"))
}

fn block_at(lines: &[&str], start: usize, end: usize) -> ManagedBlock {
    let (plugin_id, marketplace) = parse_start(lines[start]).unwrap_or_default();
    ManagedBlock {
        plugin_id: plugin_id.to_string(),
        marketplace: marketplace.map(str::to_string),
        start_line: start,
        end_line: end,
        text: lines[start..=end].concat(),
    }
}

fn find_block(
    lines: &[&str],
    plugin_id: &str,
    from: usize,
) -> Option<Result<(usize, usize), UnterminatedBlock>> {
    let start = lines
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, line)| parse_start(line).is_some_and(|(id, _)| id == plugin_id))
        .map(|(i, _)| i)?;

    let end = lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| parse_end(line) == Some(plugin_id))
        .map(|(j, _)| j);

    Some(end.map(|end| (start, end)).ok_or_else(|| UnterminatedBlock {
        plugin_id: plugin_id.to_string(),
    }))
}

fn parse_start(line: &str) -> Option<(&str, Option<&str>)> {
    let rest = line.trim_end().strip_prefix(MARKER_START)?;
    let mut plugin = None;
    let mut marketplace = None;

    for token in rest.split_whitespace() {
        if let Some(value) = token.strip_prefix("plugin=") {
            plugin = Some(value);
        } else if let Some(value) = token.strip_prefix("marketplace=") {
            marketplace = Some(value);
        }
    }

    plugin.map(|p| (p, marketplace))
}

fn parse_end(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix(MARKER_END)?;
    rest.split_whitespace()
        .find_map(|token| token.strip_prefix("plugin="))
}
