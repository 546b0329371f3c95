use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::mcp::codec;

/// `[mcp_servers.name]`, `[mcp_servers."name"]` or `[mcp_servers.'name']`.
static SERVER_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*\[[ \t]*mcp_servers[ \t]*\.[ \t]*(?:"([^"]+)"|'([^']+)'|([A-Za-z0-9_-]+))[ \t]*\]"#,
    )
    .expect("valid server header regex")
});

/// Who declares an existing server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Hand-written, outside any managed block.
    User,
    /// Inside another plugin's managed block.
    Plugin(String),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::User => f.write_str("managed by user"),
            Owner::Plugin(id) => write!(f, "managed by plugin {id}"),
        }
    }
}

/// Server names declared by section headers anywhere in `text`.
pub fn find_existing_names(text: &str) -> BTreeSet<String> {
    SERVER_HEADER_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Proposed names already declared outside `plugin_id`'s own block.
///
/// If that block is unterminated the whole file counts as foreign.
pub fn find_conflicts<'a>(
    text: &str,
    plugin_id: &str,
    proposed: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<String> {
    let foreign = codec::remove(text, plugin_id).unwrap_or_else(|_| text.to_string());
    let existing = find_existing_names(&foreign);

    proposed
        .into_iter()
        .filter(|name| existing.contains(*name))
        .map(str::to_string)
        .collect()
}

/// Attributes an existing server name to a plugin block or to the user.
pub fn owner_of(text: &str, name: &str) -> Owner {
    codec::managed_blocks(text)
        .into_iter()
        .find(|block| block.server_names().iter().any(|n| n == name))
        .map_or(Owner::User, |block| Owner::Plugin(block.plugin_id))
}
