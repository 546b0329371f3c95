use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

/// `$NAME` or `${NAME}`.
static ENV_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))$")
        .expect("valid env reference regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Stdio { command: String, args: Vec<String> },
    Http { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Bare reference to a caller shell variable.
    Forwarded(String),
    Literal(String),
}

impl EnvValue {
    pub fn classify(value: &str) -> Self {
        match ENV_REF_RE.captures(value) {
            Some(caps) => {
                let var = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                EnvValue::Forwarded(var.to_string())
            }
            None => EnvValue::Literal(value.to_string()),
        }
    }
}

/// One MCP server a plugin asks to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDeclaration {
    pub name: String,
    pub kind: Option<String>,
    pub transport: Transport,
    /// Not representable in Codex config; dropped on encode.
    pub cwd: Option<String>,
    pub env: BTreeMap<String, EnvValue>,
}

impl ServerDeclaration {
    #[cfg(test)]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: None,
            transport: Transport::Stdio {
                command: command.into(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), EnvValue::classify(value));
        self
    }

    /// Keys whose values forward a shell variable, sorted.
    pub fn forwarded_keys(&self) -> Vec<&str> {
        self.env
            .iter()
            .filter(|(_, v)| matches!(v, EnvValue::Forwarded(_)))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn literal_env(&self) -> Vec<(&str, &str)> {
        self.env
            .iter()
            .filter_map(|(k, v)| match v {
                EnvValue::Literal(value) => Some((k.as_str(), value.as_str())),
                EnvValue::Forwarded(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl RawServer {
    fn into_declaration(self, name: String) -> Option<ServerDeclaration> {
        let transport = match (self.command, self.url) {
            (Some(command), _) if !command.is_empty() => Transport::Stdio {
                command,
                args: self.args,
            },
            (_, Some(url)) if !url.is_empty() => Transport::Http { url },
            _ => return None,
        };

        Some(ServerDeclaration {
            name,
            kind: self.kind.filter(|k| !k.is_empty()),
            transport,
            cwd: self.cwd.filter(|c| !c.is_empty()),
            env: self
                .env
                .into_iter()
                .map(|(k, v)| {
                    let value = EnvValue::classify(&v);
                    (k, value)
                })
                .collect(),
        })
    }
}

/// Declarations read from one `.mcp.json`.
#[derive(Debug, Default)]
pub struct ServerFile {
    pub servers: Vec<ServerDeclaration>,
    /// `(name, reason)` for entries whose fields have the wrong types.
    pub rejected: Vec<(String, String)>,
}

/// Parses a plugin's `.mcp.json`, wrapped (`{"mcpServers": {...}}`) or direct.
///
/// Entries declaring neither `command` nor `url` are skipped, as are non-object
/// values in the direct form. A malformed entry is rejected on its own.
pub fn parse_server_file(raw: &str) -> Result<ServerFile, serde_json::Error> {
    let root: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;

    let entries = match root.get("mcpServers") {
        Some(serde_json::Value::Object(wrapped)) if !wrapped.is_empty() => wrapped.clone(),
        _ => root,
    };

    let mut file = ServerFile::default();
    for (name, value) in entries {
        if name == "mcpServers" || !value.is_object() {
            continue;
        }
        match serde_json::from_value::<RawServer>(value) {
            Ok(raw) => file.servers.extend(raw.into_declaration(name)),
            Err(err) => file.rejected.push((name, err.to_string())),
        }
    }

    file.servers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(file)
}
