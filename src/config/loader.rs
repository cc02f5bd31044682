//! Configuration loading from disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::schema::{OrchestratorConfig, ServerConfig};
use crate::config::validation::{join, validate_config, ValidationError};
use crate::error::OrchestratorError;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::Configuration(err.to_string())
    }
}

/// Load and validate configuration from a TOML or JSON file.
///
/// JSON files may use the `{"mcpServers": {...}}` layout, in which case every
/// entry becomes a subprocess server and everything else takes defaults.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let config = if is_json {
        parse_json(&content)?
    } else {
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
    };

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

fn parse_json(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if let Some(servers) = value.get("mcpServers") {
        let entries: BTreeMap<String, McpServerEntry> = serde_json::from_value(servers.clone())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = OrchestratorConfig::default();
        config.servers = entries
            .into_iter()
            .map(|(name, entry)| entry.into_server_config(name))
            .collect();
        return Ok(config);
    }

    serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// One entry of an `mcpServers` map.
#[derive(Debug, Deserialize)]
struct McpServerEntry {
    command: CommandLine,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    server_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Single(String),
    Split(Vec<String>),
}

impl McpServerEntry {
    fn into_server_config(self, name: String) -> ServerConfig {
        let (command, mut args) = match self.command {
            CommandLine::Single(command) => (command, Vec::new()),
            CommandLine::Split(mut parts) => {
                if parts.is_empty() {
                    (String::new(), Vec::new())
                } else {
                    let command = parts.remove(0);
                    (command, parts)
                }
            }
        };
        args.extend(self.args);

        let mut config = ServerConfig::subprocess(name, command, args);
        config.env = self.env;
        if let Some(server_type) = self.server_type {
            config.server_type = server_type;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Deployment;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_mcp_servers_json() {
        let path = write_temp(
            "mcp.json",
            r#"{"mcpServers": {
                "git": {"command": ["uvx", "mcp-server-git"], "args": ["--repo", "."], "env": {"A": "1"}},
                "time": {"command": "mcp-time"}
            }}"#,
        );
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap_or_default();

        assert_eq!(config.servers.len(), 2);
        let git = &config.servers[0];
        assert_eq!(git.id, "git");
        assert_eq!(git.env.get("A").map(String::as_str), Some("1"));
        match &git.deployment {
            Deployment::Subprocess(spec) => {
                assert_eq!(spec.command, "uvx");
                assert_eq!(spec.args, vec!["mcp-server-git", "--repo", "."]);
            }
            other => panic!("unexpected deployment {:?}", other),
        }
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let path = write_temp("bad.toml", "servers = [");
        let err = load_config(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap_or_default();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn semantic_errors_are_reported() {
        let path = write_temp(
            "pool.toml",
            "[pool]\nmin_connections = 9\nmax_connections = 2\n",
        );
        let err = load_config(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap_or_default();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        let as_core: OrchestratorError = err.into();
        assert!(matches!(as_core, OrchestratorError::Configuration(_)));
    }
}
