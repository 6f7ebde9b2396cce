//! Configuration management for deerstream.
//!
//! Loads configuration from ${DEERSTREAM_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default base URL of the chat service.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/";

/// Environment variable overriding the service URL.
pub const API_URL_ENV: &str = "DEERSTREAM_API_URL";

/// Writing style requested for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStyle {
    #[default]
    Academic,
    PopularScience,
    News,
    SocialMedia,
}

/// Per-turn research settings sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub auto_accepted_plan: bool,
    pub enable_background_investigation: bool,
    pub max_plan_iterations: u32,
    pub max_step_num: u32,
    pub max_search_results: u32,
    pub report_style: ReportStyle,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            auto_accepted_plan: false,
            enable_background_investigation: false,
            max_plan_iterations: 1,
            max_step_num: 3,
            max_search_results: 3,
            report_style: ReportStyle::Academic,
        }
    }
}

/// How an MCP server is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Sse {
        url: String,
    },
}

/// An MCP server as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Tool names exposed to the agents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
}

/// MCP section of the turn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpSettings {
    pub servers: BTreeMap<String, McpServerSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpServerSettings {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransport,
    pub env: BTreeMap<String, String>,
    pub enabled_tools: Vec<String>,
    pub add_to_agents: Vec<String>,
}

impl McpConfig {
    /// Request settings for the enabled servers, or `None` when none is enabled.
    pub fn settings(&self) -> Option<McpSettings> {
        let servers: BTreeMap<_, _> = self
            .servers
            .iter()
            .filter(|server| server.enabled)
            .map(|server| {
                (
                    server.name.clone(),
                    McpServerSettings {
                        name: server.name.clone(),
                        transport: server.transport.clone(),
                        env: server.env.clone(),
                        enabled_tools: server.tools.clone(),
                        add_to_agents: vec!["researcher".to_string()],
                    },
                )
            })
            .collect();

        if servers.is_empty() {
            None
        } else {
            Some(McpSettings { servers })
        }
    }
}

/// Recorded-log playback settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// `http(s)` URL or local directory holding `mock/` and `replay/` logs
    pub base: String,
    pub static_website_only: bool,
    /// Query string that selects a log (`?replay=<id>`, `?mock`, `?mock=<name>`)
    pub location_query: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            base: "http://localhost:3000/".to_string(),
            static_website_only: false,
            location_query: String::new(),
        }
    }
}

impl ReplayConfig {
    /// Whether turns should be served from recorded logs.
    pub fn enabled(&self) -> bool {
        self.static_website_only
            || self.location_query.contains("mock")
            || self.location_query.contains("replay=")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub chat: ChatSettings,
    pub replay: ReplayConfig,
    pub mcp: McpConfig,
}

pub mod paths {
    //! Path resolution for deerstream configuration.
    //!
    //! DEERSTREAM_HOME resolution order:
    //! 1. DEERSTREAM_HOME environment variable (if set)
    //! 2. ~/.config/deerstream (default)

    use std::path::PathBuf;

    /// Returns the deerstream home directory.
    pub fn deerstream_home() -> PathBuf {
        if let Ok(home) = std::env::var("DEERSTREAM_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".deerstream"),
            |h| h.join(".config").join("deerstream"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        deerstream_home().join("config.toml")
    }
}

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

impl Config {
    /// Loads configuration from the default path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    ///
    /// # Errors
    /// Returns an error if the file exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Service base URL with precedence: env > config > default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is malformed.
    pub fn effective_api_url(&self) -> Result<String> {
        resolve_api_url(std::env::var(API_URL_ENV).ok().as_deref(), self.api_url.as_deref())
    }
}

/// Resolves the service base URL from an env value and a config value.
///
/// # Errors
/// Returns an error if the chosen URL is malformed.
pub fn resolve_api_url(env_url: Option<&str>, config_url: Option<&str>) -> Result<String> {
    for candidate in [env_url, config_url].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            url::Url::parse(trimmed)
                .with_context(|| format!("Invalid service URL: {trimmed}"))?;
            return Ok(trimmed.to_string());
        }
    }
    Ok(DEFAULT_API_URL.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.chat.max_plan_iterations, 1);
        assert_eq!(config.chat.max_step_num, 3);
        assert_eq!(config.chat.max_search_results, 3);
        assert_eq!(config.chat.report_style, ReportStyle::Academic);
        assert!(!config.replay.enabled());
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[chat]\nmax_step_num = 5\nreport_style = \"popular_science\"\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.chat.max_step_num, 5);
        assert_eq!(config.chat.report_style, ReportStyle::PopularScience);
        assert_eq!(config.chat.max_search_results, 3);
        assert_eq!(config.api_url, None);
    }

    #[test]
    fn test_load_invalid_toml_fails_with_path() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "[chat\n").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(format!("{err}").contains("Failed to parse config"));
    }

    #[test]
    fn test_init_writes_loadable_template() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();

        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("# api_url ="));
        assert_eq!(Config::load_from(&config_path).unwrap(), Config::default());
    }

    #[test]
    fn test_init_fails_if_exists() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "").unwrap();

        assert!(Config::init(&config_path).is_err());
    }

    #[test]
    fn test_api_url_precedence() {
        assert_eq!(resolve_api_url(None, None).unwrap(), DEFAULT_API_URL);
        assert_eq!(
            resolve_api_url(None, Some("http://cfg:1/api/")).unwrap(),
            "http://cfg:1/api/"
        );
        assert_eq!(
            resolve_api_url(Some(" http://env:2/ "), Some("http://cfg:1/api/")).unwrap(),
            "http://env:2/"
        );
        assert_eq!(
            resolve_api_url(Some(""), Some("http://cfg:1/api/")).unwrap(),
            "http://cfg:1/api/"
        );
        assert!(resolve_api_url(None, Some("not a url")).is_err());
    }

    #[test]
    fn test_replay_enabled_by_query_or_flag() {
        let mut replay = ReplayConfig::default();
        assert!(!replay.enabled());

        replay.location_query = "?replay=abc".to_string();
        assert!(replay.enabled());

        replay.location_query = "?mock".to_string();
        assert!(replay.enabled());

        replay.location_query = "?theme=dark".to_string();
        assert!(!replay.enabled());

        replay.static_website_only = true;
        assert!(replay.enabled());
    }

    #[test]
    fn test_mcp_settings_only_include_enabled_servers() {
        let toml = r#"
[[mcp.servers]]
name = "github"
transport = "stdio"
command = "uvx"
args = ["mcp-github"]
tools = ["search_repositories"]
env = { TOKEN = "x" }

[[mcp.servers]]
name = "docs"
transport = "sse"
url = "http://localhost:9000/sse"
tools = ["lookup"]

[[mcp.servers]]
name = "off"
transport = "sse"
url = "http://localhost:9001/sse"
enabled = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let settings = config.mcp.settings().unwrap();

        assert_eq!(
            serde_json::to_value(&settings).unwrap(),
            json!({
                "servers": {
                    "docs": {
                        "name": "docs",
                        "transport": "sse",
                        "url": "http://localhost:9000/sse",
                        "env": {},
                        "enabled_tools": ["lookup"],
                        "add_to_agents": ["researcher"],
                    },
                    "github": {
                        "name": "github",
                        "transport": "stdio",
                        "command": "uvx",
                        "args": ["mcp-github"],
                        "env": {"TOKEN": "x"},
                        "enabled_tools": ["search_repositories"],
                        "add_to_agents": ["researcher"],
                    },
                }
            })
        );
    }

    #[test]
    fn test_mcp_settings_absent_without_enabled_servers() {
        assert_eq!(McpConfig::default().settings(), None);
    }
}
