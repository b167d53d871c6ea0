use crate::lsp::Transport;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One language server binding as written in configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Regular expression matched against the file name
    pub pattern: String,

    /// Program to spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for `command`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// `host:port` of a server to dial instead of spawning one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ServerConfig {
    /// Parse `pattern:command args...`
    pub fn parse_server(spec: &str) -> Result<Self> {
        let (pattern, rest) = split_spec(spec)?;
        let mut words = rest.split_whitespace().map(str::to_string);
        let command = words
            .next()
            .ok_or_else(|| anyhow!("missing command in server spec '{}'", spec))?;

        Ok(Self {
            pattern,
            command: Some(command),
            args: words.collect(),
            address: None,
        })
    }

    /// Parse `pattern:host:port`
    pub fn parse_dial(spec: &str) -> Result<Self> {
        let (pattern, address) = split_spec(spec)?;
        if address.trim().is_empty() {
            return Err(anyhow!("missing address in dial spec '{}'", spec));
        }

        Ok(Self {
            pattern,
            address: Some(address.trim().to_string()),
            ..Self::default()
        })
    }

    pub fn transport(&self) -> Result<Transport> {
        match (&self.command, &self.address) {
            (Some(command), None) => Ok(Transport::Spawn {
                command: command.clone(),
                args: self.args.clone(),
            }),
            (None, Some(address)) => Ok(Transport::Dial {
                address: address.clone(),
            }),
            (Some(_), Some(_)) => Err(anyhow!(
                "server '{}' has both a command and an address",
                self.pattern
            )),
            (None, None) => Err(anyhow!(
                "server '{}' needs a command or an address",
                self.pattern
            )),
        }
    }
}

/// Split on the first ':' into pattern and remainder
fn split_spec(spec: &str) -> Result<(String, &str)> {
    let (pattern, rest) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("expected 'pattern:...' but got '{}'", spec))?;
    Ok((pattern.to_string(), rest))
}

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Workspace root sent to every language server
    pub root_dir: PathBuf,

    /// Control endpoint, `unix:<path>` or `host:port`
    pub listen: String,

    /// Log reserved notifications and server requests
    pub debug: bool,

    /// Format files when the editor saves them
    pub format_on_save: bool,

    /// Bindings in match order
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let socket_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);

        Self {
            root_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            listen: format!("unix:{}", socket_dir.join("lsproxy.sock").display()),
            debug: false,
            format_on_save: false,
            servers: Vec::new(),
        }
    }
}

/// Contents of a configuration file. Missing keys keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub root_dir: Option<PathBuf>,
    pub listen: Option<String>,
    pub debug: Option<bool>,
    pub format_on_save: Option<bool>,
    pub servers: Vec<ServerConfig>,
}

/// Values given on the command line
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub root_dir: Option<PathBuf>,
    pub listen: Option<String>,
    pub debug: bool,
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Initialize configuration from various sources
    pub async fn init() -> Result<Self> {
        debug!("Initializing configuration");

        let mut config = Self::default();

        // Load from environment variables
        config.load_from_env();

        // Try to load from configuration files
        if let Some(file) = Self::load_from_file(&Self::config_paths()).await? {
            config.merge_with(file);
        }

        Ok(config)
    }

    /// Configuration file candidates, first match wins:
    /// 1. ./.lsproxy.json
    /// 2. ./lsproxy.json
    /// 3. $XDG_CONFIG_HOME/lsproxy/lsproxy.json
    pub fn config_paths() -> Vec<PathBuf> {
        let mut config_paths = vec![
            PathBuf::from("./.lsproxy.json"),
            PathBuf::from("./lsproxy.json"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join("lsproxy").join("lsproxy.json"));
        }

        config_paths
    }

    /// Load configuration from environment variables
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(root_dir) = var("LSPROXY_ROOT_DIR") {
            self.root_dir = PathBuf::from(root_dir);
        }

        if let Some(listen) = var("LSPROXY_LISTEN") {
            self.listen = listen;
        }

        if let Some(debug) = var("LSPROXY_DEBUG") {
            self.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Read the first configuration file that exists
    pub async fn load_from_file(paths: &[PathBuf]) -> Result<Option<ConfigFile>> {
        for path in paths {
            if path.exists() {
                debug!("Loading configuration from: {}", path.display());
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let file = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                return Ok(Some(file));
            }
        }

        Ok(None)
    }

    /// Merge a configuration file into this one
    pub fn merge_with(&mut self, other: ConfigFile) {
        if let Some(root_dir) = other.root_dir {
            self.root_dir = root_dir;
        }
        if let Some(listen) = other.listen {
            self.listen = listen;
        }
        if let Some(debug) = other.debug {
            self.debug = debug;
        }
        if let Some(format_on_save) = other.format_on_save {
            self.format_on_save = format_on_save;
        }
        self.servers.extend(other.servers);
    }

    /// Apply command line values. Their bindings are matched before any
    /// configured ones.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(root_dir) = overrides.root_dir {
            self.root_dir = root_dir;
        }
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if overrides.debug {
            self.debug = true;
        }
        if !overrides.servers.is_empty() {
            let configured = std::mem::take(&mut self.servers);
            self.servers = overrides.servers;
            self.servers.extend(configured);
        }
    }

    /// Expand `~` and environment variables in paths and commands
    pub fn expand(&mut self) -> Result<()> {
        self.root_dir = PathBuf::from(expand(&self.root_dir.to_string_lossy())?);
        self.listen = expand(&self.listen)?;

        for server in &mut self.servers {
            if let Some(command) = &server.command {
                server.command = Some(expand(command)?);
            }
            for arg in &mut server.args {
                *arg = expand(arg)?;
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(anyhow!("listen address is required"));
        }

        for server in &self.servers {
            if server.pattern.is_empty() {
                return Err(anyhow!("server pattern must not be empty"));
            }
            server.transport()?;
        }

        Ok(())
    }

    /// Root directory as an absolute path
    pub fn absolute_root(&self) -> Result<PathBuf> {
        absolute(&self.root_dir)
    }
}

fn expand(value: &str) -> Result<String> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| anyhow!("failed to expand '{}': {}", value, e))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
