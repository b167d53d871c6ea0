use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use super::query::{FileArgs, PositionArgs, QueryCommand, RenameArgs};
use super::serve::ServeCommand;
use crate::config::{Config, Overrides, ServerConfig};

/// lsproxy - route editor requests to language servers
#[derive(Parser)]
#[command(
    name = "lsproxy",
    version,
    about = "Route editor requests to Language Server Protocol servers",
    long_about = r#"lsproxy runs a daemon that owns one connection per configured language
server and answers editor requests over a local socket.

Examples:
  lsproxy --server '\.go$:gopls' serve     # Start the daemon
  lsproxy def main.go:12:5                 # Jump to a definition
  lsproxy refs main.go:#240                # List references at a byte offset
  lsproxy rn main.go:12:5 newName          # Rename a symbol
  lsproxy fmt main.go                      # Format a file"#
)]
pub struct Cli {
    /// Workspace root sent to language servers
    #[arg(long = "rootdir", global = true)]
    pub root_dir: Option<PathBuf>,

    /// Control endpoint, unix:<path> or host:port
    #[arg(long = "listen", global = true)]
    pub listen: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Spawn a server for matching files, as 'pattern:command args'
    #[arg(long = "server", value_name = "PATTERN:COMMAND", global = true)]
    pub servers: Vec<String>,

    /// Dial a server for matching files, as 'pattern:host:port'
    #[arg(long = "dial", value_name = "PATTERN:ADDRESS", global = true)]
    pub dials: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy daemon
    Serve(ServeCommand),

    /// Jump to the definition at a position
    #[command(name = "def")]
    Definition(PositionArgs),

    /// Show hover information at a position
    #[command(name = "hov")]
    Hover(PositionArgs),

    /// List references to the symbol at a position
    #[command(name = "refs")]
    References(PositionArgs),

    /// List the symbols of a file
    #[command(name = "syms")]
    Symbols(PositionArgs),

    /// Complete at a position
    #[command(name = "comp")]
    Completion(PositionArgs),

    /// Show signature help at a position
    #[command(name = "sig")]
    SignatureHelp(PositionArgs),

    /// Rename the symbol at a position
    #[command(name = "rn")]
    Rename(RenameArgs),

    /// Format a file
    #[command(name = "fmt")]
    Format(FileArgs),

    /// Report a file as opened
    Open(FileArgs),

    /// Report a file as closed
    Close(FileArgs),

    /// Report a file as saved
    Save(FileArgs),

    /// Report a file as focused
    Focus(FileArgs),

    /// List configured servers
    Servers,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        // Initialize configuration
        let mut config = Config::init().await?;
        config.apply(self.overrides()?);
        config.expand()?;
        debug!("Configuration initialized");

        let query = match self.command {
            Commands::Serve(serve) => return serve.execute(config).await,
            Commands::Definition(args) => QueryCommand::Definition(args),
            Commands::Hover(args) => QueryCommand::Hover(args),
            Commands::References(args) => QueryCommand::References(args),
            Commands::Symbols(args) => QueryCommand::Symbols(args),
            Commands::Completion(args) => QueryCommand::Completion(args),
            Commands::SignatureHelp(args) => QueryCommand::SignatureHelp(args),
            Commands::Rename(args) => QueryCommand::Rename(args),
            Commands::Format(args) => QueryCommand::Format(args),
            Commands::Open(args) => QueryCommand::Open(args),
            Commands::Close(args) => QueryCommand::Close(args),
            Commands::Save(args) => QueryCommand::Save(args),
            Commands::Focus(args) => QueryCommand::Focus(args),
            Commands::Servers => QueryCommand::Servers,
        };

        query.execute(&config).await
    }

    fn overrides(&self) -> Result<Overrides> {
        let mut servers = Vec::new();
        for spec in &self.servers {
            servers.push(ServerConfig::parse_server(spec)?);
        }
        for spec in &self.dials {
            servers.push(ServerConfig::parse_dial(spec)?);
        }

        Ok(Overrides {
            root_dir: self.root_dir.clone(),
            listen: self.listen.clone(),
            debug: self.debug,
            servers,
        })
    }
}
