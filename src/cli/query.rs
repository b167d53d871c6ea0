use anyhow::{anyhow, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::Config;
use crate::control::{requests, ControlClient, Endpoint, RequestParams};

/// A file and an optional position
#[derive(Args)]
pub struct PositionArgs {
    /// FILE, FILE:LINE:COL (1-based) or FILE:#OFFSET (bytes)
    pub target: String,
}

#[derive(Args)]
pub struct RenameArgs {
    /// FILE:LINE:COL or FILE:#OFFSET of the symbol
    pub target: String,

    /// New name for the symbol
    pub new_name: String,
}

#[derive(Args)]
pub struct FileArgs {
    pub file: PathBuf,
}

/// Commands answered by a running daemon
pub enum QueryCommand {
    Definition(PositionArgs),
    Hover(PositionArgs),
    References(PositionArgs),
    Symbols(PositionArgs),
    Completion(PositionArgs),
    SignatureHelp(PositionArgs),
    Rename(RenameArgs),
    Format(FileArgs),
    Open(FileArgs),
    Close(FileArgs),
    Save(FileArgs),
    Focus(FileArgs),
    Servers,
}

impl QueryCommand {
    pub async fn execute(self, config: &Config) -> Result<()> {
        let (method, params) = self.request()?;
        debug!("Sending {} to {}", method, config.listen);

        let client = ControlClient::connect(&Endpoint::parse(&config.listen)).await?;
        let reply = client.call(method, &params).await?;

        print!("{}", reply.output);
        for location in &reply.locations {
            println!("{}", location);
        }
        Ok(())
    }

    fn request(self) -> Result<(&'static str, RequestParams)> {
        let request = match self {
            QueryCommand::Definition(args) => (requests::DEFINITION, parse_target(&args.target)?),
            QueryCommand::Hover(args) => (requests::HOVER, parse_target(&args.target)?),
            QueryCommand::References(args) => (requests::REFERENCES, parse_target(&args.target)?),
            QueryCommand::Symbols(args) => (requests::SYMBOLS, parse_target(&args.target)?),
            QueryCommand::Completion(args) => (requests::COMPLETION, parse_target(&args.target)?),
            QueryCommand::SignatureHelp(args) => {
                (requests::SIGNATURE_HELP, parse_target(&args.target)?)
            }
            QueryCommand::Rename(args) => {
                let mut params = parse_target(&args.target)?;
                params.new_name = Some(args.new_name);
                (requests::RENAME, params)
            }
            QueryCommand::Format(args) => (requests::FORMAT, file_params(&args.file)?),
            QueryCommand::Open(args) => (requests::DID_OPEN, file_params(&args.file)?),
            QueryCommand::Close(args) => (requests::DID_CLOSE, file_params(&args.file)?),
            QueryCommand::Save(args) => (requests::DID_SAVE, file_params(&args.file)?),
            QueryCommand::Focus(args) => (requests::FOCUS, file_params(&args.file)?),
            QueryCommand::Servers => (requests::SERVERS, RequestParams::default()),
        };
        Ok(request)
    }
}

fn file_params(file: &Path) -> Result<RequestParams> {
    let file = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()?.join(file)
    };
    Ok(RequestParams::for_file(file))
}

/// Parse `FILE`, `FILE:LINE:COL` or `FILE:#OFFSET`.
/// Lines and columns are 1-based on the command line.
pub fn parse_target(target: &str) -> Result<RequestParams> {
    if let Some((file, offset)) = target.rsplit_once(":#") {
        let offset = offset
            .parse()
            .map_err(|_| anyhow!("invalid offset in '{}'", target))?;
        let mut params = file_params(Path::new(file))?;
        params.offset = Some(offset);
        return Ok(params);
    }

    let mut parts = target.rsplitn(3, ':');
    if let (Some(col), Some(line), Some(file)) = (parts.next(), parts.next(), parts.next()) {
        if let (Ok(line), Ok(col)) = (line.parse::<u32>(), col.parse::<u32>()) {
            if line == 0 || col == 0 {
                return Err(anyhow!("lines and columns start at 1 in '{}'", target));
            }
            let mut params = file_params(Path::new(file))?;
            params.line = Some(line - 1);
            params.character = Some(col - 1);
            return Ok(params);
        }
    }

    file_params(Path::new(target))
}
