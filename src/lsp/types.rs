//! LSP types and data structures

use crate::lsp::errors::{ProxyError, ProxyResult};
use lsp_types::{Location, Uri};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// How to reach a language server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Spawn a process and speak the protocol over its standard streams
    Spawn { command: String, args: Vec<String> },
    /// Dial a network address
    Dial { address: String },
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Spawn { command, args } if args.is_empty() => write!(f, "{}", command),
            Transport::Spawn { command, args } => write!(f, "{} {}", command, args.join(" ")),
            Transport::Dial { address } => write!(f, "dial {}", address),
        }
    }
}

/// Association between a filename pattern and a server transport
#[derive(Debug, Clone)]
pub struct ServerBinding {
    pub pattern: Regex,
    pub transport: Transport,
}

impl ServerBinding {
    pub fn new(pattern: &str, transport: Transport) -> ProxyResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ProxyError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self { pattern, transport })
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.pattern.is_match(filename)
    }
}

/// JSON-RPC request id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// LSP message types
#[derive(Debug, Clone, PartialEq)]
pub enum LspMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<serde_json::Value>,
    },
    Response {
        id: RequestId,
        result: Option<serde_json::Value>,
        error: Option<LspError>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// LSP error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LspError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const REQUEST_FAILED: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Common LSP methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
    pub const TEXT_DOCUMENT_DID_OPEN: &str = "textDocument/didOpen";
    pub const TEXT_DOCUMENT_DID_CHANGE: &str = "textDocument/didChange";
    pub const TEXT_DOCUMENT_DID_CLOSE: &str = "textDocument/didClose";
    pub const TEXT_DOCUMENT_HOVER: &str = "textDocument/hover";
    pub const TEXT_DOCUMENT_COMPLETION: &str = "textDocument/completion";
    pub const TEXT_DOCUMENT_DEFINITION: &str = "textDocument/definition";
    pub const TEXT_DOCUMENT_REFERENCES: &str = "textDocument/references";
    pub const TEXT_DOCUMENT_DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";
    pub const TEXT_DOCUMENT_SIGNATURE_HELP: &str = "textDocument/signatureHelp";
    pub const TEXT_DOCUMENT_RENAME: &str = "textDocument/rename";
    pub const TEXT_DOCUMENT_FORMATTING: &str = "textDocument/formatting";
    pub const TEXT_DOCUMENT_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
    pub const WINDOW_SHOW_MESSAGE: &str = "window/showMessage";
    pub const WINDOW_LOG_MESSAGE: &str = "window/logMessage";
    pub const WORKSPACE_CONFIGURATION: &str = "workspace/configuration";

    /// Prefix of implementation-dependent notifications such as `$/progress`
    pub const RESERVED_PREFIX: &str = "$/";
}

/// Map a file extension to an LSP language identifier.
///
/// Unknown extensions are passed through unchanged.
pub fn language_id(path: &Path) -> String {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let language_id = match extension {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "c" | "h" => "c",
        "cs" => "csharp",
        "rb" => "ruby",
        "sh" | "bash" => "shellscript",
        "md" => "markdown",
        "yml" => "yaml",
        other => other,
    };

    language_id.to_string()
}

/// Convert file path to LSP URI
pub fn path_to_uri(path: &Path) -> ProxyResult<Uri> {
    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let url = Url::from_file_path(&absolute_path).map_err(|_| {
        ProxyError::Editor(format!("invalid file path: {}", absolute_path.display()))
    })?;
    url.as_str()
        .parse::<Uri>()
        .map_err(|e| ProxyError::Editor(format!("invalid file URI {}: {:?}", url, e)))
}

/// Convert LSP URI to a file path. Anything that is not a file URI is
/// returned verbatim.
pub fn uri_to_path(uri: &Uri) -> PathBuf {
    Url::parse(uri.as_str())
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(uri.as_str()))
}

/// Render a location as `path:startLine:startCol-endLine:endCol`, 1-based.
pub fn location_link(location: &Location) -> String {
    let range = &location.range;
    format!(
        "{}:{}:{}-{}:{}",
        uri_to_path(&location.uri).display(),
        range.start.line + 1,
        range.start.character + 1,
        range.end.line + 1,
        range.end.character + 1
    )
}
