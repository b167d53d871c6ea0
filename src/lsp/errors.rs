//! Error types for the proxy core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no language server configured for {0}")]
    NoServerForFile(String),

    #[error("LSP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("connection to language server '{0}' closed")]
    ConnectionClosed(String),

    #[error("failed to apply edits: {0}")]
    EditApply(String),

    #[error("malformed {method} notification: {source}")]
    MalformedNotification {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("editor error: {0}")]
    Editor(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
