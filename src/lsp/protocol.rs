//! LSP protocol message handling

use crate::lsp::errors::{ProxyError, ProxyResult};
use crate::lsp::types::*;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest body accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// LSP protocol handler for message parsing and serialization
pub struct LspProtocol;

impl LspProtocol {
    /// Parse an LSP message from a header and content
    pub fn parse_message(header: &str, content: &[u8]) -> ProxyResult<LspMessage> {
        trace!("Parsing LSP message with header: {}", header.trim_end());

        let content_length = Self::extract_content_length(header)?;

        if content.len() != content_length {
            return Err(ProxyError::Transport(format!(
                "Content length mismatch: expected {}, got {}",
                content_length,
                content.len()
            )));
        }

        Self::parse_content(content)
    }

    /// Parse the JSON body of an LSP message
    pub fn parse_content(content: &[u8]) -> ProxyResult<LspMessage> {
        let json_value: Value = serde_json::from_slice(content)?;

        let method = json_value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = match json_value.get("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(serde_json::from_value::<RequestId>(id.clone())?),
        };
        let params = json_value.get("params").cloned();

        match (id, method) {
            (Some(id), Some(method)) => Ok(LspMessage::Request { id, method, params }),
            (Some(id), None) => {
                let error = json_value
                    .get("error")
                    .map(|e| serde_json::from_value::<LspError>(e.clone()))
                    .transpose()?;
                Ok(LspMessage::Response {
                    id,
                    result: json_value.get("result").cloned(),
                    error,
                })
            }
            (None, Some(method)) => Ok(LspMessage::Notification { method, params }),
            (None, None) => Err(ProxyError::Transport(
                "Invalid LSP message format".to_string(),
            )),
        }
    }

    /// Numeric id of a response body, read without decoding the rest.
    /// Lets a reply that fails to decode still fail the call it answers.
    pub fn response_id(content: &[u8]) -> Option<i64> {
        let json_value: Value = serde_json::from_slice(content).ok()?;
        if json_value.get("method").is_some() {
            return None;
        }
        json_value.get("id")?.as_i64()
    }

    /// Serialize an LSP message to the wire format
    pub fn serialize_message(message: &LspMessage) -> ProxyResult<Vec<u8>> {
        let json_content = match message {
            LspMessage::Request { id, method, params } => {
                let mut obj = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method
                });

                if let Some(params) = params {
                    obj["params"] = params.clone();
                }
                obj
            }
            LspMessage::Response { id, result, error } => {
                let mut obj = json!({
                    "jsonrpc": "2.0",
                    "id": id
                });

                if let Some(error) = error {
                    obj["error"] = serde_json::to_value(error)?;
                } else {
                    obj["result"] = result.clone().unwrap_or(Value::Null);
                }
                obj
            }
            LspMessage::Notification { method, params } => {
                let mut obj = json!({
                    "jsonrpc": "2.0",
                    "method": method
                });

                if let Some(params) = params {
                    obj["params"] = params.clone();
                }
                obj
            }
        };

        let content = serde_json::to_vec(&json_content)?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", content.len()).into_bytes();
        frame.extend_from_slice(&content);

        trace!("Serialized LSP message: {}", String::from_utf8_lossy(&frame));
        Ok(frame)
    }

    /// Extract content length from LSP header
    fn extract_content_length(header: &str) -> ProxyResult<usize> {
        for line in header.lines() {
            if let Some(length_str) = line.strip_prefix("Content-Length:") {
                return length_str.trim().parse::<usize>().map_err(|e| {
                    ProxyError::Transport(format!("Failed to parse content length: {}", e))
                });
            }
        }

        Err(ProxyError::Transport(
            "Content-Length header not found".to_string(),
        ))
    }

    /// Read one raw frame. Returns `None` on a clean end of stream.
    pub async fn read_frame<R: AsyncBufRead + Unpin>(
        reader: &mut R,
    ) -> ProxyResult<Option<(String, Vec<u8>)>> {
        let mut header = String::new();

        // Read header lines until we find an empty line
        loop {
            let mut line = String::new();
            let read = reader.read_line(&mut line).await?;

            if read == 0 {
                if header.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Transport(
                    "Unexpected end of stream inside header".to_string(),
                ));
            }

            if line.trim().is_empty() {
                if header.is_empty() {
                    // Tolerate stray blank lines between frames
                    continue;
                }
                break;
            }

            header.push_str(&line);
        }

        let content_length = Self::extract_content_length(&header)?;
        if content_length > MAX_FRAME_LEN {
            return Err(ProxyError::Transport(format!(
                "Frame of {} bytes exceeds the {} byte limit",
                content_length, MAX_FRAME_LEN
            )));
        }

        let mut content = Vec::new();
        content.try_reserve_exact(content_length).map_err(|e| {
            ProxyError::Transport(format!("Cannot buffer a {} byte frame: {}", content_length, e))
        })?;
        (&mut *reader)
            .take(content_length as u64)
            .read_to_end(&mut content)
            .await?;
        if content.len() != content_length {
            return Err(ProxyError::Transport(
                "Unexpected end of stream inside body".to_string(),
            ));
        }

        Ok(Some((header, content)))
    }

    /// Read a complete LSP message. Returns `None` on a clean end of stream.
    #[cfg(test)]
    pub async fn read_message<R: AsyncBufRead + Unpin>(
        reader: &mut R,
    ) -> ProxyResult<Option<LspMessage>> {
        match Self::read_frame(reader).await? {
            Some((header, content)) => Self::parse_message(&header, &content).map(Some),
            None => Ok(None),
        }
    }

    /// Write an LSP message to an async writer
    pub async fn write_message<W: AsyncWrite + Unpin>(
        writer: &mut W,
        message: &LspMessage,
    ) -> ProxyResult<()> {
        let serialized = Self::serialize_message(message)?;
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parameters of the `initialize` request
    pub fn initialize_params(root_uri: &str, workspace_name: &str) -> Value {
        json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "workspaceFolders": [
                { "uri": root_uri, "name": workspace_name }
            ],
            "capabilities": {
                "textDocument": {
                    "synchronization": {
                        "didSave": false
                    },
                    "hover": {
                        "contentFormat": ["plaintext", "markdown"]
                    },
                    "completion": {
                        "completionItem": {
                            "snippetSupport": false
                        }
                    },
                    "signatureHelp": {
                        "signatureInformation": {
                            "documentationFormat": ["plaintext", "markdown"]
                        }
                    },
                    "documentSymbol": {
                        "hierarchicalDocumentSymbolSupport": true
                    },
                    "publishDiagnostics": {
                        "relatedInformation": false
                    }
                },
                "workspace": {
                    "workspaceFolders": true,
                    "configuration": true,
                    "workspaceEdit": {
                        "documentChanges": true
                    }
                }
            },
            "clientInfo": {
                "name": "lsproxy",
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    /// Parameters of `textDocument/didOpen`
    pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
        json!({
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": version,
                "text": text
            }
        })
    }

    /// Parameters of a full-text `textDocument/didChange`
    pub fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
        json!({
            "textDocument": {
                "uri": uri,
                "version": version
            },
            "contentChanges": [
                { "text": text }
            ]
        })
    }

    /// Parameters of `textDocument/didClose`
    pub fn did_close_params(uri: &str) -> Value {
        json!({
            "textDocument": {
                "uri": uri
            }
        })
    }
}
