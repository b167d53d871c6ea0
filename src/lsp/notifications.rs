//! Routing of messages the language servers send on their own

use crate::editor::DisplaySink;
use crate::lsp::errors::{ProxyError, ProxyResult};
use crate::lsp::types::{methods, uri_to_path};
use lsp_types::{
    Diagnostic, DiagnosticSeverity, LogMessageParams, MessageType, PublishDiagnosticsParams,
    ShowMessageParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

/// Output settings owned by the proxy instance
#[derive(Clone)]
pub struct OutputContext {
    /// Log reserved and unhandled messages
    pub debug: bool,
    /// Where diagnostics and messages are shown
    pub sink: Arc<dyn DisplaySink>,
}

/// Notification handler type for LSP notifications
type NotificationHandler = Box<dyn Fn(&NotificationRouter, Value) -> ProxyResult<()> + Send + Sync>;

/// Dispatches server notifications through a table of handlers
pub struct NotificationRouter {
    context: OutputContext,
    handlers: HashMap<String, NotificationHandler>,
    diagnostics: Mutex<BTreeMap<String, Vec<Diagnostic>>>,
}

impl NotificationRouter {
    pub fn new(context: OutputContext) -> Self {
        let mut router = Self {
            context,
            handlers: HashMap::new(),
            diagnostics: Mutex::new(BTreeMap::new()),
        };

        router.register(methods::TEXT_DOCUMENT_DIAGNOSTICS, Self::handle_diagnostics);
        router.register(methods::WINDOW_SHOW_MESSAGE, Self::handle_show_message);
        router.register(methods::WINDOW_LOG_MESSAGE, Self::handle_log_message);
        router
    }

    /// Register (or replace) the handler for `method`
    pub fn register<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(&NotificationRouter, Value) -> ProxyResult<()> + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    #[cfg(test)]
    pub fn handles(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    #[cfg(test)]
    pub fn context(&self) -> &OutputContext {
        &self.context
    }

    /// Route one notification. Never fails: problems are logged and dropped.
    pub fn dispatch(&self, method: &str, params: Option<Value>) {
        if method.starts_with(methods::RESERVED_PREFIX) {
            if self.context.debug {
                debug!("Ignoring server dependent notification {}: {:?}", method, params);
            }
            return;
        }

        match self.handlers.get(method) {
            Some(handler) => {
                if let Err(e) = handler(self, params.unwrap_or(Value::Null)) {
                    warn!("Dropping notification: {}", e);
                }
            }
            None => info!("Unhandled notification {}", method),
        }
    }

    /// Answer a request initiated by the server
    pub fn handle_request(&self, method: &str, params: Option<Value>) -> Value {
        if method == methods::WORKSPACE_CONFIGURATION {
            let items = params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            return Value::Array(vec![Value::Null; items]);
        }

        if self.context.debug {
            debug!("Answering server request {} with null: {:?}", method, params);
        }
        Value::Null
    }

    /// Diagnostics currently displayed for `uri`
    #[cfg(test)]
    pub fn diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.lock_diagnostics().get(uri).cloned().unwrap_or_default()
    }

    fn lock_diagnostics(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<Diagnostic>>> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle_diagnostics(&self, params: Value) -> ProxyResult<()> {
        let params: PublishDiagnosticsParams =
            decode(methods::TEXT_DOCUMENT_DIAGNOSTICS, params)?;

        let report = {
            let mut diagnostics = self.lock_diagnostics();
            let uri = params.uri.as_str().to_string();
            debug!("Updated {} diagnostics for {}", params.diagnostics.len(), uri);
            if params.diagnostics.is_empty() {
                diagnostics.remove(&uri);
            } else {
                diagnostics.insert(uri, params.diagnostics);
            }
            render_diagnostics(&diagnostics)
        };

        self.context.sink.show_diagnostics(&report);
        Ok(())
    }

    fn handle_show_message(&self, params: Value) -> ProxyResult<()> {
        let params: ShowMessageParams = decode(methods::WINDOW_SHOW_MESSAGE, params)?;
        self.context
            .sink
            .show_message(&format!("LSP {}: {}", message_tag(params.typ), params.message));
        Ok(())
    }

    fn handle_log_message(&self, params: Value) -> ProxyResult<()> {
        let params: LogMessageParams = decode(methods::WINDOW_LOG_MESSAGE, params)?;
        if params.typ == MessageType::ERROR || params.typ == MessageType::WARNING {
            warn!("LSP log: {}", params.message);
        } else {
            debug!("LSP log: {}", params.message);
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: Value) -> ProxyResult<T> {
    serde_json::from_value(params).map_err(|source| ProxyError::MalformedNotification {
        method: method.to_string(),
        source,
    })
}

fn severity_tag(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(s) if s == DiagnosticSeverity::ERROR => "error",
        Some(s) if s == DiagnosticSeverity::WARNING => "warning",
        Some(s) if s == DiagnosticSeverity::INFORMATION => "info",
        Some(s) if s == DiagnosticSeverity::HINT => "hint",
        _ => "diagnostic",
    }
}

fn message_tag(typ: MessageType) -> &'static str {
    if typ == MessageType::ERROR {
        "error"
    } else if typ == MessageType::WARNING {
        "warning"
    } else if typ == MessageType::INFO {
        "info"
    } else {
        "log"
    }
}

/// Render every file's diagnostics, files in URI order, 1-based positions.
pub fn render_diagnostics(diagnostics: &BTreeMap<String, Vec<Diagnostic>>) -> String {
    let mut report = String::new();
    for (uri, list) in diagnostics {
        let path = uri
            .parse::<lsp_types::Uri>()
            .map(|u| uri_to_path(&u).display().to_string())
            .unwrap_or_else(|_| uri.clone());

        for diagnostic in list {
            let start = diagnostic.range.start;
            let _ = write!(
                report,
                "{}:{}:{}: {}: {}",
                path,
                start.line + 1,
                start.character + 1,
                severity_tag(diagnostic.severity),
                diagnostic.message
            );
            if let Some(source) = &diagnostic.source {
                let _ = write!(report, " ({})", source);
            }
            report.push('\n');
        }
    }
    report
}
