//! Connection to a single language server

use crate::lsp::{
    errors::{ProxyError, ProxyResult},
    notifications::NotificationRouter,
    protocol::LspProtocol,
    types::*,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    process::{Child, Command},
    sync::{mpsc, oneshot, watch, Mutex},
};
use tracing::{debug, error, info, trace, warn};

/// Response handler type for LSP requests
type ResponseHandler = oneshot::Sender<ProxyResult<Value>>;

/// Calls waiting for a response.
///
/// `closed` lives under the same lock as the table so that no call can be
/// registered after termination drained it.
#[derive(Default)]
struct PendingCalls {
    closed: bool,
    handlers: HashMap<i64, ResponseHandler>,
}

/// State shared with the reader and writer tasks
struct Shared {
    name: String,
    pending: Mutex<PendingCalls>,
}

impl Shared {
    fn closed_error(&self) -> ProxyError {
        ProxyError::ConnectionClosed(self.name.clone())
    }

    /// Fail one pending call with a response that could not be decoded
    async fn fail_call(&self, id: i64, cause: ProxyError) {
        if let Some(handler) = self.pending.lock().await.handlers.remove(&id) {
            let _ = handler.send(Err(ProxyError::Rpc {
                code: LspError::PARSE_ERROR,
                message: format!("undecodable response: {}", cause),
            }));
        }
    }

    /// Mark the connection closed and fail every pending call
    async fn terminate(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        if !pending.closed {
            info!("Connection to {} terminated: {}", self.name, reason);
        }
        pending.closed = true;

        for (id, handler) in pending.handlers.drain() {
            debug!("Failing pending request {} on {}", id, self.name);
            let _ = handler.send(Err(self.closed_error()));
        }
    }
}

/// Correlated request/response channel to one language server
pub struct ServerConnection {
    shared: Arc<Shared>,

    /// Next request ID
    next_id: AtomicI64,

    /// Frames for the writer task
    message_sender: mpsc::UnboundedSender<LspMessage>,

    /// Set once the initialize handshake completed
    initialized: AtomicBool,

    /// Open documents and their versions
    open_files: Mutex<HashMap<String, i32>>,

    /// Spawned server process, killed on drop
    process: Option<Child>,

    /// Dropping this stops the reader and writer tasks
    _shutdown: watch::Sender<()>,
}

impl ServerConnection {
    /// Run the protocol over an already established byte stream
    pub fn start<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        router: Arc<NotificationRouter>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            pending: Mutex::new(PendingCalls::default()),
        });

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        Self::start_write_task(Arc::clone(&shared), writer, msg_rx, shutdown_rx.clone());
        Self::start_read_task(Arc::clone(&shared), reader, msg_tx.clone(), router, shutdown_rx);

        Self {
            shared,
            next_id: AtomicI64::new(1),
            message_sender: msg_tx,
            initialized: AtomicBool::new(false),
            open_files: Mutex::new(HashMap::new()),
            process: None,
            _shutdown: shutdown_tx,
        }
    }

    /// Spawn a language server process and talk to it over its standard streams
    pub fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        working_dir: &Path,
        router: Arc<NotificationRouter>,
    ) -> ProxyResult<Self> {
        let name = name.into();
        info!("Starting LSP server '{}': {} {}", name, command, args.join(" "));

        let mut process = Command::new(command)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProxyError::Transport(format!("Failed to start LSP server '{}': {}", command, e))
            })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Transport("Failed to get stdin for LSP process".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Transport("Failed to get stdout for LSP process".into()))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Transport("Failed to get stderr for LSP process".into()))?;

        Self::start_error_task(name.clone(), stderr);

        let mut connection = Self::start(name, stdout, stdin, router);
        connection.process = Some(process);
        Ok(connection)
    }

    /// Dial a language server listening on a TCP address
    pub async fn dial(
        name: impl Into<String>,
        address: &str,
        router: Arc<NotificationRouter>,
    ) -> ProxyResult<Self> {
        let name = name.into();
        info!("Dialing LSP server '{}' at {}", name, address);

        let stream = TcpStream::connect(address).await.map_err(|e| {
            ProxyError::Transport(format!("Failed to dial LSP server at {}: {}", address, e))
        })?;
        let (reader, writer) = stream.into_split();

        Ok(Self::start(name, reader, writer, router))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether the transport has ended
    pub async fn is_closed(&self) -> bool {
        self.shared.pending.lock().await.closed
    }

    /// Perform the initialize handshake. Later calls are no-ops.
    pub async fn initialize(&self, root_dir: &Path) -> ProxyResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let root_uri = path_to_uri(root_dir)?;
        let workspace_name = root_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("root");

        let result = self
            .request(
                methods::INITIALIZE,
                Some(LspProtocol::initialize_params(root_uri.as_str(), workspace_name)),
            )
            .await?;
        let capabilities = result.get("capabilities").cloned().unwrap_or_default();
        debug!("Server capabilities for {}: {}", self.name(), capabilities);

        self.notify(methods::INITIALIZED, json!({}))?;
        self.initialized.store(true, Ordering::SeqCst);

        info!("LSP server '{}' initialized with root {}", self.name(), root_dir.display());
        Ok(())
    }

    /// Send a request and decode its result
    pub async fn call<P, R>(&self, method: &str, params: P) -> ProxyResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request and wait for its raw result.
    ///
    /// Only this caller waits. The wait ends with the response, an RPC
    /// error, or `ConnectionClosed` once the transport ends.
    pub async fn request(&self, method: &str, params: Option<Value>) -> ProxyResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().await;
            if pending.closed {
                return Err(self.shared.closed_error());
            }
            pending.handlers.insert(id, tx);
        }

        trace!("Request {} {} to {}", id, method, self.name());
        let message = LspMessage::Request {
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        };
        if self.message_sender.send(message).is_err() {
            self.shared.pending.lock().await.handlers.remove(&id);
            return Err(self.shared.closed_error());
        }

        match rx.await {
            Ok(response) => response,
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Send a notification. A `null` payload is sent without params.
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> ProxyResult<()> {
        let params = serde_json::to_value(params)?;
        let message = LspMessage::Notification {
            method: method.to_string(),
            params: (!params.is_null()).then_some(params),
        };
        self.message_sender
            .send(message)
            .map_err(|_| self.shared.closed_error())
    }

    /// Open a document in the language server
    pub async fn open_file(&self, uri: &str, language_id: &str, text: &str) -> ProxyResult<()> {
        let version = 1;
        self.open_files.lock().await.insert(uri.to_string(), version);

        self.notify(
            methods::TEXT_DOCUMENT_DID_OPEN,
            LspProtocol::did_open_params(uri, language_id, version, text),
        )?;

        debug!("Opened {} on {}", uri, self.name());
        Ok(())
    }

    pub async fn is_open(&self, uri: &str) -> bool {
        self.open_files.lock().await.contains_key(uri)
    }

    /// Send the full new text of an open document. Returns false if it is not open.
    pub async fn change_file(&self, uri: &str, text: &str) -> ProxyResult<bool> {
        let version = {
            let mut open_files = self.open_files.lock().await;
            match open_files.get_mut(uri) {
                Some(version) => {
                    *version += 1;
                    *version
                }
                None => return Ok(false),
            }
        };

        self.notify(
            methods::TEXT_DOCUMENT_DID_CHANGE,
            LspProtocol::did_change_params(uri, version, text),
        )?;

        debug!("Changed {} on {} (version {})", uri, self.name(), version);
        Ok(true)
    }

    /// Close a document in the language server
    pub async fn close_file(&self, uri: &str) -> ProxyResult<()> {
        self.open_files.lock().await.remove(uri);

        self.notify(
            methods::TEXT_DOCUMENT_DID_CLOSE,
            LspProtocol::did_close_params(uri),
        )?;

        debug!("Closed {} on {}", uri, self.name());
        Ok(())
    }

    /// Shutdown the language server gracefully
    pub async fn shutdown(&self) -> ProxyResult<()> {
        self.request(methods::SHUTDOWN, None).await?;
        self.notify(methods::EXIT, Value::Null)
    }

    #[cfg(test)]
    pub async fn pending_calls(&self) -> usize {
        self.shared.pending.lock().await.handlers.len()
    }

    /// Start the write task. It is the only writer of the transport.
    fn start_write_task<W: AsyncWrite + Unpin + Send + 'static>(
        shared: Arc<Shared>,
        writer: W,
        mut msg_rx: mpsc::UnboundedReceiver<LspMessage>,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut writer = BufWriter::new(writer);

            loop {
                tokio::select! {
                    message = msg_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = LspProtocol::write_message(&mut writer, &message).await {
                                error!("Failed to write LSP message to {}: {}", shared.name, e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        debug!("LSP write task for {} shutting down", shared.name);
                        break;
                    }
                }
            }

            let _ = writer.shutdown().await;
            shared.terminate("writer stopped").await;
        });
    }

    /// Start the read task. It is the only reader of the transport.
    fn start_read_task<R: AsyncRead + Unpin + Send + 'static>(
        shared: Arc<Shared>,
        reader: R,
        msg_tx: mpsc::UnboundedSender<LspMessage>,
        router: Arc<NotificationRouter>,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);

            let reason = loop {
                let frame = tokio::select! {
                    frame = LspProtocol::read_frame(&mut reader) => frame,
                    _ = shutdown_rx.changed() => break "connection dropped".to_string(),
                };

                match frame {
                    Ok(Some((header, content))) => {
                        match LspProtocol::parse_message(&header, &content) {
                            Ok(message) => {
                                Self::handle_message(&shared, &router, &msg_tx, message).await
                            }
                            Err(e) => {
                                warn!("Skipping undecodable message from {}: {}", shared.name, e);
                                if let Some(id) = LspProtocol::response_id(&content) {
                                    shared.fail_call(id, e).await;
                                }
                            }
                        }
                    }
                    Ok(None) => break "end of stream".to_string(),
                    Err(e) => {
                        error!("Failed to read LSP message from {}: {}", shared.name, e);
                        break e.to_string();
                    }
                }
            };

            shared.terminate(&reason).await;
        });
    }

    /// Start the error reading task
    fn start_error_task<R: AsyncRead + Unpin + Send + 'static>(name: String, stderr: R) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        warn!("LSP server [{}] stderr: {}", name, line.trim_end());
                    }
                    Err(e) => {
                        error!("Error reading LSP stderr: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// Handle incoming LSP messages
    async fn handle_message(
        shared: &Shared,
        router: &NotificationRouter,
        msg_tx: &mpsc::UnboundedSender<LspMessage>,
        message: LspMessage,
    ) {
        match message {
            LspMessage::Response { id, result, error } => {
                let handler = match &id {
                    RequestId::Number(n) => shared.pending.lock().await.handlers.remove(n),
                    RequestId::String(_) => None,
                };

                match handler {
                    Some(handler) => {
                        let response = match error {
                            Some(error) => Err(ProxyError::Rpc {
                                code: error.code,
                                message: error.message,
                            }),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = handler.send(response);
                    }
                    None => warn!("Response from {} for unknown request {}", shared.name, id),
                }
            }
            LspMessage::Notification { method, params } => {
                router.dispatch(&method, params);
            }
            LspMessage::Request { id, method, params } => {
                debug!("Server {} sent request {} ({})", shared.name, method, id);
                let result = router.handle_request(&method, params);
                let _ = msg_tx.send(LspMessage::Response {
                    id,
                    result: Some(result),
                    error: None,
                });
            }
        }
    }
}
