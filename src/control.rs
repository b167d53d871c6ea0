//! Local control surface
//!
//! The daemon listens on a Unix socket or TCP address and accepts the same
//! framed JSON-RPC messages that language servers speak. Each request names
//! one editor operation; the reply carries the text output and any locations
//! the operation navigated to.

use crate::editor::{Cursor, FileEditor, LocationLog, StdoutSink};
use crate::events::{EditorEvent, EventBridge, EventHub};
use crate::lsp::{
    location_link, CommandDispatcher, LspError, LspMessage, LspProtocol, NotificationRouter,
    OutputContext, ProxyError, ProxyResult, ServerConnection,
};
use lsp_types::{Location, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

/// Request methods understood by the control server
pub mod requests {
    pub const DEFINITION: &str = "lsproxy/definition";
    pub const HOVER: &str = "lsproxy/hover";
    pub const REFERENCES: &str = "lsproxy/references";
    pub const SYMBOLS: &str = "lsproxy/symbols";
    pub const COMPLETION: &str = "lsproxy/completion";
    pub const SIGNATURE_HELP: &str = "lsproxy/signatureHelp";
    pub const RENAME: &str = "lsproxy/rename";
    pub const FORMAT: &str = "lsproxy/format";
    pub const DID_OPEN: &str = "lsproxy/didOpen";
    pub const DID_CLOSE: &str = "lsproxy/didClose";
    pub const DID_SAVE: &str = "lsproxy/didSave";
    pub const FOCUS: &str = "lsproxy/focus";
    pub const SERVERS: &str = "lsproxy/servers";
}

/// Where the control server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// `unix:<path>` is a Unix socket, anything else a TCP address
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix("unix:") {
            Some(path) => Endpoint::Unix(PathBuf::from(path)),
            None => Endpoint::Tcp(spec.to_string()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(address) => write!(f, "{}", address),
        }
    }
}

/// Parameters shared by every control request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    /// Target file. Defaults to the focused file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Byte offset of the cursor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

impl RequestParams {
    pub fn for_file(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::default()
        }
    }

    /// Cursor described by the params. A line and character win over an offset.
    pub fn cursor(&self) -> Cursor {
        match (self.line, self.character) {
            (Some(line), Some(character)) => Cursor::Position(Position::new(line, character)),
            _ => Cursor::Offset(self.offset.unwrap_or(0)),
        }
    }
}

/// Result of a control request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub output: String,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl ControlReply {
    fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            locations: Vec::new(),
        }
    }

    fn locations(locations: &[Location]) -> Self {
        Self {
            output: String::new(),
            locations: locations.iter().map(location_link).collect(),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bound control endpoint
pub enum ControlListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl ControlListener {
    pub async fn bind(endpoint: &Endpoint) -> ProxyResult<Self> {
        match endpoint {
            Endpoint::Unix(path) => Ok(ControlListener::Unix {
                listener: bind_unix(path).await?,
                path: path.clone(),
            }),
            Endpoint::Tcp(address) => {
                let listener = TcpListener::bind(address).await.map_err(|e| {
                    ProxyError::Transport(format!("failed to listen on {}: {}", address, e))
                })?;
                Ok(ControlListener::Tcp(listener))
            }
        }
    }

    /// Endpoint clients should connect to
    pub fn local_endpoint(&self) -> ProxyResult<Endpoint> {
        match self {
            ControlListener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            ControlListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }

    async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            ControlListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            ControlListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        if let ControlListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Bind a Unix socket, replacing a socket file nobody listens on anymore
async fn bind_unix(path: &Path) -> ProxyResult<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => match UnixStream::connect(path).await {
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                info!("Removing stale socket {}", path.display());
                std::fs::remove_file(path)?;
                Ok(UnixListener::bind(path)?)
            }
            _ => Err(ProxyError::Transport(format!(
                "{} is already in use",
                path.display()
            ))),
        },
        Err(e) => Err(ProxyError::Transport(format!(
            "failed to listen on {}: {}",
            path.display(),
            e
        ))),
        Ok(listener) => Ok(listener),
    }
}

/// Serves control requests against the language servers
pub struct ControlServer {
    dispatcher: Arc<CommandDispatcher>,
    hub: Arc<EventHub>,
    bridge: Arc<EventBridge>,
}

impl ControlServer {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        hub: Arc<EventHub>,
        bridge: Arc<EventBridge>,
    ) -> Self {
        Self {
            dispatcher,
            hub,
            bridge,
        }
    }

    /// Accept clients until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: ControlListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(endpoint) = listener.local_endpoint() {
            info!("Control server listening on {}", endpoint);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((reader, writer)) => {
                        tokio::spawn(Arc::clone(&self).serve_client(reader, writer));
                    }
                    Err(e) => warn!("Failed to accept control client: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Control server stopped");
    }

    /// One client. Requests run concurrently and replies go through a
    /// single writer task.
    async fn serve_client(self: Arc<Self>, reader: BoxedReader, writer: BoxedWriter) {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<LspMessage>();

        let write_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = reply_rx.recv().await {
                if let Err(e) = LspProtocol::write_message(&mut writer, &message).await {
                    warn!("Failed to write control reply: {}", e);
                    break;
                }
            }
        });

        let mut reader = BufReader::new(reader);
        loop {
            let (header, content) = match LspProtocol::read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Control client stream broken: {}", e);
                    break;
                }
            };

            match LspProtocol::parse_message(&header, &content) {
                Ok(LspMessage::Request { id, method, params }) => {
                    let server = Arc::clone(&self);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let response = match server.handle_request(&method, params).await {
                            Ok(result) => LspMessage::Response {
                                id,
                                result: Some(result),
                                error: None,
                            },
                            Err(error) => LspMessage::Response {
                                id,
                                result: None,
                                error: Some(error),
                            },
                        };
                        let _ = reply_tx.send(response);
                    });
                }
                Ok(other) => debug!("Ignoring control message {:?}", other),
                Err(e) => warn!("Skipping undecodable control message: {}", e),
            }
        }

        drop(reply_tx);
        let _ = write_task.await;
        debug!("Control client disconnected");
    }

    /// Run one control request
    pub async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, LspError> {
        debug!("Control request {}", method);

        let params: RequestParams = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| LspError::new(LspError::INVALID_PARAMS, e.to_string()))?,
            None => RequestParams::default(),
        };

        let dispatcher = &self.dispatcher;
        let reply = match method {
            requests::DEFINITION => {
                let editor = self.editor(&params)?;
                let log = LocationLog::new();
                dispatcher
                    .definition(&editor, &log)
                    .await
                    .map(|_| ControlReply::locations(&log.take()))
            }
            requests::HOVER => dispatcher
                .hover(&self.editor(&params)?)
                .await
                .map(ControlReply::output),
            requests::REFERENCES => dispatcher
                .references(&self.editor(&params)?)
                .await
                .map(ControlReply::output),
            requests::SYMBOLS => dispatcher
                .symbols(&self.editor(&params)?)
                .await
                .map(ControlReply::output),
            requests::COMPLETION => dispatcher
                .completion(&self.editor(&params)?)
                .await
                .map(ControlReply::output),
            requests::SIGNATURE_HELP => dispatcher
                .signature_help(&self.editor(&params)?)
                .await
                .map(ControlReply::output),
            requests::RENAME => {
                let new_name = params.new_name.as_deref().ok_or_else(|| {
                    LspError::new(LspError::INVALID_PARAMS, "rename needs newName")
                })?;
                dispatcher
                    .rename(&self.editor(&params)?, new_name)
                    .await
                    .map(ControlReply::output)
            }
            requests::FORMAT => dispatcher
                .format(&self.editor(&params)?)
                .await
                .map(|_| ControlReply::default()),
            requests::DID_OPEN => Ok(self.publish(EditorEvent::Opened {
                path: self.file(&params)?,
            })),
            requests::DID_CLOSE => Ok(self.publish(EditorEvent::Closed {
                path: self.file(&params)?,
            })),
            requests::DID_SAVE => Ok(self.publish(EditorEvent::Saved {
                path: self.file(&params)?,
            })),
            requests::FOCUS => Ok(self.publish(EditorEvent::Focused {
                path: self.file(&params)?,
            })),
            requests::SERVERS => Ok(ControlReply::output(self.servers().await)),
            _ => {
                return Err(LspError::new(
                    LspError::METHOD_NOT_FOUND,
                    format!("unknown method {}", method),
                ))
            }
        };

        let reply = reply.map_err(|e| LspError::new(LspError::REQUEST_FAILED, e.to_string()))?;
        serde_json::to_value(reply)
            .map_err(|e| LspError::new(LspError::REQUEST_FAILED, e.to_string()))
    }

    /// Requested file, or the focused one
    fn file(&self, params: &RequestParams) -> Result<PathBuf, LspError> {
        params
            .file
            .clone()
            .or_else(|| self.bridge.focused())
            .ok_or_else(|| LspError::new(LspError::INVALID_PARAMS, "no file given and none focused"))
    }

    fn editor(&self, params: &RequestParams) -> Result<FileEditor, LspError> {
        Ok(FileEditor::new(self.file(params)?, params.cursor()))
    }

    fn publish(&self, event: EditorEvent) -> ControlReply {
        if self.hub.publish(event.clone()) == 0 {
            warn!("No subscriber for {:?}", event);
        }
        ControlReply::default()
    }

    async fn servers(&self) -> String {
        let registry = self.dispatcher.registry();
        let mut out = String::new();
        for binding in registry.bindings() {
            out.push_str(&format!("{}\t{}\n", binding.pattern, binding.transport));
        }
        for active in registry.active_servers().await {
            out.push_str(&format!("running: {}\n", active));
        }
        out
    }
}

/// Client side of the control surface
pub struct ControlClient {
    connection: ServerConnection,
}

impl ControlClient {
    pub async fn connect(endpoint: &Endpoint) -> ProxyResult<Self> {
        let router = Arc::new(NotificationRouter::new(OutputContext {
            debug: false,
            sink: Arc::new(StdoutSink),
        }));
        let name = endpoint.to_string();

        let connection = match endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    ProxyError::Transport(format!("failed to connect to {}: {}", name, e))
                })?;
                let (reader, writer) = stream.into_split();
                ServerConnection::start(name, reader, writer, router)
            }
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address).await.map_err(|e| {
                    ProxyError::Transport(format!("failed to connect to {}: {}", name, e))
                })?;
                let (reader, writer) = stream.into_split();
                ServerConnection::start(name, reader, writer, router)
            }
        };

        Ok(Self { connection })
    }

    pub async fn call(&self, method: &str, params: &RequestParams) -> ProxyResult<ControlReply> {
        self.connection.call(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::testing::{quiet_router, script, FakeServer, Reply};
    use crate::lsp::{ServerRegistry, Transport};
    use serde_json::json;

    struct Harness {
        client: ControlClient,
        endpoint: Endpoint,
        dir: tempfile::TempDir,
        _shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn file(&self, name: &str, text: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, text).unwrap();
            path
        }
    }

    /// Proxy whose `.go` files are served by a scripted fake, with the
    /// control server and event bridge running on `endpoint`.
    async fn harness(endpoint: Endpoint) -> Harness {
        let (address, _) = FakeServer::listen(script(|method, _| match method {
            "textDocument/hover" => Reply::Result(json!({"contents": "func main()"})),
            "textDocument/references" => Reply::Result(json!([])),
            "textDocument/definition" => Reply::Result(json!([{
                "uri": "file:///src/lib.go",
                "range": {"start": {"line": 4, "character": 5}, "end": {"line": 4, "character": 8}}
            }])),
            _ => Reply::Result(serde_json::Value::Null),
        }))
        .await;

        let mut registry = ServerRegistry::new("/", quiet_router());
        registry.register(r"\.go$", Transport::Dial { address }).unwrap();
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(registry)));

        let hub = Arc::new(EventHub::new());
        let bridge = Arc::new(EventBridge::new(Arc::clone(&dispatcher), false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let events = hub.subscribe();
        let bridge_task = Arc::clone(&bridge);
        let bridge_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge_task.run(events, bridge_shutdown).await });

        let listener = ControlListener::bind(&endpoint).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let server = Arc::new(ControlServer::new(dispatcher, hub, bridge));
        tokio::spawn(server.serve(listener, shutdown_rx));

        Harness {
            client: ControlClient::connect(&endpoint).await.unwrap(),
            endpoint,
            dir: tempfile::tempdir().unwrap(),
            _shutdown: shutdown_tx,
        }
    }

    async fn tcp_harness() -> Harness {
        harness(Endpoint::Tcp("127.0.0.1:0".to_string())).await
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("unix:/tmp/lsproxy.sock"),
            Endpoint::Unix(PathBuf::from("/tmp/lsproxy.sock"))
        );
        assert_eq!(
            Endpoint::parse("127.0.0.1:4389"),
            Endpoint::Tcp("127.0.0.1:4389".to_string())
        );
        assert_eq!(Endpoint::parse("unix:/a.sock").to_string(), "unix:/a.sock");
    }

    #[test]
    fn test_params_cursor() {
        let mut params = RequestParams::for_file("/a.go");
        assert_eq!(params.cursor(), Cursor::Offset(0));
        params.offset = Some(12);
        assert_eq!(params.cursor(), Cursor::Offset(12));
        params.line = Some(3);
        params.character = Some(4);
        assert_eq!(params.cursor(), Cursor::Position(Position::new(3, 4)));

        let json = serde_json::to_value(RequestParams {
            new_name: Some("x".into()),
            ..RequestParams::for_file("/a.go")
        })
        .unwrap();
        assert_eq!(json, json!({"file": "/a.go", "newName": "x"}));
    }

    #[tokio::test]
    async fn test_hover_over_tcp() {
        let harness = tcp_harness().await;
        let path = harness.file("main.go", "package main\n");

        let reply = harness
            .client
            .call(requests::HOVER, &RequestParams::for_file(&path))
            .await
            .unwrap();
        assert_eq!(reply.output, "func main()\n");
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_only_that_client() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let harness = tcp_harness().await;
        let Endpoint::Tcp(address) = &harness.endpoint else {
            panic!("expected a tcp endpoint");
        };

        let mut rogue = tokio::net::TcpStream::connect(address).await.unwrap();
        rogue
            .write_all(b"Content-Length: 18446744073709551615\r\n\r\n")
            .await
            .unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), rogue.read_to_end(&mut rest))
            .await
            .expect("rogue client was not disconnected")
            .unwrap();

        let path = harness.file("main.go", "package main\n");
        let reply = harness
            .client
            .call(requests::HOVER, &RequestParams::for_file(&path))
            .await
            .unwrap();
        assert_eq!(reply.output, "func main()\n");
    }

    #[tokio::test]
    async fn test_definition_returns_locations() {
        let harness = tcp_harness().await;
        let path = harness.file("main.go", "package main\n");

        let reply = harness
            .client
            .call(requests::DEFINITION, &RequestParams::for_file(&path))
            .await
            .unwrap();
        assert_eq!(reply.locations, ["/src/lib.go:5:6-5:9"]);
        assert!(reply.output.is_empty());
    }

    #[tokio::test]
    async fn test_request_errors() {
        let harness = tcp_harness().await;

        let err = harness
            .client
            .call("lsproxy/nope", &RequestParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Rpc { code: -32601, .. }));

        let err = harness
            .client
            .call(requests::HOVER, &RequestParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Rpc { code: -32602, .. }));

        let err = harness
            .client
            .call(requests::RENAME, &RequestParams::for_file("/a.go"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Rpc { code: -32602, .. }));

        let path = harness.file("notes.txt", "hello\n");
        let err = harness
            .client
            .call(requests::HOVER, &RequestParams::for_file(&path))
            .await
            .unwrap_err();
        match err {
            ProxyError::Rpc { code, message } => {
                assert_eq!(code, -32000);
                assert!(message.contains("no language server"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_client() {
        let harness = Arc::new(tcp_harness().await);
        let path = harness.file("main.go", "package main\n");

        let mut tasks = Vec::new();
        for n in 0..5 {
            let harness = Arc::clone(&harness);
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                let method = if n % 2 == 0 { requests::HOVER } else { requests::REFERENCES };
                let reply = harness
                    .client
                    .call(method, &RequestParams::for_file(&path))
                    .await
                    .unwrap();
                (method, reply.output)
            }));
        }

        for task in tasks {
            let (method, output) = task.await.unwrap();
            if method == requests::HOVER {
                assert_eq!(output, "func main()\n");
            } else {
                assert_eq!(output, "No references found.\n");
            }
        }
    }

    #[tokio::test]
    async fn test_focus_supplies_default_file() {
        let harness = tcp_harness().await;
        let path = harness.file("main.go", "package main\n");

        harness
            .client
            .call(requests::FOCUS, &RequestParams::for_file(&path))
            .await
            .unwrap();

        // The bridge handles the focus event asynchronously
        let mut reply = None;
        for _ in 0..100 {
            if let Ok(r) = harness.client.call(requests::HOVER, &RequestParams::default()).await {
                reply = Some(r);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(reply.unwrap().output, "func main()\n");
    }

    #[tokio::test]
    async fn test_servers_listing() {
        let harness = tcp_harness().await;
        let reply = harness
            .client
            .call(requests::SERVERS, &RequestParams::default())
            .await
            .unwrap();
        assert!(reply.output.starts_with("\\.go$\tdial 127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_unix_socket_and_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("lsproxy.sock");

        // Leave a socket file behind with nobody listening on it
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let harness = harness(Endpoint::Unix(socket.clone())).await;
        let path = harness.file("main.go", "package main\n");
        let reply = harness
            .client
            .call(requests::HOVER, &RequestParams::for_file(&path))
            .await
            .unwrap();
        assert_eq!(reply.output, "func main()\n");
    }

    #[tokio::test]
    async fn test_live_socket_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("busy.sock"));

        let _first = ControlListener::bind(&endpoint).await.unwrap();
        let second = ControlListener::bind(&endpoint).await;
        assert!(matches!(second, Err(ProxyError::Transport(_))));
    }
}
