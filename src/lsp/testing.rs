//! In-process language server for tests

use crate::editor::MemorySink;
use crate::lsp::{
    connection::ServerConnection,
    notifications::{NotificationRouter, OutputContext},
    protocol::LspProtocol,
    types::{LspError, LspMessage},
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{mpsc, Mutex},
};

/// How the fake answers a request
pub enum Reply {
    Result(Value),
    Error(LspError),
    /// Never answer
    Ignore,
}

pub type Script = Arc<dyn Fn(&str, Option<&Value>) -> Reply + Send + Sync>;

pub fn script<F>(f: F) -> Script
where
    F: Fn(&str, Option<&Value>) -> Reply + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn quiet_router() -> Arc<NotificationRouter> {
    recording_router().0
}

pub fn recording_router() -> (Arc<NotificationRouter>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let router = NotificationRouter::new(OutputContext {
        debug: false,
        sink: sink.clone(),
    });
    (Arc::new(router), sink)
}

enum Outgoing {
    Message(LspMessage),
    Raw(Vec<u8>),
    Close,
}

/// Fake language server. `initialize` and `shutdown` are always answered,
/// `exit` closes the stream, and every other request is answered by the
/// script.
pub struct FakeServer {
    received: Arc<Mutex<Vec<LspMessage>>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl FakeServer {
    pub fn serve<S>(stream: S, script: Script) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let received = Arc::new(Mutex::new(Vec::new()));
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();

        tokio::spawn(async move {
            while let Some(out) = outgoing_rx.recv().await {
                match out {
                    Outgoing::Message(message) => {
                        if LspProtocol::write_message(&mut write_half, &message).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Raw(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let log = Arc::clone(&received);
        let replies = outgoing.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(message)) = LspProtocol::read_message(&mut reader).await {
                log.lock().await.push(message.clone());

                if matches!(&message, LspMessage::Notification { method, .. } if method == "exit") {
                    let _ = replies.send(Outgoing::Close);
                    break;
                }

                if let LspMessage::Request { id, method, params } = message {
                    let reply = match method.as_str() {
                        "initialize" => Reply::Result(json!({"capabilities": {}})),
                        "shutdown" => Reply::Result(Value::Null),
                        _ => script(&method, params.as_ref()),
                    };
                    let response = match reply {
                        Reply::Result(result) => LspMessage::Response {
                            id,
                            result: Some(result),
                            error: None,
                        },
                        Reply::Error(error) => LspMessage::Response {
                            id,
                            result: None,
                            error: Some(error),
                        },
                        Reply::Ignore => continue,
                    };
                    let _ = replies.send(Outgoing::Message(response));
                }
            }
        });

        Self { received, outgoing }
    }

    /// A connection wired to a fresh fake over an in-memory pipe
    pub fn pair(script: Script, router: Arc<NotificationRouter>) -> (ServerConnection, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);
        let connection = ServerConnection::start("fake", reader, writer, router);
        (connection, FakeServer::serve(server, script))
    }

    /// Accept TCP connections, one fake per connection.
    /// Returns the address and a count of accepted connections.
    pub async fn listen(script: Script) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                // Kept alive by its own tasks
                let _ = FakeServer::serve(stream, Arc::clone(&script));
            }
        });

        (address, accepted)
    }

    pub fn send(&self, message: LspMessage) {
        let _ = self.outgoing.send(Outgoing::Message(message));
    }

    /// Send a body as is, framed but not validated
    pub fn send_raw(&self, body: &str) {
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(body.as_bytes());
        let _ = self.outgoing.send(Outgoing::Raw(frame));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(LspMessage::Notification {
            method: method.to_string(),
            params: Some(params),
        });
    }

    /// End the server side of the stream
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    pub async fn requests(&self) -> Vec<(String, Option<Value>)> {
        self.received
            .lock()
            .await
            .iter()
            .filter_map(|message| match message {
                LspMessage::Request { method, params, .. } => Some((method.clone(), params.clone())),
                _ => None,
            })
            .collect()
    }

    /// Poll until a received message matches `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Option<LspMessage>
    where
        F: Fn(&LspMessage) -> bool,
    {
        for _ in 0..200 {
            if let Some(message) = self.received.lock().await.iter().find(|m| predicate(m)) {
                return Some(message.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Params of the first notification named `method`
    pub async fn wait_for_notification(&self, method: &str) -> Option<Value> {
        let message = self
            .wait_for(|m| matches!(m, LspMessage::Notification { method: name, .. } if name == method))
            .await?;
        match message {
            LspMessage::Notification { params, .. } => Some(params.unwrap_or(Value::Null)),
            _ => None,
        }
    }

    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..200 {
            if self.requests().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake server did not receive {} requests", count);
    }
}
