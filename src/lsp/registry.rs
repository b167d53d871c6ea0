//! Registry routing files to language servers

use crate::lsp::{
    connection::ServerConnection,
    errors::{ProxyError, ProxyResult},
    notifications::NotificationRouter,
    types::*,
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Ordered filename bindings with one lazily created connection per binding
pub struct ServerRegistry {
    /// Bindings in configuration order
    bindings: Vec<ServerBinding>,

    /// Live connections by binding index. The lock covers lookup and creation.
    connections: Mutex<HashMap<usize, Arc<ServerConnection>>>,

    /// Root directory sent in the initialize handshake
    root_dir: PathBuf,

    router: Arc<NotificationRouter>,
}

impl ServerRegistry {
    pub fn new(root_dir: impl Into<PathBuf>, router: Arc<NotificationRouter>) -> Self {
        Self {
            bindings: Vec::new(),
            connections: Mutex::new(HashMap::new()),
            root_dir: root_dir.into(),
            router,
        }
    }

    /// Append a binding. It is only reached when no earlier pattern matches.
    pub fn register(&mut self, pattern: &str, transport: Transport) -> ProxyResult<()> {
        let binding = ServerBinding::new(pattern, transport)?;
        debug!("Registered {} -> {}", binding.pattern, binding.transport);
        self.bindings.push(binding);
        Ok(())
    }

    pub fn bindings(&self) -> &[ServerBinding] {
        &self.bindings
    }

    /// Index of the first binding whose pattern matches `filename`
    pub fn binding_index(&self, filename: &str) -> ProxyResult<usize> {
        self.bindings
            .iter()
            .position(|binding| binding.matches(filename))
            .ok_or_else(|| ProxyError::NoServerForFile(filename.to_string()))
    }

    /// Connection for `filename`, established and initialized on first use
    pub async fn resolve(&self, filename: &str) -> ProxyResult<Arc<ServerConnection>> {
        let index = self.binding_index(filename)?;

        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(&index) {
            if !connection.is_closed().await {
                return Ok(Arc::clone(connection));
            }
            info!("Discarding closed connection to {}", connection.name());
            connections.remove(&index);
        }

        let connection = Arc::new(self.connect(&self.bindings[index]).await?);
        connection.initialize(&self.root_dir).await?;

        connections.insert(index, Arc::clone(&connection));
        Ok(connection)
    }

    async fn connect(&self, binding: &ServerBinding) -> ProxyResult<ServerConnection> {
        let name = binding.transport.to_string();
        let router = Arc::clone(&self.router);

        match &binding.transport {
            Transport::Spawn { command, args } => {
                ServerConnection::spawn(name, command, args, &self.root_dir, router)
            }
            Transport::Dial { address } => ServerConnection::dial(name, address, router).await,
        }
    }

    /// Get all live connections
    pub async fn active_servers(&self) -> Vec<String> {
        let connections = self.connections.lock().await;
        let mut names = Vec::new();
        for (index, connection) in connections.iter() {
            if !connection.is_closed().await {
                names.push(format!("{} ({})", self.bindings[*index].pattern, connection.name()));
            }
        }
        names.sort();
        names
    }

    /// Shutdown all language servers
    pub async fn shutdown_all(&self) {
        info!("Shutting down all LSP servers");

        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, connection) in connections {
            if connection.is_closed().await {
                continue;
            }
            if let Err(e) = connection.shutdown().await {
                warn!("Error shutting down {}: {}", connection.name(), e);
            }
        }

        info!("All LSP servers shut down");
    }
}
