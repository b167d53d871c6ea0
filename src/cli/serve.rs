use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::control::{ControlListener, ControlServer, Endpoint};
use crate::editor::StdoutSink;
use crate::events::{EventBridge, EventHub};
use crate::lsp::{CommandDispatcher, NotificationRouter, OutputContext, ServerRegistry};

/// Run the proxy daemon
#[derive(Args)]
pub struct ServeCommand {
    /// Format files when they are saved
    #[arg(long = "format-on-save")]
    pub format_on_save: bool,
}

impl ServeCommand {
    pub async fn execute(&self, mut config: Config) -> Result<()> {
        if self.format_on_save {
            config.format_on_save = true;
        }

        // Validate the configuration
        config.validate()?;

        let router = Arc::new(NotificationRouter::new(OutputContext {
            debug: config.debug,
            sink: Arc::new(StdoutSink),
        }));

        let root_dir = config.absolute_root()?;
        let mut registry = ServerRegistry::new(&root_dir, router);
        for server in &config.servers {
            registry.register(&server.pattern, server.transport()?)?;
        }
        info!(
            "Serving {} bindings for {}",
            registry.bindings().len(),
            root_dir.display()
        );

        let registry = Arc::new(registry);
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry)));
        let hub = Arc::new(EventHub::new());
        let bridge = Arc::new(EventBridge::new(
            Arc::clone(&dispatcher),
            config.format_on_save,
        ));

        let listener = ControlListener::bind(&Endpoint::parse(&config.listen)).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let events = hub.subscribe();
        let bridge_task = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            let shutdown = shutdown_rx.clone();
            async move { bridge.run(events, shutdown).await }
        });

        let server = Arc::new(ControlServer::new(dispatcher, hub, bridge));
        let server_task = tokio::spawn(server.serve(listener, shutdown_rx));

        wait_for_signal().await?;

        let _ = shutdown_tx.send(true);
        let _ = server_task.await;
        let _ = bridge_task.await;
        registry.shutdown_all().await;

        info!("lsproxy stopped");
        Ok(())
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down gracefully");
    }

    debug!("Signal handling finished");
    Ok(())
}
