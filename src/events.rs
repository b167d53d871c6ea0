//! Editor lifecycle events and the bridge that turns them into LSP calls

use crate::editor::{Cursor, FileBuffer, FileEditor, TextBuffer};
use crate::lsp::{CommandDispatcher, ProxyResult};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Things that happen to files in the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorEvent {
    /// A file was opened in a window
    Opened { path: PathBuf },

    /// A file was written to disk
    Saved { path: PathBuf },

    /// The last window on a file was closed
    Closed { path: PathBuf },

    /// A window on the file gained focus
    Focused { path: PathBuf },
}

impl EditorEvent {
    pub fn path(&self) -> &Path {
        match self {
            EditorEvent::Opened { path }
            | EditorEvent::Saved { path }
            | EditorEvent::Closed { path }
            | EditorEvent::Focused { path } => path,
        }
    }
}

/// Fan-out of editor events to any number of subscribers
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EditorEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new subscription. Dropping the stream ends it.
    pub fn subscribe(&self) -> UnboundedReceiverStream<EditorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Deliver `event` to every live subscriber. Returns how many got it.
    pub fn publish(&self, event: EditorEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<EditorEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Consumes editor events and forwards them to the language servers.
///
/// Opened files are sent with `didOpen`, closed ones with `didClose`. A save
/// resends the text and, when enabled, formats the file. Focus changes only
/// update the focused file.
pub struct EventBridge {
    dispatcher: Arc<CommandDispatcher>,
    format_on_save: bool,
    focused: Mutex<Option<PathBuf>>,
}

impl EventBridge {
    pub fn new(dispatcher: Arc<CommandDispatcher>, format_on_save: bool) -> Self {
        Self {
            dispatcher,
            format_on_save,
            focused: Mutex::new(None),
        }
    }

    /// File of the most recently focused window
    pub fn focused(&self) -> Option<PathBuf> {
        self.focused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Consume `events` until the stream ends or `shutdown` fires.
    /// Returns the number of events handled.
    pub async fn run<S>(&self, mut events: S, mut shutdown: watch::Receiver<bool>) -> usize
    where
        S: Stream<Item = EditorEvent> + Unpin,
    {
        let mut handled = 0;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!("Failed to handle event for {}: {}", event.path().display(), e);
                        }
                        handled += 1;
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("Event bridge shutting down");
                    break;
                }
            }
        }

        info!("Event bridge stopped after {} events", handled);
        handled
    }

    /// Forward one event
    pub async fn handle(&self, event: &EditorEvent) -> ProxyResult<()> {
        debug!("Editor event {:?}", event);

        match event {
            EditorEvent::Opened { path } => {
                let text = FileBuffer::open(path)?.text()?;
                self.dispatcher.did_open(path, &text).await
            }
            EditorEvent::Saved { path } => {
                let text = FileBuffer::open(path)?.text()?;
                self.dispatcher.did_open(path, &text).await?;
                if self.format_on_save {
                    let editor = FileEditor::new(path, Cursor::default());
                    self.dispatcher.format_file(&editor, path).await?;
                }
                Ok(())
            }
            EditorEvent::Closed { path } => self.dispatcher.did_close(path).await,
            EditorEvent::Focused { path } => {
                *self
                    .focused
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path.clone());
                Ok(())
            }
        }
    }
}
