//! Boundary to the editing environment
//!
//! The proxy never owns a real editor. Everything it needs from one (the
//! current file and selection, a mutable buffer, somewhere to show output and
//! somewhere to jump to) is expressed by the traits in this module.

use crate::lsp::errors::{ProxyError, ProxyResult};
use lsp_types::{Location, Position};
use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// A live text buffer addressed by byte offset
pub trait TextBuffer: Send {
    /// Entire buffer contents
    fn text(&self) -> ProxyResult<String>;

    /// Replace the bytes in `range` with `text`
    fn replace(&mut self, range: Range<usize>, text: &str) -> ProxyResult<()>;

    /// Mark the buffer for a later undo
    fn mark_undo(&mut self) -> ProxyResult<()>;

    /// Turn off the undo marks that `replace` would otherwise create
    fn disable_auto_mark(&mut self) -> ProxyResult<()>;

    /// Persist pending changes, if the buffer is backed by something
    fn flush(&mut self) -> ProxyResult<()> {
        Ok(())
    }
}

/// Where the user's selection starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Byte offset into the buffer
    Offset(usize),
    /// Zero-based line and UTF-16 character
    Position(Position),
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Offset(0)
    }
}

/// The editor collaborator
pub trait Editor: Send + Sync {
    /// File of the current window
    fn current_file(&self) -> ProxyResult<PathBuf>;

    /// Start of the current selection
    fn cursor(&self) -> ProxyResult<Cursor>;

    /// Open a buffer for `path`
    fn open_buffer(&self, path: &Path) -> ProxyResult<Box<dyn TextBuffer>>;
}

/// Presents a location to the user
pub trait NavigationSink: Send + Sync {
    fn navigate(&self, location: &Location) -> ProxyResult<()>;
}

/// Shows unsolicited server output
pub trait DisplaySink: Send + Sync {
    /// Replace the whole diagnostics display with `report`
    fn show_diagnostics(&self, report: &str);

    /// Show a single message line
    fn show_message(&self, text: &str);
}

/// Buffer held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    text: String,
    undo_marks: usize,
    manual_marks_only: bool,
}

impl MemoryBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            undo_marks: 0,
            manual_marks_only: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of undo marks recorded so far
    #[cfg(test)]
    pub fn undo_marks(&self) -> usize {
        self.undo_marks
    }
}

impl TextBuffer for MemoryBuffer {
    fn text(&self) -> ProxyResult<String> {
        Ok(self.text.clone())
    }

    fn replace(&mut self, range: Range<usize>, text: &str) -> ProxyResult<()> {
        if range.start > range.end
            || range.end > self.text.len()
            || !self.text.is_char_boundary(range.start)
            || !self.text.is_char_boundary(range.end)
        {
            return Err(ProxyError::EditApply(format!(
                "range {}..{} is not valid in a buffer of {} bytes",
                range.start,
                range.end,
                self.text.len()
            )));
        }

        self.text.replace_range(range, text);
        if !self.manual_marks_only {
            self.undo_marks += 1;
        }
        Ok(())
    }

    fn mark_undo(&mut self) -> ProxyResult<()> {
        self.undo_marks += 1;
        Ok(())
    }

    fn disable_auto_mark(&mut self) -> ProxyResult<()> {
        self.manual_marks_only = true;
        Ok(())
    }
}

/// Buffer loaded from disk and written back on `flush`
#[derive(Debug)]
pub struct FileBuffer {
    path: PathBuf,
    buffer: MemoryBuffer,
    dirty: bool,
}

impl FileBuffer {
    pub fn open(path: &Path) -> ProxyResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Editor(format!("failed to read {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            buffer: MemoryBuffer::new(text),
            dirty: false,
        })
    }
}

impl TextBuffer for FileBuffer {
    fn text(&self) -> ProxyResult<String> {
        self.buffer.text()
    }

    fn replace(&mut self, range: Range<usize>, text: &str) -> ProxyResult<()> {
        self.buffer.replace(range, text)?;
        self.dirty = true;
        Ok(())
    }

    fn mark_undo(&mut self) -> ProxyResult<()> {
        self.buffer.mark_undo()
    }

    fn disable_auto_mark(&mut self) -> ProxyResult<()> {
        self.buffer.disable_auto_mark()
    }

    fn flush(&mut self) -> ProxyResult<()> {
        if self.dirty {
            std::fs::write(&self.path, self.buffer.as_str()).map_err(|e| {
                ProxyError::EditApply(format!("failed to write {}: {}", self.path.display(), e))
            })?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Editor over files on disk, with a fixed current file and cursor
#[derive(Debug, Clone)]
pub struct FileEditor {
    file: PathBuf,
    cursor: Cursor,
}

impl FileEditor {
    pub fn new(file: impl Into<PathBuf>, cursor: Cursor) -> Self {
        Self {
            file: file.into(),
            cursor,
        }
    }
}

impl Editor for FileEditor {
    fn current_file(&self) -> ProxyResult<PathBuf> {
        Ok(self.file.clone())
    }

    fn cursor(&self) -> ProxyResult<Cursor> {
        Ok(self.cursor)
    }

    fn open_buffer(&self, path: &Path) -> ProxyResult<Box<dyn TextBuffer>> {
        Ok(Box::new(FileBuffer::open(path)?))
    }
}

/// Navigation sink that records every location it is sent
#[derive(Debug, Default)]
pub struct LocationLog {
    locations: Mutex<Vec<Location>>,
}

impl LocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Location> {
        match self.locations.lock() {
            Ok(mut locations) => std::mem::take(&mut *locations),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl NavigationSink for LocationLog {
    fn navigate(&self, location: &Location) -> ProxyResult<()> {
        self.locations
            .lock()
            .map_err(|_| ProxyError::Editor("location log poisoned".to_string()))?
            .push(location.clone());
        Ok(())
    }
}

/// Display sink that prints to standard output
#[derive(Debug, Default)]
pub struct StdoutSink;

impl DisplaySink for StdoutSink {
    fn show_diagnostics(&self, report: &str) {
        println!("{}", report.trim_end());
    }

    fn show_message(&self, text: &str) {
        println!("{}", text);
    }
}

/// Display sink that keeps everything it is shown
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub diagnostics: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<String>>,
}

#[cfg(test)]
impl DisplaySink for MemorySink {
    fn show_diagnostics(&self, report: &str) {
        self.diagnostics.lock().unwrap().push(report.to_string());
    }

    fn show_message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}
