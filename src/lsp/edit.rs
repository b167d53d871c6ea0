//! Applying LSP text edits to a live buffer

use crate::editor::TextBuffer;
use crate::lsp::errors::{ProxyError, ProxyResult};
use lsp_types::{Position, TextEdit};
use tracing::debug;

/// Line start offsets of a text snapshot.
///
/// Converts between byte offsets and LSP positions, where `character`
/// counts UTF-16 code units within the line.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { text, line_starts }
    }

    #[cfg(test)]
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Byte offset of `position`, clamped to the line and to the buffer.
    pub fn position_to_offset(&self, position: Position) -> usize {
        let line = position.line as usize;
        if line >= self.line_starts.len() {
            return self.text.len();
        }

        let start = self.line_starts[line];
        let mut end = self
            .line_starts
            .get(line + 1)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        // A CRLF line ends before its '\r'
        if end > start && self.text.as_bytes()[end - 1] == b'\r' && end < self.text.len() {
            end -= 1;
        }

        let wanted = position.character as usize;
        let mut units = 0;
        for (i, ch) in self.text[start..end].char_indices() {
            if units >= wanted {
                return start + i;
            }
            units += ch.len_utf16();
            if units > wanted {
                // Position points inside a surrogate pair
                return start + i;
            }
        }
        end
    }

    /// Position of the byte offset, rounded down to a char boundary.
    pub fn offset_to_position(&self, offset: usize) -> Position {
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset -= 1;
        }

        let line = self.line_starts.partition_point(|&start| start <= offset) - 1;
        let start = self.line_starts[line];
        let character: usize = self.text[start..offset].chars().map(char::len_utf16).sum();

        Position::new(line as u32, character as u32)
    }
}

/// Apply `edits` to `buffer`.
///
/// All ranges are resolved against one snapshot taken before the first
/// change, and the edits are applied from the last one backwards so that no
/// applied edit shifts a range that is still pending. The whole batch shares
/// a single undo mark. Overlapping edits are not detected.
pub fn apply_edits(buffer: &mut dyn TextBuffer, edits: &[TextEdit]) -> ProxyResult<()> {
    if edits.is_empty() {
        return Ok(());
    }

    let snapshot = buffer.text()?;
    let index = LineIndex::new(&snapshot);

    let mut edits: Vec<&TextEdit> = edits.iter().collect();
    edits.sort_by_key(|edit| (edit.range.start.line, edit.range.start.character));

    buffer.disable_auto_mark()?;
    buffer.mark_undo()?;

    for (applied, edit) in edits.iter().rev().enumerate() {
        let start = index.position_to_offset(edit.range.start);
        let end = index.position_to_offset(edit.range.end).max(start);

        buffer.replace(start..end, &edit.new_text).map_err(|e| {
            ProxyError::EditApply(format!(
                "edit {} of {} at {}:{} failed: {}",
                applied + 1,
                edits.len(),
                edit.range.start.line + 1,
                edit.range.start.character + 1,
                e
            ))
        })?;
    }

    debug!("Applied {} edits", edits.len());
    Ok(())
}
