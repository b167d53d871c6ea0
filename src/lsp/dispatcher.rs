//! Editor-level operations on top of the registry

use crate::editor::{Cursor, Editor, NavigationSink};
use crate::lsp::{
    connection::ServerConnection,
    edit::{apply_edits, LineIndex},
    errors::ProxyResult,
    registry::ServerRegistry,
    types::*,
};
use lsp_types::{
    CompletionItem, CompletionResponse, DocumentChangeOperation, DocumentChanges, DocumentSymbol,
    DocumentSymbolResponse, Documentation, GotoDefinitionResponse, Hover, HoverContents, Location,
    MarkedString, OneOf, Position, SignatureHelp, SymbolKind, TextEdit, Uri, WorkspaceEdit,
};
use serde_json::{json, Value};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// File, connection and position a positional query is made for
struct Target {
    path: PathBuf,
    uri: Uri,
    connection: Arc<ServerConnection>,
    position: Position,
}

impl Target {
    fn document(&self) -> Value {
        json!({ "textDocument": { "uri": self.uri.as_str() } })
    }

    fn position_params(&self) -> Value {
        json!({
            "textDocument": { "uri": self.uri.as_str() },
            "position": self.position,
        })
    }
}

/// One operation per supported LSP capability
pub struct CommandDispatcher {
    registry: Arc<ServerRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Resolve the editor's current file, open it on its server if needed
    /// and convert the cursor to a protocol position.
    async fn target(&self, editor: &dyn Editor) -> ProxyResult<Target> {
        let path = editor.current_file()?;
        let cursor = editor.cursor()?;
        let text = editor.open_buffer(&path)?.text()?;

        let connection = self.registry.resolve(&path.to_string_lossy()).await?;
        let uri = path_to_uri(&path)?;
        ensure_open(&connection, &path, &uri, &text).await?;

        let position = match cursor {
            Cursor::Offset(offset) => LineIndex::new(&text).offset_to_position(offset),
            Cursor::Position(position) => position,
        };

        Ok(Target {
            path,
            uri,
            connection,
            position,
        })
    }

    /// Send every definition location to `nav`, in server order
    pub async fn definition(
        &self,
        editor: &dyn Editor,
        nav: &dyn NavigationSink,
    ) -> ProxyResult<Vec<Location>> {
        let target = self.target(editor).await?;
        let response: Option<GotoDefinitionResponse> = target
            .connection
            .call(methods::TEXT_DOCUMENT_DEFINITION, target.position_params())
            .await?;

        let locations = definition_locations(response);
        debug!("{} definitions for {}", locations.len(), target.path.display());
        for location in &locations {
            nav.navigate(location)?;
        }
        Ok(locations)
    }

    pub async fn hover(&self, editor: &dyn Editor) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let hover: Option<Hover> = target
            .connection
            .call(methods::TEXT_DOCUMENT_HOVER, target.position_params())
            .await?;
        Ok(render_hover(hover))
    }

    pub async fn references(&self, editor: &dyn Editor) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let mut params = target.position_params();
        params["context"] = json!({ "includeDeclaration": true });

        let locations: Option<Vec<Location>> = target
            .connection
            .call(methods::TEXT_DOCUMENT_REFERENCES, params)
            .await?;
        Ok(render_references(locations.unwrap_or_default()))
    }

    pub async fn symbols(&self, editor: &dyn Editor) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let response: Option<DocumentSymbolResponse> = target
            .connection
            .call(methods::TEXT_DOCUMENT_DOCUMENT_SYMBOL, target.document())
            .await?;
        Ok(render_symbols(&flatten_symbols(&target.uri, response)))
    }

    pub async fn completion(&self, editor: &dyn Editor) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let mut params = target.position_params();
        params["context"] = json!({ "triggerKind": 1 });

        let response: Option<CompletionResponse> = target
            .connection
            .call(methods::TEXT_DOCUMENT_COMPLETION, params)
            .await?;
        let items = match response {
            Some(CompletionResponse::Array(items)) => items,
            Some(CompletionResponse::List(list)) => list.items,
            None => Vec::new(),
        };
        Ok(render_completion(&items))
    }

    pub async fn signature_help(&self, editor: &dyn Editor) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let help: Option<SignatureHelp> = target
            .connection
            .call(methods::TEXT_DOCUMENT_SIGNATURE_HELP, target.position_params())
            .await?;
        Ok(render_signatures(help))
    }

    /// Rename the symbol under the cursor and apply the workspace edit,
    /// one file at a time in URI order.
    pub async fn rename(&self, editor: &dyn Editor, new_name: &str) -> ProxyResult<String> {
        let target = self.target(editor).await?;
        let mut params = target.position_params();
        params["newName"] = json!(new_name);

        let edit: Option<WorkspaceEdit> = target
            .connection
            .call(methods::TEXT_DOCUMENT_RENAME, params)
            .await?;

        let mut report = String::new();
        for (uri, edits) in workspace_edits(edit.unwrap_or_default()).into_values() {
            let path = uri_to_path(&uri);
            let text = {
                let mut buffer = editor.open_buffer(&path)?;
                apply_edits(buffer.as_mut(), &edits)?;
                buffer.flush()?;
                buffer.text()?
            };
            target.connection.change_file(uri.as_str(), &text).await?;

            let _ = writeln!(report, "{}: {} edits", path.display(), edits.len());
        }

        info!("Renamed to '{}' in {}", new_name, target.path.display());
        Ok(report)
    }

    /// Format the editor's current file
    pub async fn format(&self, editor: &dyn Editor) -> ProxyResult<usize> {
        let path = editor.current_file()?;
        self.format_file(editor, &path).await
    }

    /// Request formatting edits for `path` and apply them to its buffer.
    /// Returns the number of edits applied.
    pub async fn format_file(&self, editor: &dyn Editor, path: &Path) -> ProxyResult<usize> {
        let connection = self.registry.resolve(&path.to_string_lossy()).await?;
        let uri = path_to_uri(path)?;

        let text = editor.open_buffer(path)?.text()?;
        ensure_open(&connection, path, &uri, &text).await?;

        let edits: Option<Vec<TextEdit>> = connection
            .call(
                methods::TEXT_DOCUMENT_FORMATTING,
                json!({
                    "textDocument": { "uri": uri.as_str() },
                    "options": { "tabSize": 4, "insertSpaces": true },
                }),
            )
            .await?;
        let edits = edits.unwrap_or_default();
        if edits.is_empty() {
            return Ok(0);
        }

        let text = {
            let mut buffer = editor.open_buffer(path)?;
            apply_edits(buffer.as_mut(), &edits)?;
            buffer.flush()?;
            buffer.text()?
        };
        connection.change_file(uri.as_str(), &text).await?;

        debug!("Formatted {} with {} edits", path.display(), edits.len());
        Ok(edits.len())
    }

    /// Tell the owning server that `path` was opened with `text`.
    /// A document that is already open gets its text replaced instead.
    pub async fn did_open(&self, path: &Path, text: &str) -> ProxyResult<()> {
        let connection = self.registry.resolve(&path.to_string_lossy()).await?;
        let uri = path_to_uri(path)?;

        if !connection.change_file(uri.as_str(), text).await? {
            connection
                .open_file(uri.as_str(), &language_id(path), text)
                .await?;
        }
        Ok(())
    }

    pub async fn did_close(&self, path: &Path) -> ProxyResult<()> {
        let connection = self.registry.resolve(&path.to_string_lossy()).await?;
        let uri = path_to_uri(path)?;

        if connection.is_open(uri.as_str()).await {
            connection.close_file(uri.as_str()).await?;
        } else {
            debug!("{} is not open on {}", path.display(), connection.name());
        }
        Ok(())
    }
}

async fn ensure_open(
    connection: &ServerConnection,
    path: &Path,
    uri: &Uri,
    text: &str,
) -> ProxyResult<()> {
    if !connection.is_open(uri.as_str()).await {
        connection
            .open_file(uri.as_str(), &language_id(path), text)
            .await?;
    }
    Ok(())
}

fn definition_locations(response: Option<GotoDefinitionResponse>) -> Vec<Location> {
    match response {
        Some(GotoDefinitionResponse::Scalar(location)) => vec![location],
        Some(GotoDefinitionResponse::Array(locations)) => locations,
        Some(GotoDefinitionResponse::Link(links)) => links
            .into_iter()
            .map(|link| Location::new(link.target_uri, link.target_selection_range))
            .collect(),
        None => Vec::new(),
    }
}

fn marked_string(value: MarkedString) -> String {
    match value {
        MarkedString::String(text) => text,
        MarkedString::LanguageString(code) => code.value,
    }
}

fn render_hover(hover: Option<Hover>) -> String {
    let lines = match hover.map(|h| h.contents) {
        Some(HoverContents::Scalar(value)) => vec![marked_string(value)],
        Some(HoverContents::Array(values)) => values.into_iter().map(marked_string).collect(),
        Some(HoverContents::Markup(markup)) => vec![markup.value],
        None => Vec::new(),
    };

    lines.into_iter().fold(String::new(), |mut out, line| {
        out.push_str(&line);
        out.push('\n');
        out
    })
}

fn compare_locations(a: &Location, b: &Location) -> Ordering {
    a.uri
        .as_str()
        .cmp(b.uri.as_str())
        .then(a.range.start.line.cmp(&b.range.start.line))
        .then(a.range.start.character.cmp(&b.range.start.character))
}

/// Sorted reference listing, or an explicit line when there is nothing to show
pub fn render_references(mut locations: Vec<Location>) -> String {
    if locations.is_empty() {
        return "No references found.\n".to_string();
    }

    locations.sort_by(compare_locations);

    let mut out = String::from("References:\n");
    for location in &locations {
        let _ = writeln!(out, " {}", location_link(location));
    }
    out
}

/// A document symbol reduced to what is displayed
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolEntry {
    pub container: String,
    pub name: String,
    pub kind: String,
    pub location: Location,
}

fn symbol_kind_name(kind: SymbolKind) -> String {
    let name = match kind {
        SymbolKind::FILE => "File",
        SymbolKind::MODULE => "Module",
        SymbolKind::NAMESPACE => "Namespace",
        SymbolKind::PACKAGE => "Package",
        SymbolKind::CLASS => "Class",
        SymbolKind::METHOD => "Method",
        SymbolKind::PROPERTY => "Property",
        SymbolKind::FIELD => "Field",
        SymbolKind::CONSTRUCTOR => "Constructor",
        SymbolKind::ENUM => "Enum",
        SymbolKind::INTERFACE => "Interface",
        SymbolKind::FUNCTION => "Function",
        SymbolKind::VARIABLE => "Variable",
        SymbolKind::CONSTANT => "Constant",
        SymbolKind::STRING => "String",
        SymbolKind::NUMBER => "Number",
        SymbolKind::BOOLEAN => "Boolean",
        SymbolKind::ARRAY => "Array",
        SymbolKind::OBJECT => "Object",
        SymbolKind::KEY => "Key",
        SymbolKind::NULL => "Null",
        SymbolKind::ENUM_MEMBER => "EnumMember",
        SymbolKind::STRUCT => "Struct",
        SymbolKind::EVENT => "Event",
        SymbolKind::OPERATOR => "Operator",
        SymbolKind::TYPE_PARAMETER => "TypeParameter",
        other => return serde_json::to_string(&other).unwrap_or_default(),
    };
    name.to_string()
}

fn flatten_nested(uri: &Uri, container: &str, symbols: Vec<DocumentSymbol>, out: &mut Vec<SymbolEntry>) {
    for symbol in symbols {
        out.push(SymbolEntry {
            container: container.to_string(),
            name: symbol.name.clone(),
            kind: symbol_kind_name(symbol.kind),
            location: Location::new(uri.clone(), symbol.range),
        });
        if let Some(children) = symbol.children {
            flatten_nested(uri, &symbol.name, children, out);
        }
    }
}

/// Flat symbol list in server order. Nested symbols are visited depth-first
/// and carry their parent's name as the container.
pub fn flatten_symbols(uri: &Uri, response: Option<DocumentSymbolResponse>) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    match response {
        Some(DocumentSymbolResponse::Flat(symbols)) => {
            entries.extend(symbols.into_iter().map(|symbol| SymbolEntry {
                container: symbol.container_name.unwrap_or_default(),
                name: symbol.name,
                kind: symbol_kind_name(symbol.kind),
                location: symbol.location,
            }));
        }
        Some(DocumentSymbolResponse::Nested(symbols)) => {
            flatten_nested(uri, "", symbols, &mut entries)
        }
        None => {}
    }
    entries
}

pub fn render_symbols(symbols: &[SymbolEntry]) -> String {
    if symbols.is_empty() {
        return "No symbols found.\n".to_string();
    }

    let mut out = String::from("Symbols:\n");
    for symbol in symbols {
        out.push(' ');
        if !symbol.container.is_empty() {
            out.push_str(&symbol.container);
            out.push(' ');
        }
        let _ = writeln!(
            out,
            "{} {} {}",
            symbol.name,
            symbol.kind,
            location_link(&symbol.location)
        );
    }
    out
}

pub fn render_completion(items: &[CompletionItem]) -> String {
    if items.is_empty() {
        return "No completion.\n".to_string();
    }

    let mut out = String::new();
    for item in items {
        out.push_str(&item.label);
        if let Some(detail) = item.detail.as_deref().filter(|d| !d.is_empty()) {
            out.push(' ');
            out.push_str(detail);
        }
        out.push('\n');
    }
    out
}

fn render_signatures(help: Option<SignatureHelp>) -> String {
    let mut out = String::new();
    for signature in help.map(|h| h.signatures).unwrap_or_default() {
        let _ = writeln!(out, "{}", signature.label);
        match signature.documentation {
            Some(Documentation::String(text)) => {
                let _ = writeln!(out, "{}", text);
            }
            Some(Documentation::MarkupContent(markup)) => {
                let _ = writeln!(out, "{}", markup.value);
            }
            None => {}
        }
    }
    out
}

/// Per-file edits of a workspace edit, keyed and ordered by URI.
///
/// `documentChanges` takes precedence over `changes` when a server sends
/// both. Resource operations (create, rename, delete) are skipped.
pub fn workspace_edits(edit: WorkspaceEdit) -> BTreeMap<String, (Uri, Vec<TextEdit>)> {
    let mut files: BTreeMap<String, (Uri, Vec<TextEdit>)> = BTreeMap::new();
    let mut add = |uri: Uri, edits: Vec<TextEdit>| {
        files
            .entry(uri.as_str().to_string())
            .or_insert_with(|| (uri, Vec::new()))
            .1
            .extend(edits);
    };

    let document_edits = match edit.document_changes {
        Some(DocumentChanges::Edits(edits)) => edits,
        Some(DocumentChanges::Operations(operations)) => operations
            .into_iter()
            .filter_map(|operation| match operation {
                DocumentChangeOperation::Edit(edit) => Some(edit),
                DocumentChangeOperation::Op(op) => {
                    warn!("Skipping resource operation {:?}", op);
                    None
                }
            })
            .collect(),
        None => {
            for (uri, edits) in edit.changes.unwrap_or_default() {
                add(uri, edits);
            }
            Vec::new()
        }
    };

    for document in document_edits {
        let edits = document
            .edits
            .into_iter()
            .map(|edit| match edit {
                OneOf::Left(edit) => edit,
                OneOf::Right(annotated) => annotated.text_edit,
            })
            .collect();
        add(document.text_document.uri, edits);
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{FileEditor, LocationLog};
    use crate::lsp::errors::ProxyError;
    use crate::lsp::testing::{quiet_router, script, FakeServer, Reply, Script};
    use lsp_types::Range;
    use std::sync::atomic::Ordering as AtomicOrdering;

    /// Dispatcher whose `.go` files go to a fake server running `script`
    async fn dispatcher(script: Script) -> CommandDispatcher {
        let (address, _) = FakeServer::listen(script).await;
        let mut registry = ServerRegistry::new("/", quiet_router());
        registry
            .register(r"\.go$", Transport::Dial { address })
            .unwrap();
        CommandDispatcher::new(Arc::new(registry))
    }

    fn go_file(dir: &tempfile::TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn location(uri: &str, line: u32, character: u32) -> Location {
        Location::new(
            uri.parse().unwrap(),
            Range::new(Position::new(line, character), Position::new(line, character + 3)),
        )
    }

    #[test]
    fn test_references_sorted_by_uri_then_position() {
        let out = render_references(vec![
            location("file:///src/b.go", 2, 0),
            location("file:///src/a.go", 7, 4),
            location("file:///src/a.go", 0, 9),
            location("file:///src/a.go", 0, 2),
        ]);
        assert_eq!(
            out,
            "References:\n /src/a.go:1:3-1:6\n /src/a.go:1:10-1:13\n /src/a.go:8:5-8:8\n /src/b.go:3:1-3:4\n"
        );
    }

    #[test]
    fn test_empty_results_print_explicit_lines() {
        assert_eq!(render_references(Vec::new()), "No references found.\n");
        assert_eq!(render_completion(&[]), "No completion.\n");
        assert_eq!(render_symbols(&[]), "No symbols found.\n");
        assert_eq!(render_hover(None), "");
    }

    #[test]
    fn test_nested_symbols_are_flattened() {
        let uri: Uri = "file:///src/a.go".parse().unwrap();
        let response: DocumentSymbolResponse = serde_json::from_value(json!([{
            "name": "Server",
            "kind": 23,
            "range": {"start": {"line": 2, "character": 0}, "end": {"line": 9, "character": 1}},
            "selectionRange": {"start": {"line": 2, "character": 5}, "end": {"line": 2, "character": 11}},
            "children": [{
                "name": "addr",
                "kind": 8,
                "range": {"start": {"line": 3, "character": 1}, "end": {"line": 3, "character": 12}},
                "selectionRange": {"start": {"line": 3, "character": 1}, "end": {"line": 3, "character": 5}}
            }]
        }, {
            "name": "main",
            "kind": 12,
            "range": {"start": {"line": 11, "character": 0}, "end": {"line": 13, "character": 1}},
            "selectionRange": {"start": {"line": 11, "character": 5}, "end": {"line": 11, "character": 9}}
        }]))
        .unwrap();

        let symbols = flatten_symbols(&uri, Some(response));
        let names: Vec<_> = symbols
            .iter()
            .map(|s| (s.container.as_str(), s.name.as_str()))
            .collect();
        assert_eq!(names, [("", "Server"), ("Server", "addr"), ("", "main")]);

        assert_eq!(
            render_symbols(&symbols),
            "Symbols:\n Server Struct /src/a.go:3:1-10:2\n Server addr Field /src/a.go:4:2-4:13\n main Function /src/a.go:12:1-14:2\n"
        );
    }

    #[test]
    fn test_flat_symbols_keep_server_order() {
        let uri: Uri = "file:///src/a.py".parse().unwrap();
        let response: DocumentSymbolResponse = serde_json::from_value(json!([
            {
                "name": "run",
                "kind": 6,
                "containerName": "Job",
                "location": {
                    "uri": "file:///src/a.py",
                    "range": {"start": {"line": 4, "character": 4}, "end": {"line": 4, "character": 7}}
                }
            },
            {
                "name": "Job",
                "kind": 5,
                "location": {
                    "uri": "file:///src/a.py",
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}}
                }
            }
        ]))
        .unwrap();

        let symbols = flatten_symbols(&uri, Some(response));
        assert_eq!(symbols[0].container, "Job");
        assert_eq!(symbols[0].kind, "Method");
        assert_eq!(symbols[1].name, "Job");
    }

    #[test]
    fn test_completion_in_server_order() {
        let items: Vec<CompletionItem> = serde_json::from_value(json!([
            {"label": "Println", "detail": "func(a ...any)"},
            {"label": "Printf"},
            {"label": "Print", "detail": ""}
        ]))
        .unwrap();
        assert_eq!(
            render_completion(&items),
            "Println func(a ...any)\nPrintf\nPrint\n"
        );
    }

    #[test]
    fn test_hover_and_signature_rendering() {
        let hover: Hover = serde_json::from_value(json!({
            "contents": [{"language": "go", "value": "func main()"}, "Entry point"]
        }))
        .unwrap();
        assert_eq!(render_hover(Some(hover)), "func main()\nEntry point\n");

        let help: SignatureHelp = serde_json::from_value(json!({
            "signatures": [
                {"label": "add(a, b int) int", "documentation": "Adds two ints"},
                {"label": "add()", "documentation": {"kind": "markdown", "value": "*none*"}}
            ]
        }))
        .unwrap();
        assert_eq!(
            render_signatures(Some(help)),
            "add(a, b int) int\nAdds two ints\nadd()\n*none*\n"
        );
    }

    #[test]
    fn test_workspace_edits_ordered_by_uri() {
        let edit: WorkspaceEdit = serde_json::from_value(json!({
            "changes": {
                "file:///src/b.go": [{"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}, "newText": "B"}],
                "file:///src/a.go": [{"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 1}}, "newText": "A"}]
            }
        }))
        .unwrap();

        let files = workspace_edits(edit);
        let uris: Vec<_> = files.keys().cloned().collect();
        assert_eq!(uris, ["file:///src/a.go", "file:///src/b.go"]);
    }

    #[test]
    fn test_document_changes_accepted() {
        let edit: WorkspaceEdit = serde_json::from_value(json!({
            "documentChanges": [
                {"kind": "create", "uri": "file:///src/new.go"},
                {
                    "textDocument": {"uri": "file:///src/a.go", "version": 3},
                    "edits": [
                        {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}, "newText": "x"},
                        {"range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 1}}, "newText": "y", "annotationId": "rename"}
                    ]
                }
            ]
        }))
        .unwrap();

        let files = workspace_edits(edit);
        assert_eq!(files.len(), 1);
        assert_eq!(files["file:///src/a.go"].1.len(), 2);
        assert_eq!(files["file:///src/a.go"].1[1].new_text, "y");
    }

    #[test]
    fn test_definition_links_reduced_to_locations() {
        let response: GotoDefinitionResponse = serde_json::from_value(json!([{
            "targetUri": "file:///src/a.go",
            "targetRange": {"start": {"line": 0, "character": 0}, "end": {"line": 5, "character": 1}},
            "targetSelectionRange": {"start": {"line": 0, "character": 5}, "end": {"line": 0, "character": 9}}
        }]))
        .unwrap();

        let locations = definition_locations(Some(response));
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].range.start, Position::new(0, 5));
        assert!(definition_locations(None).is_empty());
    }

    #[tokio::test]
    async fn test_definition_opens_file_and_navigates() {
        let dir = tempfile::tempdir().unwrap();
        let path = go_file(&dir, "main.go", "package main\n\nfunc main() {\n\tserve()\n}\n");
        let dispatcher = dispatcher(script(|method, params| match method {
            "textDocument/definition" => {
                let position = &params.unwrap()["position"];
                assert_eq!(position["line"], 3);
                assert_eq!(position["character"], 1);
                Reply::Result(json!({
                    "uri": "file:///src/serve.go",
                    "range": {"start": {"line": 9, "character": 5}, "end": {"line": 9, "character": 10}}
                }))
            }
            _ => Reply::Ignore,
        }))
        .await;

        // Offset of "serve" on line 4
        let offset = "package main\n\nfunc main() {\n\t".len();
        let editor = FileEditor::new(&path, Cursor::Offset(offset));
        let log = LocationLog::new();

        let locations = dispatcher.definition(&editor, &log).await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(location_link(&log.take()[0]), "/src/serve.go:10:6-10:11");

        let connection = dispatcher.registry().resolve("main.go").await.unwrap();
        assert!(connection.is_open(path_to_uri(&path).unwrap().as_str()).await);
    }

    #[tokio::test]
    async fn test_unmatched_file_fails_only_that_operation() {
        let dispatcher = dispatcher(script(|_, _| Reply::Result(Value::Null))).await;
        let dir = tempfile::tempdir().unwrap();
        let path = go_file(&dir, "README.md", "# readme\n");

        let editor = FileEditor::new(&path, Cursor::default());
        let err = dispatcher.hover(&editor).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoServerForFile(_)));
    }

    #[tokio::test]
    async fn test_rpc_error_aborts_operation() {
        let dispatcher = dispatcher(script(|_, _| {
            Reply::Error(crate::lsp::types::LspError::new(-32803, "no identifier"))
        }))
        .await;
        let dir = tempfile::tempdir().unwrap();
        let path = go_file(&dir, "main.go", "package main\n");
        let original = std::fs::read_to_string(&path).unwrap();

        let editor = FileEditor::new(&path, Cursor::default());
        let err = dispatcher.rename(&editor, "other").await.unwrap_err();
        assert!(matches!(err, ProxyError::Rpc { code: -32803, .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn test_rename_applies_edits_to_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = go_file(&dir, "main.go", "package main\n\nfunc main() { run() }\n");
        let lib = go_file(&dir, "lib.go", "package main\n\nfunc run() {}\n");
        let main_uri = path_to_uri(&main).unwrap().as_str().to_string();
        let lib_uri = path_to_uri(&lib).unwrap().as_str().to_string();

        let dispatcher = dispatcher(script(move |method, _| match method {
            "textDocument/rename" => Reply::Result(json!({
                "changes": {
                    main_uri.clone(): [{"range": {"start": {"line": 2, "character": 14}, "end": {"line": 2, "character": 17}}, "newText": "start"}],
                    lib_uri.clone(): [{"range": {"start": {"line": 2, "character": 5}, "end": {"line": 2, "character": 8}}, "newText": "start"}]
                }
            })),
            _ => Reply::Ignore,
        }))
        .await;

        let editor = FileEditor::new(&main, Cursor::Position(Position::new(2, 15)));
        let report = dispatcher.rename(&editor, "start").await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&main).unwrap(),
            "package main\n\nfunc main() { start() }\n"
        );
        assert_eq!(
            std::fs::read_to_string(&lib).unwrap(),
            "package main\n\nfunc start() {}\n"
        );
        assert_eq!(report.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_format_applies_edits_and_resyncs() {
        let (address, accepted) = FakeServer::listen(script(|method, _| match method {
            "textDocument/formatting" => Reply::Result(json!([
                {"range": {"start": {"line": 0, "character": 7}, "end": {"line": 0, "character": 10}}, "newText": " "},
                {"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 0}}, "newText": "\t"}
            ])),
            _ => Reply::Ignore,
        }))
        .await;
        let mut registry = ServerRegistry::new("/", quiet_router());
        registry.register(r"\.go$", Transport::Dial { address }).unwrap();
        let dispatcher = CommandDispatcher::new(Arc::new(registry));

        let dir = tempfile::tempdir().unwrap();
        let path = go_file(&dir, "fmt.go", "package   main\nvar x = 1\n");
        let editor = FileEditor::new(&path, Cursor::default());

        assert_eq!(dispatcher.format(&editor).await.unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "package main\n\tvar x = 1\n"
        );
        assert_eq!(accepted.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_format_without_edits_leaves_file() {
        let dispatcher = dispatcher(script(|_, _| Reply::Result(Value::Null))).await;
        let dir = tempfile::tempdir().unwrap();
        let path = go_file(&dir, "clean.go", "package main\n");
        let editor = FileEditor::new(&path, Cursor::default());

        assert_eq!(dispatcher.format_file(&editor, &path).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "package main\n");
    }

    #[tokio::test]
    async fn test_did_open_and_close() {
        let dispatcher = dispatcher(script(|_, _| Reply::Ignore)).await;
        let path = Path::new("/src/x.go");
        let uri = path_to_uri(path).unwrap();

        dispatcher.did_open(path, "package x\n").await.unwrap();
        let connection = dispatcher.registry().resolve("/src/x.go").await.unwrap();
        assert!(connection.is_open(uri.as_str()).await);

        // Opening again replaces the text rather than opening twice
        dispatcher.did_open(path, "package y\n").await.unwrap();
        assert!(connection.is_open(uri.as_str()).await);

        dispatcher.did_close(path).await.unwrap();
        assert!(!connection.is_open(uri.as_str()).await);
        dispatcher.did_close(path).await.unwrap();
    }
}
