//! Symbol extraction.
//!
//! Runs inside the worker process. The extractor never decides on its own
//! which files to parse: every file it encounters (the main source, each
//! line-marker region of a preprocessed unit, each resolved include of a raw
//! one) goes through the visit-file handshake, and denied files contribute
//! only a dependency edge. Parsing itself is tree-sitter with the C or C++
//! grammar.

use cintel_core::{Diagnostic, DiagnosticKind, IndexData, Location, Symbol, SymbolKind, Unit};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tree_sitter::{Node, Parser};

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("unit error: {0}")]
  Unit(#[from] cintel_core::unit::UnitError),
  #[error("parser rejected the grammar: {0}")]
  Grammar(#[from] tree_sitter::LanguageError),
  #[error("visit-file handshake failed: {0}")]
  Gate(String),
}

/// Answer to "may I parse this file". `file_id` is valid (nonzero) even when
/// the visit is denied, so dependency edges to suspended files still work.
#[derive(Debug, Clone)]
pub struct VisitReply {
  pub file_id: u32,
  pub path: PathBuf,
  pub visit: bool,
}

/// The per-include question the extractor asks its daemon.
pub trait VisitGate {
  fn visit(&mut self, path: &Path) -> impl Future<Output = Result<VisitReply, ExtractError>>;
}

/// Extract an `IndexData` from a unit. Preprocessed units are split on line
/// markers; raw units resolve their own includes.
pub async fn run<G: VisitGate>(
  unit: &Unit,
  job_id: u64,
  fingerprint: u64,
  dirty: bool,
  extra_include_paths: &[PathBuf],
  gate: &mut G,
) -> Result<IndexData, ExtractError> {
  let started = std::time::Instant::now();
  let main = gate.visit(&unit.source_file).await?;
  let mut data = IndexData::new(job_id, fingerprint, main.file_id);
  data.dirty = dirty;

  let mut parser = Parser::new();
  let language = if unit.source.language.is_cxx() {
    tree_sitter_cpp::LANGUAGE
  } else {
    tree_sitter_c::LANGUAGE
  };
  parser.set_language(&language.into())?;

  if !unit.preprocessed.is_empty() {
    let text = unit.preprocessed_text()?;
    extract_preprocessed(&text, &main, gate, &mut parser, &mut data).await?;
  } else {
    let mut include_paths: Vec<PathBuf> = unit.source.include_paths();
    include_paths.extend(extra_include_paths.iter().cloned());
    let mut seen = HashSet::new();
    extract_raw(&unit.source_file, &main, &include_paths, gate, &mut parser, &mut data, &mut seen).await?;
  }

  data.parse_duration_ms = started.elapsed().as_millis() as u64;
  data.message = format!(
    "{} in {}ms. ({} symbols)",
    unit.source_file.display(),
    data.parse_duration_ms,
    data.symbol_count()
  );
  Ok(data)
}

// Preprocessed mode: split on GCC line markers, reassemble per file with the
// original line numbers preserved, parse the files the gate allows.

struct FileBuffer {
  reply: VisitReply,
  /// original line number -> text
  lines: BTreeMap<u32, String>,
}

async fn extract_preprocessed<G: VisitGate>(
  text: &str,
  main: &VisitReply,
  gate: &mut G,
  parser: &mut Parser,
  data: &mut IndexData,
) -> Result<(), ExtractError> {
  let mut buffers: HashMap<PathBuf, FileBuffer> = HashMap::new();
  let mut current: Option<PathBuf> = Some(main.path.clone());
  let mut current_line: u32 = 1;
  buffers.insert(
    main.path.clone(),
    FileBuffer {
      reply: main.clone(),
      lines: BTreeMap::new(),
    },
  );

  for line in text.lines() {
    if let Some((file, line_no)) = parse_line_marker(line) {
      if file.starts_with('<') {
        // <built-in>, <command-line>
        current = None;
        continue;
      }
      let path = PathBuf::from(file);
      if !buffers.contains_key(&path) {
        let reply = gate.visit(&path).await?;
        if reply.file_id != 0 {
          data.add_dependency(main.file_id, reply.file_id);
        }
        buffers.insert(
          path.clone(),
          FileBuffer {
            reply,
            lines: BTreeMap::new(),
          },
        );
      }
      current = Some(path);
      current_line = line_no;
      continue;
    }
    if let Some(ref path) = current
      && let Some(buffer) = buffers.get_mut(path)
    {
      if buffer.reply.visit {
        buffer.lines.insert(current_line, line.to_string());
      }
      current_line += 1;
    }
  }

  for buffer in buffers.into_values() {
    if !buffer.reply.visit || buffer.reply.file_id == 0 {
      continue;
    }
    data.visited.insert(buffer.reply.file_id);
    let content = render_padded(&buffer.lines);
    parse_into(parser, &content, buffer.reply.file_id, data);
  }
  Ok(())
}

/// `# 123 "file.h" flags` or `#line 123 "file.h"`
fn parse_line_marker(line: &str) -> Option<(&str, u32)> {
  let rest = line.strip_prefix('#')?;
  let rest = rest.strip_prefix("line").unwrap_or(rest);
  let rest = rest.trim_start();
  let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
  if digits_end == 0 {
    return None;
  }
  let line_no: u32 = rest[..digits_end].parse().ok()?;
  let rest = rest[digits_end..].trim_start();
  let rest = rest.strip_prefix('"')?;
  let quote = rest.find('"')?;
  Some((&rest[..quote], line_no))
}

fn render_padded(lines: &BTreeMap<u32, String>) -> String {
  let mut out = String::new();
  let max = lines.keys().next_back().copied().unwrap_or(0);
  for line_no in 1..=max {
    if let Some(line) = lines.get(&line_no) {
      out.push_str(line);
    }
    out.push('\n');
  }
  out
}

// Raw mode: parse the main file and chase quoted/angled includes through the
// gate, depth-first.

async fn extract_raw<G: VisitGate>(
  path: &Path,
  reply: &VisitReply,
  include_paths: &[PathBuf],
  gate: &mut G,
  parser: &mut Parser,
  data: &mut IndexData,
  seen: &mut HashSet<PathBuf>,
) -> Result<(), ExtractError> {
  if !seen.insert(path.to_path_buf()) {
    return Ok(());
  }
  if reply.file_id != 0 {
    data.add_dependency(data.file_id, reply.file_id);
  }
  if !reply.visit || reply.file_id == 0 {
    return Ok(());
  }

  let content = match std::fs::read_to_string(path) {
    Ok(content) => content,
    Err(err) => {
      data.diagnostics.push(Diagnostic {
        kind: DiagnosticKind::Error,
        message: format!("can't read {}: {}", path.display(), err),
        location: None,
      });
      return Ok(());
    }
  };
  data.visited.insert(reply.file_id);
  parse_into(parser, &content, reply.file_id, data);

  let parent = path.parent().map(|p| p.to_path_buf());
  for include in scan_includes(&content) {
    let resolved = resolve_include(&include, parent.as_deref(), include_paths);
    let Some(resolved) = resolved else {
      continue;
    };
    if seen.contains(&resolved) {
      continue;
    }
    let child_reply = gate.visit(&resolved).await?;
    Box::pin(extract_raw(
      &resolved,
      &child_reply,
      include_paths,
      gate,
      parser,
      data,
      seen,
    ))
    .await?;
  }
  Ok(())
}

enum Include {
  Quoted(String),
  Angled(String),
}

fn scan_includes(content: &str) -> Vec<Include> {
  let mut out = Vec::new();
  for line in content.lines() {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix('#') else {
      continue;
    };
    let rest = rest.trim_start();
    let Some(rest) = rest.strip_prefix("include") else {
      continue;
    };
    let rest = rest.trim_start();
    if let Some(rest) = rest.strip_prefix('"') {
      if let Some(end) = rest.find('"') {
        out.push(Include::Quoted(rest[..end].to_string()));
      }
    } else if let Some(rest) = rest.strip_prefix('<')
      && let Some(end) = rest.find('>')
    {
      out.push(Include::Angled(rest[..end].to_string()));
    }
  }
  out
}

fn resolve_include(include: &Include, current_dir: Option<&Path>, include_paths: &[PathBuf]) -> Option<PathBuf> {
  let (name, try_current_first) = match include {
    Include::Quoted(name) => (name, true),
    Include::Angled(name) => (name, false),
  };
  if try_current_first
    && let Some(dir) = current_dir
  {
    let candidate = dir.join(name);
    if candidate.is_file() {
      return Some(candidate.canonicalize().unwrap_or(candidate));
    }
  }
  for dir in include_paths {
    let candidate = dir.join(name);
    if candidate.is_file() {
      return Some(candidate.canonicalize().unwrap_or(candidate));
    }
  }
  None
}

// Tree walking

fn parse_into(parser: &mut Parser, content: &str, file_id: u32, data: &mut IndexData) {
  let Some(tree) = parser.parse(content, None) else {
    data.diagnostics.push(Diagnostic {
      kind: DiagnosticKind::Error,
      message: "parse failed".into(),
      location: Some(Location::new(file_id, 1, 1)),
    });
    return;
  };
  walk(tree.root_node(), content.as_bytes(), file_id, data);
}

fn location_of(node: Node<'_>, file_id: u32) -> Location {
  let point = node.start_position();
  Location::new(file_id, point.row as u32 + 1, point.column as u32 + 1)
}

fn node_text<'a>(node: Node<'a>, source: &'a [u8]) -> &'a str {
  node.utf8_text(source).unwrap_or("")
}

/// Descend through declarator wrappers (pointers, parens, functions) to the
/// declared identifier.
fn declared_identifier<'a>(mut node: Node<'a>) -> Option<Node<'a>> {
  loop {
    match node.kind() {
      "identifier" | "field_identifier" | "type_identifier" | "qualified_identifier" | "destructor_name"
      | "operator_name" => return Some(node),
      _ => {}
    }
    node = node.child_by_field_name("declarator").or_else(|| {
      let mut cursor = node.walk();
      let found = node
        .named_children(&mut cursor)
        .find(|child| child.kind().ends_with("declarator") || child.kind() == "identifier");
      found
    })?;
  }
}

fn add_named(data: &mut IndexData, source: &[u8], node: Node<'_>, file_id: u32, kind: SymbolKind, definition: bool) {
  let name = node_text(node, source);
  if name.is_empty() {
    return;
  }
  data.add_symbol(Symbol {
    name: name.to_string(),
    kind,
    location: location_of(node, file_id),
    definition,
  });
}

fn walk(node: Node<'_>, source: &[u8], file_id: u32, data: &mut IndexData) {
  match node.kind() {
    "function_definition" => {
      if let Some(declarator) = node.child_by_field_name("declarator")
        && let Some(identifier) = declared_identifier(declarator)
      {
        add_named(data, source, identifier, file_id, SymbolKind::Function, true);
      }
    }
    "declaration" => {
      let mut cursor = node.walk();
      for child in node.named_children(&mut cursor) {
        match child.kind() {
          "function_declarator" => {
            if let Some(identifier) = declared_identifier(child) {
              add_named(data, source, identifier, file_id, SymbolKind::Function, false);
            }
          }
          "init_declarator" | "identifier" | "pointer_declarator" | "array_declarator" => {
            if let Some(identifier) = declared_identifier(child) {
              // only file-scope variables count as symbols
              if node
                .parent()
                .is_some_and(|parent| parent.kind() == "translation_unit")
              {
                add_named(data, source, identifier, file_id, SymbolKind::Variable, true);
              }
            }
          }
          _ => {}
        }
      }
    }
    "struct_specifier" | "union_specifier" | "class_specifier" => {
      if node.child_by_field_name("body").is_some()
        && let Some(name) = node.child_by_field_name("name")
      {
        let kind = match node.kind() {
          "class_specifier" => SymbolKind::Class,
          "union_specifier" => SymbolKind::Union,
          _ => SymbolKind::Struct,
        };
        add_named(data, source, name, file_id, kind, true);
      }
    }
    "enum_specifier" => {
      if let Some(name) = node.child_by_field_name("name") {
        add_named(data, source, name, file_id, SymbolKind::Enum, node.child_by_field_name("body").is_some());
      }
    }
    "enumerator" => {
      if let Some(name) = node.child_by_field_name("name") {
        add_named(data, source, name, file_id, SymbolKind::EnumConstant, true);
      }
    }
    "type_definition" => {
      if let Some(declarator) = node.child_by_field_name("declarator")
        && let Some(identifier) = declared_identifier(declarator)
      {
        add_named(data, source, identifier, file_id, SymbolKind::Typedef, true);
      }
    }
    "field_declaration" => {
      if let Some(declarator) = node.child_by_field_name("declarator")
        && let Some(identifier) = declared_identifier(declarator)
      {
        add_named(data, source, identifier, file_id, SymbolKind::Field, true);
      }
    }
    "preproc_def" | "preproc_function_def" => {
      if let Some(name) = node.child_by_field_name("name") {
        add_named(data, source, name, file_id, SymbolKind::Macro, true);
      }
    }
    "namespace_definition" => {
      if let Some(name) = node.child_by_field_name("name") {
        add_named(data, source, name, file_id, SymbolKind::Namespace, true);
      }
    }
    "call_expression" => {
      if let Some(function) = node.child_by_field_name("function")
        && matches!(function.kind(), "identifier" | "field_expression" | "qualified_identifier")
      {
        let name_node = if function.kind() == "field_expression" {
          function.child_by_field_name("field")
        } else {
          Some(function)
        };
        if let Some(name_node) = name_node {
          let name = node_text(name_node, source);
          if !name.is_empty() {
            data.add_reference(name, location_of(name_node, file_id));
          }
        }
      }
    }
    _ => {}
  }

  let mut cursor = node.walk();
  for child in node.named_children(&mut cursor) {
    walk(child, source, file_id, data);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cintel_core::Source;

  /// Test gate backed by a static table: path -> (file_id, visit).
  pub struct StaticGate {
    pub replies: HashMap<PathBuf, (u32, bool)>,
    pub next_id: u32,
  }

  impl StaticGate {
    fn new() -> StaticGate {
      StaticGate {
        replies: HashMap::new(),
        next_id: 1,
      }
    }

    fn allow(&mut self, path: &Path) -> u32 {
      let id = self.next_id;
      self.next_id += 1;
      self.replies.insert(path.to_path_buf(), (id, true));
      id
    }

    fn deny(&mut self, path: &Path) -> u32 {
      let id = self.next_id;
      self.next_id += 1;
      self.replies.insert(path.to_path_buf(), (id, false));
      id
    }
  }

  impl VisitGate for StaticGate {
    async fn visit(&mut self, path: &Path) -> Result<VisitReply, ExtractError> {
      let (file_id, visit) = self.replies.get(path).copied().unwrap_or((0, false));
      Ok(VisitReply {
        file_id,
        path: path.to_path_buf(),
        visit,
      })
    }
  }

  fn unit_for(path: &Path, preprocessed: &str) -> Unit {
    let source = Source::parse(&format!("gcc -c {}", path.display()), path.parent().unwrap()).remove(0);
    let mut unit = Unit::new(source);
    unit.preprocessed = preprocessed.as_bytes().to_vec();
    unit
  }

  #[test]
  fn test_parse_line_marker() {
    assert_eq!(parse_line_marker("# 12 \"/usr/include/stdio.h\" 1 3"), Some(("/usr/include/stdio.h", 12)));
    assert_eq!(parse_line_marker("#line 3 \"x.c\""), Some(("x.c", 3)));
    assert_eq!(parse_line_marker("#define FOO 1"), None);
    assert_eq!(parse_line_marker("int x;"), None);
  }

  #[test]
  fn test_scan_includes() {
    let content = "#include \"x.h\"\n#include <stdio.h>\n int x;\n";
    let includes = scan_includes(content);
    assert_eq!(includes.len(), 2);
    assert!(matches!(&includes[0], Include::Quoted(name) if name == "x.h"));
    assert!(matches!(&includes[1], Include::Angled(name) if name == "stdio.h"));
  }

  #[tokio::test]
  async fn test_raw_extraction_with_suspended_include() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let main = root.join("a.c");
    let header = root.join("x.h");
    std::fs::write(&header, "int helper(int v);\n#define HIDDEN 1\n").unwrap();
    std::fs::write(
      &main,
      "#include \"x.h\"\nint main(void) {\n  return helper(0);\n}\n",
    )
    .unwrap();

    let mut gate = StaticGate::new();
    let main_id = gate.allow(&main);
    let header_id = gate.deny(&header);

    let unit = Unit::new(Source::parse(&format!("gcc -c {}", main.display()), &root).remove(0));
    let data = run(&unit, 1, 0xf00, false, &[], &mut gate).await.unwrap();

    // main() found, nothing from the suspended header
    assert!(data.symbol_names.contains_key("main"));
    assert!(!data.symbol_names.contains_key("helper"));
    assert!(!data.symbol_names.contains_key("HIDDEN"));
    // the call site still references helper
    assert!(data.references.contains_key("helper"));
    // and the dependency edge to the suspended header survives
    assert!(data.dependencies.get(&main_id).unwrap().contains(&header_id));
    assert!(data.visited.contains(&main_id));
    assert!(!data.visited.contains(&header_id));
  }

  #[tokio::test]
  async fn test_raw_extraction_follows_allowed_includes() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let main = root.join("a.c");
    let header = root.join("util.h");
    std::fs::write(&header, "typedef struct point { int x; int y; } point_t;\n").unwrap();
    std::fs::write(&main, "#include \"util.h\"\nstatic point_t origin;\n").unwrap();

    let mut gate = StaticGate::new();
    gate.allow(&main);
    let header_id = gate.allow(&header);

    let unit = Unit::new(Source::parse(&format!("gcc -c {}", main.display()), &root).remove(0));
    let data = run(&unit, 2, 0xf00, false, &[], &mut gate).await.unwrap();

    assert!(data.symbol_names.contains_key("point_t"));
    assert!(data.symbol_names.contains_key("point"));
    assert!(data.visited.contains(&header_id));
  }

  #[tokio::test]
  async fn test_preprocessed_extraction_splits_line_markers() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let main = root.join("a.c");
    let header = root.join("x.h");
    // files don't need to exist in preprocessed mode; the text is
    // self-contained
    let preprocessed = format!(
      "# 1 \"{main}\"\n# 1 \"{header}\" 1\nint helper(int v);\n# 2 \"{main}\" 2\nint main(void) {{\n  return helper(0);\n}}\n",
      main = main.display(),
      header = header.display()
    );

    let mut gate = StaticGate::new();
    let main_id = gate.allow(&main);
    let header_id = gate.allow(&header);

    let unit = unit_for(&main, &preprocessed);
    let data = run(&unit, 3, 0xf00, false, &[], &mut gate).await.unwrap();

    assert!(data.symbol_names.contains_key("main"));
    assert!(data.symbol_names.contains_key("helper"));
    // helper's declaration is attributed to the header, on its own line
    let helper_sites = data.symbol_names.get("helper").unwrap();
    assert!(helper_sites.iter().any(|loc| loc.file_id == header_id && loc.line == 1));
    assert!(data.dependencies.get(&main_id).unwrap().contains(&header_id));
  }

  #[tokio::test]
  async fn test_main_location_preserved_across_markers() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let main = root.join("b.c");
    let preprocessed = format!(
      "# 1 \"{main}\"\n\n\nstatic int counter;\n",
      main = main.display()
    );
    let mut gate = StaticGate::new();
    let main_id = gate.allow(&main);

    let unit = unit_for(&main, &preprocessed);
    let data = run(&unit, 4, 0xf00, false, &[], &mut gate).await.unwrap();
    let sites = data.symbol_names.get("counter").unwrap();
    // the declaration keeps its original line number (4 in the file)
    assert!(sites.iter().any(|loc| loc.file_id == main_id && loc.line == 4));
  }
}
