//! The payload a finished indexing job hands back to the daemon.
//!
//! The extractor produces one `IndexData` per job; the reconciler commits the
//! first one that arrives for a job id and drops the rest.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Location {
  pub file_id: u32,
  pub line: u32,
  pub column: u32,
}

impl Location {
  pub fn new(file_id: u32, line: u32, column: u32) -> Location {
    Location { file_id, line, column }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
  Function,
  Struct,
  Union,
  Enum,
  EnumConstant,
  Typedef,
  Variable,
  Field,
  Macro,
  Class,
  Namespace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
  pub name: String,
  pub kind: SymbolKind,
  pub location: Location,
  /// Definition vs. forward declaration
  pub definition: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
  Note,
  Warning,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub kind: DiagnosticKind,
  pub message: String,
  pub location: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexData {
  /// The job this payload answers; ids are process-wide monotonic on the
  /// originating daemon.
  pub job_id: u64,
  /// Fingerprint of the source, the project's per-source key
  pub fingerprint: u64,
  /// File id of the main source file
  pub file_id: u32,
  /// Produced by a dirty re-index rather than a fresh compile
  pub dirty: bool,
  /// Synthesized after a worker crash; carries only the self dependency
  pub crashed: bool,
  /// Declarations and definitions keyed by location
  pub symbols: BTreeMap<Location, Symbol>,
  /// Name -> declaration/definition sites
  pub symbol_names: BTreeMap<String, BTreeSet<Location>>,
  /// Name -> use sites
  pub references: BTreeMap<String, BTreeSet<Location>>,
  /// File -> files it depends on (always contains file_id -> file_id)
  pub dependencies: BTreeMap<u32, BTreeSet<u32>>,
  /// Files the extractor was allowed to visit
  pub visited: BTreeSet<u32>,
  pub diagnostics: Vec<Diagnostic>,
  /// One-line progress message for the statistics stream
  pub message: String,
  pub parse_duration_ms: u64,
}

impl IndexData {
  pub fn new(job_id: u64, fingerprint: u64, file_id: u32) -> IndexData {
    let mut data = IndexData {
      job_id,
      fingerprint,
      file_id,
      dirty: false,
      crashed: false,
      symbols: BTreeMap::new(),
      symbol_names: BTreeMap::new(),
      references: BTreeMap::new(),
      dependencies: BTreeMap::new(),
      visited: BTreeSet::new(),
      diagnostics: Vec::new(),
      message: String::new(),
      parse_duration_ms: 0,
    };
    data.add_dependency(file_id, file_id);
    data
  }

  /// The terminal payload for a source that kept crashing: no symbols, no
  /// visited files, but the source remains its own dependency so dirty-file
  /// tracking still reaches it.
  pub fn crashed(job_id: u64, fingerprint: u64, file_id: u32) -> IndexData {
    let mut data = IndexData::new(job_id, fingerprint, file_id);
    data.crashed = true;
    data
  }

  pub fn add_symbol(&mut self, symbol: Symbol) {
    self
      .symbol_names
      .entry(symbol.name.clone())
      .or_default()
      .insert(symbol.location);
    self.symbols.insert(symbol.location, symbol);
  }

  pub fn add_reference(&mut self, name: &str, location: Location) {
    self.references.entry(name.to_string()).or_default().insert(location);
  }

  pub fn add_dependency(&mut self, from: u32, to: u32) {
    self.dependencies.entry(from).or_default().insert(to);
  }

  pub fn symbol_count(&self) -> usize {
    self.symbols.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_crashed_payload_keeps_self_dependency() {
    let data = IndexData::crashed(7, 0xfeed, 42);
    assert!(data.crashed);
    assert!(data.visited.is_empty());
    assert!(data.symbols.is_empty());
    assert!(data.dependencies.get(&42).unwrap().contains(&42));
  }

  #[test]
  fn test_add_symbol_indexes_name() {
    let mut data = IndexData::new(1, 1, 1);
    data.add_symbol(Symbol {
      name: "main".into(),
      kind: SymbolKind::Function,
      location: Location::new(1, 3, 5),
      definition: true,
    });
    assert_eq!(data.symbol_count(), 1);
    assert!(data.symbol_names.get("main").unwrap().contains(&Location::new(1, 3, 5)));
  }
}
