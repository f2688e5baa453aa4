//! Short-lived query jobs over a project's committed tables.

use crate::projects::ProjectTables;
use cintel_core::{FileTable, Location};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Parse a `path:line:col` query location.
pub fn parse_location(input: &str) -> Option<(PathBuf, u32, u32)> {
  let mut parts = input.rsplitn(3, ':');
  let col: u32 = parts.next()?.parse().ok()?;
  let line: u32 = parts.next()?.parse().ok()?;
  let path = parts.next()?;
  if path.is_empty() {
    return None;
  }
  Some((PathBuf::from(path), line, col))
}

pub fn format_location(files: &FileTable, location: Location) -> String {
  let path = files
    .path(location.file_id)
    .map(|p| p.display().to_string())
    .unwrap_or_else(|| format!("file#{}", location.file_id));
  format!("{}:{}:{}", path, location.line, location.column)
}

fn covers(candidate: Location, name_len: usize, target: Location) -> bool {
  candidate.file_id == target.file_id
    && candidate.line == target.line
    && target.column >= candidate.column
    && target.column < candidate.column + name_len as u32
}

/// The symbol name under a location, from either a declaration site or a
/// use site.
pub fn symbol_at(tables: &ProjectTables<'_>, location: Location) -> Option<String> {
  for (loc, symbol) in tables.symbols.iter() {
    if covers(*loc, symbol.name.len(), location) {
      return Some(symbol.name.clone());
    }
  }
  for (name, sites) in tables.references.iter() {
    for site in sites {
      if covers(*site, name.len(), location) {
        return Some(name.clone());
      }
    }
  }
  None
}

/// Follow-symbol: the definition (or failing that, any declaration) of the
/// symbol under the location.
pub fn follow_location(tables: &ProjectTables<'_>, location: Location) -> Option<Location> {
  let name = symbol_at(tables, location)?;
  let sites = tables.symbol_names.get(&name)?;
  let mut declaration = None;
  for site in sites {
    if *site == location {
      continue;
    }
    match tables.symbols.get(site) {
      Some(symbol) if symbol.definition => return Some(*site),
      Some(_) => declaration = declaration.or(Some(*site)),
      None => {}
    }
  }
  declaration.or_else(|| sites.iter().find(|site| **site != location).copied())
}

/// All use sites of a symbol name, optionally with its declaration sites.
pub fn references_for_name(tables: &ProjectTables<'_>, name: &str, include_declarations: bool) -> Vec<Location> {
  let mut out = BTreeSet::new();
  if let Some(sites) = tables.references.get(name) {
    out.extend(sites.iter().copied());
  }
  if include_declarations
    && let Some(sites) = tables.symbol_names.get(name)
  {
    out.extend(sites.iter().copied());
  }
  out.into_iter().collect()
}

/// Symbol names matching a pattern (substring; empty matches all).
pub fn list_symbol_names(tables: &ProjectTables<'_>, pattern: &str) -> Vec<String> {
  tables
    .symbol_names
    .keys()
    .filter(|name| pattern.is_empty() || name.contains(pattern))
    .cloned()
    .collect()
}

/// `name location` pairs for symbols matching a pattern.
pub fn find_symbols(tables: &ProjectTables<'_>, files: &FileTable, pattern: &str) -> Vec<String> {
  let mut out = Vec::new();
  for (name, sites) in tables.symbol_names.iter() {
    if !pattern.is_empty() && !name.contains(pattern) {
      continue;
    }
    for site in sites {
      out.push(format!("{} {}", format_location(files, *site), name));
    }
  }
  out
}

/// Files depending on `path`, for the dependencies query.
pub fn dependents_of(tables: &ProjectTables<'_>, files: &FileTable, path: &Path) -> Vec<String> {
  let target = files.id(path);
  if target == 0 {
    return Vec::new();
  }
  let mut out = Vec::new();
  for (from, deps) in tables.dependencies.iter() {
    if *from != target && deps.contains(&target)
      && let Some(p) = files.path(*from)
    {
      out.push(p.display().to_string());
    }
  }
  out.sort();
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use cintel_core::{Symbol, SymbolKind};
  use std::collections::BTreeMap;

  struct Fixture {
    symbols: BTreeMap<Location, Symbol>,
    symbol_names: BTreeMap<String, BTreeSet<Location>>,
    references: BTreeMap<String, BTreeSet<Location>>,
    dependencies: BTreeMap<u32, BTreeSet<u32>>,
  }

  fn fixture() -> Fixture {
    let def = Location::new(1, 10, 5);
    let use_site = Location::new(2, 4, 9);
    let mut symbols = BTreeMap::new();
    symbols.insert(
      def,
      Symbol {
        name: "frobnicate".into(),
        kind: SymbolKind::Function,
        location: def,
        definition: true,
      },
    );
    let mut symbol_names = BTreeMap::new();
    symbol_names.insert("frobnicate".to_string(), BTreeSet::from([def]));
    let mut references = BTreeMap::new();
    references.insert("frobnicate".to_string(), BTreeSet::from([use_site]));
    let mut dependencies = BTreeMap::new();
    dependencies.insert(2, BTreeSet::from([1, 2]));
    Fixture {
      symbols,
      symbol_names,
      references,
      dependencies,
    }
  }

  fn tables(fixture: &Fixture) -> ProjectTables<'_> {
    ProjectTables {
      symbols: &fixture.symbols,
      symbol_names: &fixture.symbol_names,
      references: &fixture.references,
      dependencies: &fixture.dependencies,
    }
  }

  #[test]
  fn test_parse_location() {
    assert_eq!(
      parse_location("/src/a.c:10:5"),
      Some((PathBuf::from("/src/a.c"), 10, 5))
    );
    assert_eq!(parse_location("nonsense"), None);
    assert_eq!(parse_location(":3:4"), None);
  }

  #[test]
  fn test_follow_from_use_site_to_definition() {
    let fixture = fixture();
    let tables = tables(&fixture);
    // anywhere inside the identifier works
    let target = follow_location(&tables, Location::new(2, 4, 12)).unwrap();
    assert_eq!(target, Location::new(1, 10, 5));
    // just past the identifier does not
    assert!(follow_location(&tables, Location::new(2, 4, 19)).is_none());
  }

  #[test]
  fn test_references_include_declarations_on_request() {
    let fixture = fixture();
    let tables = tables(&fixture);
    assert_eq!(references_for_name(&tables, "frobnicate", false).len(), 1);
    assert_eq!(references_for_name(&tables, "frobnicate", true).len(), 2);
    assert!(references_for_name(&tables, "missing", true).is_empty());
  }

  #[test]
  fn test_list_and_find_symbols() {
    let fixture = fixture();
    let tables = tables(&fixture);
    assert_eq!(list_symbol_names(&tables, "frob"), vec!["frobnicate"]);
    assert!(list_symbol_names(&tables, "xyz").is_empty());

    let files = FileTable::new();
    let found = find_symbols(&tables, &files, "");
    assert_eq!(found.len(), 1);
    assert!(found[0].ends_with("frobnicate"));
  }
}
