//! Compile-command parsing.
//!
//! A `Source` is the identity of a translation unit: compiler, the arguments
//! that affect parsing, and the source file itself. The fingerprint derived
//! from those three is the key used for duplicate suppression and for the
//! per-source job bookkeeping in a project.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
  C,
  Cxx,
  ObjC,
  ObjCxx,
}

impl Language {
  pub fn from_path(path: &Path) -> Option<Language> {
    match path.extension().and_then(|e| e.to_str())? {
      "c" => Some(Language::C),
      "cc" | "cpp" | "cxx" | "C" => Some(Language::Cxx),
      "m" => Some(Language::ObjC),
      "mm" => Some(Language::ObjCxx),
      _ => None,
    }
  }

  pub fn is_cxx(self) -> bool {
    matches!(self, Language::Cxx | Language::ObjCxx)
  }
}

/// Debug/release classification, only fingerprint-relevant when
/// `separate_debug_and_release` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
  #[default]
  Default,
  Debug,
  Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
  pub compiler: PathBuf,
  pub arguments: Vec<String>,
  pub source_file: PathBuf,
  pub language: Language,
  pub build: BuildType,
}

/// Compiler basenames we accept compile commands from.
const KNOWN_COMPILERS: &[&str] = &[
  "cc", "c++", "gcc", "g++", "clang", "clang++", "icc", "icpc",
];

fn looks_like_compiler(token: &str) -> bool {
  let base = Path::new(token)
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or(token);
  // "gcc-13", "clang-18" and friends count too
  KNOWN_COMPILERS
    .iter()
    .any(|c| base == *c || (base.starts_with(c) && base[c.len()..].starts_with('-')))
}

/// Split a command line on whitespace, honoring single/double quotes and
/// backslash escapes.
fn tokenize(input: &str) -> Vec<String> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut quote: Option<char> = None;
  let mut escaped = false;

  for ch in input.chars() {
    if escaped {
      current.push(ch);
      escaped = false;
      continue;
    }
    match ch {
      '\\' if quote != Some('\'') => escaped = true,
      '\'' | '"' => {
        if quote == Some(ch) {
          quote = None;
        } else if quote.is_none() {
          quote = Some(ch);
        } else {
          current.push(ch);
        }
      }
      c if c.is_whitespace() && quote.is_none() => {
        if !current.is_empty() {
          tokens.push(std::mem::take(&mut current));
        }
      }
      c => current.push(c),
    }
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  tokens
}

fn resolve(path: &str, pwd: &Path) -> PathBuf {
  let p = Path::new(path);
  let joined = if p.is_absolute() { p.to_path_buf() } else { pwd.join(p) };
  joined.canonicalize().unwrap_or(joined)
}

/// Bare compiler names resolve through PATH, not the working directory.
fn resolve_compiler(token: &str, pwd: &Path) -> PathBuf {
  if token.contains('/') {
    return resolve(token, pwd);
  }
  if let Ok(path_var) = std::env::var("PATH") {
    for dir in std::env::split_paths(&path_var) {
      let candidate = dir.join(token);
      if candidate.is_file() {
        return candidate;
      }
    }
  }
  PathBuf::from(token)
}

impl Source {
  /// Parse a compiler invocation into one `Source` per source file on the
  /// command line. Output/linker arguments are stripped; everything that can
  /// affect parsing is kept verbatim.
  pub fn parse(command: &str, pwd: &Path) -> Vec<Source> {
    let tokens = tokenize(command);
    let mut iter = tokens.into_iter();
    let Some(compiler_token) = iter.next() else {
      return Vec::new();
    };
    if !looks_like_compiler(&compiler_token) {
      return Vec::new();
    }
    let compiler = resolve_compiler(&compiler_token, pwd);
    let language_hint = compiler_token.contains("++").then_some(Language::Cxx);

    let mut arguments = Vec::new();
    let mut source_files = Vec::new();
    let mut build = BuildType::Default;
    let mut skip_next = false;

    for token in iter {
      if skip_next {
        skip_next = false;
        continue;
      }
      if matches!(token.as_str(), "-o" | "-MF" | "-MT" | "-MQ") {
        skip_next = true;
        continue;
      }
      if matches!(token.as_str(), "-c" | "-MMD" | "-MD" | "-MP") {
        continue;
      }
      if matches!(token.as_str(), "-g" | "-g3" | "-ggdb") {
        build = BuildType::Debug;
        arguments.push(token);
        continue;
      }
      if token.starts_with("-O") && token != "-O0" {
        if build == BuildType::Default {
          build = BuildType::Release;
        }
        arguments.push(token);
        continue;
      }
      if token.starts_with('-') {
        arguments.push(token);
        continue;
      }
      let path = resolve(&token, pwd);
      if Language::from_path(&path).is_some() {
        source_files.push(path);
      } else {
        arguments.push(token);
      }
    }

    source_files
      .into_iter()
      .map(|source_file| {
        let language = language_hint
          .or_else(|| Language::from_path(&source_file))
          .unwrap_or(Language::C);
        Source {
          compiler: compiler.clone(),
          arguments: arguments.clone(),
          source_file,
          language,
          build,
        }
      })
      .collect()
  }

  /// Stable identity of this translation unit.
  pub fn fingerprint(&self, separate_debug_and_release: bool) -> u64 {
    let mut hasher = DefaultHasher::new();
    self.compiler.hash(&mut hasher);
    self.arguments.hash(&mut hasher);
    self.source_file.hash(&mut hasher);
    if separate_debug_and_release {
      self.build.hash(&mut hasher);
    }
    hasher.finish()
  }

  /// Include search paths given on the command line (`-I foo` / `-Ifoo`).
  pub fn include_paths(&self) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut take_next = false;
    for arg in &self.arguments {
      if take_next {
        paths.push(PathBuf::from(arg));
        take_next = false;
      } else if arg == "-I" {
        take_next = true;
      } else if let Some(rest) = arg.strip_prefix("-I") {
        paths.push(PathBuf::from(rest));
      }
    }
    paths
  }

  pub fn is_indexable(&self) -> bool {
    self.source_file.as_os_str().len() > 0
  }
}

impl std::fmt::Display for Source {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.compiler.display(), self.arguments.join(" "))?;
    write!(f, " {}", self.source_file.display())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tokenize_quotes() {
    let tokens = tokenize(r#"gcc -DNAME="two words" -c foo.c"#);
    assert_eq!(tokens, vec!["gcc", "-DNAME=two words", "-c", "foo.c"]);
  }

  #[test]
  fn test_parse_simple() {
    let sources = Source::parse("gcc -c -I include -DFOO foo.c -o foo.o", Path::new("/tmp"));
    assert_eq!(sources.len(), 1);
    let src = &sources[0];
    assert_eq!(src.source_file, PathBuf::from("/tmp/foo.c"));
    assert_eq!(src.language, Language::C);
    assert!(src.arguments.contains(&"-DFOO".to_string()));
    // -o target is stripped
    assert!(!src.arguments.iter().any(|a| a == "foo.o"));
    assert_eq!(src.include_paths(), vec![PathBuf::from("include")]);
  }

  #[test]
  fn test_parse_multiple_sources() {
    let sources = Source::parse("clang -c a.c b.c", Path::new("/tmp"));
    assert_eq!(sources.len(), 2);
  }

  #[test]
  fn test_parse_rejects_non_compiler() {
    assert!(Source::parse("ls -la", Path::new("/tmp")).is_empty());
    assert!(Source::parse("", Path::new("/tmp")).is_empty());
  }

  #[test]
  fn test_cxx_detection() {
    let sources = Source::parse("g++ -c widget.cpp", Path::new("/tmp"));
    assert_eq!(sources[0].language, Language::Cxx);
  }

  #[test]
  fn test_fingerprint_stability() {
    let a = Source::parse("gcc -c -O2 foo.c", Path::new("/tmp")).remove(0);
    let b = Source::parse("gcc -c -O2 foo.c", Path::new("/tmp")).remove(0);
    assert_eq!(a.fingerprint(false), b.fingerprint(false));

    let debug = Source::parse("gcc -c -g foo.c", Path::new("/tmp")).remove(0);
    assert_ne!(a.fingerprint(true), debug.fingerprint(true));
  }
}
