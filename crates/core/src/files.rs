//! File-id interning.
//!
//! Paths are interned to dense u32 ids once and referenced by id everywhere
//! else (locations, dependency edges, the suspended set). The table persists
//! to `<data_dir>/fileids` with the versioned header from `snapshot`.

use crate::snapshot::{self, SnapshotError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum FileTableError {
  #[error("snapshot error: {0}")]
  Snapshot(#[from] SnapshotError),
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_cbor::Error),
}

#[derive(Default, Serialize, Deserialize)]
struct Tables {
  paths_to_ids: HashMap<PathBuf, u32>,
  #[serde(skip)]
  ids_to_paths: HashMap<u32, PathBuf>,
  next_id: u32,
}

impl Tables {
  fn rebuild_reverse(&mut self) {
    self.ids_to_paths = self.paths_to_ids.iter().map(|(p, id)| (*id, p.clone())).collect();
  }
}

/// Process-wide path <-> id table. Interning takes a plain `RwLock`; no await
/// point ever holds it.
pub struct FileTable {
  inner: RwLock<Tables>,
}

impl Default for FileTable {
  fn default() -> Self {
    Self::new()
  }
}

impl FileTable {
  pub fn new() -> FileTable {
    FileTable {
      inner: RwLock::new(Tables {
        next_id: 1, // id 0 means "no file"
        ..Tables::default()
      }),
    }
  }

  /// Intern a path, allocating an id on first sight.
  pub fn insert(&self, path: &Path) -> u32 {
    {
      let tables = self.inner.read().unwrap_or_else(|e| e.into_inner());
      if let Some(id) = tables.paths_to_ids.get(path) {
        return *id;
      }
    }
    let mut tables = self.inner.write().unwrap_or_else(|e| e.into_inner());
    if let Some(id) = tables.paths_to_ids.get(path) {
      return *id;
    }
    let id = tables.next_id;
    tables.next_id += 1;
    tables.paths_to_ids.insert(path.to_path_buf(), id);
    tables.ids_to_paths.insert(id, path.to_path_buf());
    id
  }

  /// Look up an already-interned path. 0 when unknown.
  pub fn id(&self, path: &Path) -> u32 {
    let tables = self.inner.read().unwrap_or_else(|e| e.into_inner());
    tables.paths_to_ids.get(path).copied().unwrap_or(0)
  }

  pub fn path(&self, id: u32) -> Option<PathBuf> {
    let tables = self.inner.read().unwrap_or_else(|e| e.into_inner());
    tables.ids_to_paths.get(&id).cloned()
  }

  pub fn len(&self) -> usize {
    let tables = self.inner.read().unwrap_or_else(|e| e.into_inner());
    tables.paths_to_ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn save(&self, data_dir: &Path) -> Result<(), FileTableError> {
    let payload = {
      let tables = self.inner.read().unwrap_or_else(|e| e.into_inner());
      serde_cbor::to_vec(&*tables)?
    };
    snapshot::write(&data_dir.join("fileids"), &payload)?;
    Ok(())
  }

  /// Restore the table. Returns false when the on-disk table was corrupt or
  /// had the wrong version, in which case it has been deleted and the caller
  /// should also discard project snapshots (their file ids are meaningless
  /// without this table).
  pub fn restore(&self, data_dir: &Path) -> bool {
    let path = data_dir.join("fileids");
    if !path.exists() {
      return true;
    }
    let payload = match snapshot::read(&path) {
      Ok(payload) => payload,
      Err(err) => {
        if err.is_corruption() {
          error!("Refusing to load corrupted file {:?}: {}", path, err);
          let _ = std::fs::remove_file(&path);
        } else {
          error!("Failed to read {:?}: {}", path, err);
        }
        return false;
      }
    };
    match serde_cbor::from_slice::<Tables>(&payload) {
      Ok(mut tables) => {
        tables.rebuild_reverse();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = tables;
        true
      }
      Err(err) => {
        error!("Failed to decode {:?}: {}", path, err);
        let _ = std::fs::remove_file(&path);
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_insert_is_idempotent() {
    let table = FileTable::new();
    let a = table.insert(Path::new("/src/a.c"));
    let b = table.insert(Path::new("/src/b.c"));
    assert_ne!(a, b);
    assert_eq!(table.insert(Path::new("/src/a.c")), a);
    assert_eq!(table.path(a), Some(PathBuf::from("/src/a.c")));
    assert_eq!(table.id(Path::new("/src/c.c")), 0);
  }

  #[test]
  fn test_save_restore() {
    let dir = TempDir::new().unwrap();
    let table = FileTable::new();
    let a = table.insert(Path::new("/src/a.c"));
    table.save(dir.path()).unwrap();

    let restored = FileTable::new();
    assert!(restored.restore(dir.path()));
    assert_eq!(restored.id(Path::new("/src/a.c")), a);
    // ids allocated after restore don't collide
    let b = restored.insert(Path::new("/src/b.c"));
    assert_ne!(a, b);
  }

  #[test]
  fn test_restore_corrupt_deletes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fileids");
    std::fs::write(&path, b"garbage").unwrap();
    let table = FileTable::new();
    assert!(!table.restore(dir.path()));
    assert!(!path.exists());
  }
}
