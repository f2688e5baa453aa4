//! Project registry and per-project state.
//!
//! A project owns the committed symbol tables for one source root, the
//! per-source job bookkeeping (crash counters, superseded-command queue), the
//! suspended-file set and the visited-file claims that keep concurrent jobs
//! from double-indexing shared headers. The registry maps root paths to
//! projects, tracks the current project and persists it to a sentinel file.

use crate::jobs::{JobId, JobOrigin};
use cintel_core::{DaemonOptions, FileTable, IndexData, Location, Source, Symbol, snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Delay before a crashed source is retried.
const CRASH_RETRY_DELAY_MS: u64 = 500;

#[derive(Error, Debug)]
pub enum ProjectError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Snapshot error: {0}")]
  Snapshot(#[from] snapshot::SnapshotError),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_cbor::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
  Unloaded,
  Inited,
  Loading,
  Loaded,
  Syncing,
}

impl ProjectState {
  pub fn label(self) -> &'static str {
    match self {
      ProjectState::Unloaded => "(unloaded)",
      ProjectState::Inited => "(inited)",
      ProjectState::Loading => "(loading)",
      ProjectState::Loaded => "(loaded)",
      ProjectState::Syncing => "(syncing)",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceEntry {
  source: Source,
  parsed_ms: i64,
}

/// Per-source scheduling bookkeeping. Lives for as long as the source has an
/// active or queued job.
#[derive(Debug, Default)]
struct JobData {
  active_job: Option<JobId>,
  crash_count: u32,
  /// A newer compile command arrived while a job was in flight
  pending: Option<(Source, JobOrigin)>,
  /// A retry has been handed to the scheduler but hasn't started yet; the
  /// source still counts as indexing during the grace delay
  retry_queued: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct SymbolTables {
  symbols: BTreeMap<Location, Symbol>,
  symbol_names: BTreeMap<String, BTreeSet<Location>>,
  references: BTreeMap<String, BTreeSet<Location>>,
  /// file -> files it depends on
  dependencies: BTreeMap<u32, BTreeSet<u32>>,
}

#[derive(Serialize, Deserialize)]
struct ProjectSnapshot {
  sources: HashMap<u64, SourceEntry>,
  tables: SymbolTables,
  visited: HashMap<u32, u64>,
  indexed_files: HashSet<u32>,
}

struct ProjectData {
  state: ProjectState,
  sources: HashMap<u64, SourceEntry>,
  suspended: HashSet<u32>,
  /// file id -> claiming job key; a claim blocks other jobs from re-indexing
  /// the same file while its owner's data is current
  visited: HashMap<u32, u64>,
  indexed_files: HashSet<u32>,
  job_data: HashMap<u64, JobData>,
  /// Jobs started since the project last went idle, for progress lines
  job_counter: usize,
  completed: usize,
  tables: SymbolTables,
}

/// What a project wants done after a job finished.
#[derive(Debug)]
pub enum FinishAction {
  None,
  /// Re-run this source (crash retry or superseded command)
  Retry {
    source: Source,
    origin: JobOrigin,
    delay_ms: u64,
  },
  /// Result committed; the message is a statistics line
  Committed { message: String },
}

/// Outcome of asking a project to start indexing a source.
#[derive(Debug)]
pub enum BeginIndex {
  Proceed,
  /// This fingerprint already has a live job
  Active(JobId),
  /// Project not loaded yet; the request was queued
  Deferred,
}

pub struct Project {
  root: PathBuf,
  options: Arc<DaemonOptions>,
  files: Arc<FileTable>,
  data: RwLock<ProjectData>,
}

impl Project {
  pub fn new(root: PathBuf, options: Arc<DaemonOptions>, files: Arc<FileTable>) -> Project {
    Project {
      root,
      options,
      files,
      data: RwLock::new(ProjectData {
        state: ProjectState::Unloaded,
        sources: HashMap::new(),
        suspended: HashSet::new(),
        visited: HashMap::new(),
        indexed_files: HashSet::new(),
        job_data: HashMap::new(),
        job_counter: 0,
        completed: 0,
        tables: SymbolTables::default(),
      }),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub async fn state(&self) -> ProjectState {
    self.data.read().await.state
  }

  pub async fn is_loaded(&self) -> bool {
    self.data.read().await.state == ProjectState::Loaded
  }

  fn snapshot_path(&self, data_dir: &Path) -> PathBuf {
    data_dir.join(encode_project_path(&self.root))
  }

  /// Load the snapshot from disk if one exists. Corrupt snapshots are
  /// deleted. Returns the compile commands that queued up while the project
  /// was not loaded; the caller re-drives them.
  pub async fn load(&self) -> Vec<(Source, JobOrigin)> {
    loop {
      {
        let mut data = self.data.write().await;
        match data.state {
          ProjectState::Unloaded | ProjectState::Inited => {
            data.state = ProjectState::Loading;
            break;
          }
          // another load in flight; wait for it to finish
          ProjectState::Loading => {}
          _ => return Vec::new(),
        }
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let path = self.snapshot_path(&self.options.data_dir);
    let restored = tokio::task::spawn_blocking(move || read_snapshot(&path))
      .await
      .unwrap_or(None);

    let mut data = self.data.write().await;
    if let Some(loaded) = restored {
      data.sources = loaded.sources;
      data.tables = loaded.tables;
      data.visited = loaded.visited;
      data.indexed_files = loaded.indexed_files;
      info!("Loaded project {:?} ({} sources)", self.root, data.sources.len());
    }
    data.state = ProjectState::Loaded;

    let mut pending = Vec::new();
    for job_data in data.job_data.values_mut() {
      if let Some(entry) = job_data.pending.take() {
        pending.push(entry);
      }
    }
    pending
  }

  /// Drop everything in memory; returns the ids of jobs the scheduler must
  /// abort.
  pub async fn unload(&self) -> Vec<JobId> {
    let mut data = self.data.write().await;
    let ids = data.job_data.values().filter_map(|jd| jd.active_job).collect();
    data.job_data.clear();
    data.sources.clear();
    data.visited.clear();
    data.indexed_files.clear();
    data.tables = SymbolTables::default();
    data.job_counter = 0;
    data.completed = 0;
    data.state = ProjectState::Unloaded;
    ids
  }

  pub async fn has_source(&self, fingerprint: u64) -> bool {
    self.data.read().await.sources.contains_key(&fingerprint)
  }

  /// Record intent to index a source. The caller handles the `Active` case
  /// (in-place unit replacement or abort + supersede).
  pub async fn begin_index(&self, fingerprint: u64, source: &Source, origin: JobOrigin) -> BeginIndex {
    let mut data = self.data.write().await;
    // Syncing is only a snapshot write; indexing proceeds against it
    if matches!(
      data.state,
      ProjectState::Unloaded | ProjectState::Inited | ProjectState::Loading
    ) {
      let job_data = data.job_data.entry(fingerprint).or_default();
      job_data.pending = Some((source.clone(), origin));
      return BeginIndex::Deferred;
    }
    data.sources.insert(
      fingerprint,
      SourceEntry {
        source: source.clone(),
        parsed_ms: 0,
      },
    );
    let job_data = data.job_data.entry(fingerprint).or_default();
    if let Some(active) = job_data.active_job {
      job_data.pending = Some((source.clone(), origin));
      return BeginIndex::Active(active);
    }
    BeginIndex::Proceed
  }

  /// Drop a queued supersede note, used when the scheduler refreshed the
  /// still-pending job in place instead.
  pub async fn clear_pending(&self, fingerprint: u64) {
    let mut data = self.data.write().await;
    if let Some(job_data) = data.job_data.get_mut(&fingerprint) {
      job_data.pending = None;
    }
  }

  /// The visited-file claims as a file-id -> path map, shipped to peers as
  /// blocked files.
  pub async fn visited_files(&self) -> HashMap<u32, PathBuf> {
    let data = self.data.read().await;
    data
      .visited
      .keys()
      .filter_map(|id| self.files.path(*id).map(|path| (*id, path)))
      .collect()
  }

  pub async fn job_started(&self, fingerprint: u64, job_id: JobId) {
    let mut data = self.data.write().await;
    let was_idle = data.job_data.get(&fingerprint).and_then(|jd| jd.active_job).is_none();
    let job_data = data.job_data.entry(fingerprint).or_default();
    job_data.active_job = Some(job_id);
    job_data.retry_queued = false;
    if was_idle {
      data.job_counter += 1;
    }
  }

  /// The visit-file handshake only answers for jobs the project still knows.
  pub async fn is_valid_job(&self, job_key: u64) -> bool {
    let data = self.data.read().await;
    data
      .job_data
      .get(&job_key)
      .is_some_and(|job_data| job_data.active_job.is_some())
  }

  /// Should a worker parse this file for job `job_key`? Yes iff the file is
  /// not suspended and no job (including a finished one whose data is still
  /// current) holds a claim on it.
  pub async fn visit_file(&self, file_id: u32, job_key: u64) -> bool {
    let mut data = self.data.write().await;
    if data.suspended.contains(&file_id) {
      return false;
    }
    if data.visited.contains_key(&file_id) {
      return false;
    }
    data.visited.insert(file_id, job_key);
    true
  }

  /// Release the claims a job key holds, so a re-index of the same source
  /// can visit its files again.
  pub async fn release_claims(&self, job_key: u64) {
    let mut data = self.data.write().await;
    data.visited.retain(|_, owner| *owner != job_key);
  }

  /// Result intake. `aborted` jobs commit nothing; crashes count toward
  /// `max_crash_count` and retry until the budget runs out, then the (empty)
  /// payload is committed so the dependency edge survives.
  pub async fn on_job_finished(
    &self,
    data_in: &IndexData,
    crashed: bool,
    aborted: bool,
    origin: JobOrigin,
  ) -> FinishAction {
    let mut data = self.data.write().await;
    let fingerprint = data_in.fingerprint;
    if !data.job_data.contains_key(&fingerprint) {
      warn!("No job bookkeeping for fingerprint {:#x}", fingerprint);
      return FinishAction::None;
    }

    if let Some(job_data) = data.job_data.get_mut(&fingerprint) {
      if crashed {
        job_data.crash_count += 1;
      } else {
        job_data.crash_count = 0;
      }
      job_data.active_job = None;
    }

    if crashed || aborted {
      // a failed job gives its claimed files back
      data.visited.retain(|_, owner| *owner != fingerprint);
    }

    let crash_count = data.job_data.get(&fingerprint).map(|jd| jd.crash_count).unwrap_or(0);
    let mut retry = None;
    if crash_count < self.options.max_crash_count {
      let pending = data.job_data.get_mut(&fingerprint).and_then(|jd| jd.pending.take());
      if let Some((source, origin)) = pending {
        retry = Some((source, origin, 0));
      } else if crashed {
        if let Some(entry) = data.sources.get(&fingerprint) {
          error!("{:?} crashed, restarting", entry.source.source_file);
          retry = Some((entry.source.clone(), origin, CRASH_RETRY_DELAY_MS));
        }
      }
    }

    if let Some((source, origin, delay_ms)) = retry {
      if data.job_counter > 0 {
        data.job_counter -= 1;
      }
      if let Some(job_data) = data.job_data.get_mut(&fingerprint) {
        job_data.retry_queued = true;
      }
      return FinishAction::Retry { source, origin, delay_ms };
    }

    data.job_data.remove(&fingerprint);
    if aborted {
      return FinishAction::None;
    }

    // terminal: commit, crashed-empty payloads included
    commit_tables(&mut data, data_in);
    if let Some(entry) = data.sources.get_mut(&fingerprint) {
      entry.parsed_ms = chrono::Utc::now().timestamp_millis();
    }

    data.completed += 1;
    let total = data.job_counter.max(data.completed);
    let idx = data.completed;
    let percent = if total > 0 { idx * 100 / total } else { 100 };
    let file = self
      .files
      .path(data_in.file_id)
      .map(|p| p.display().to_string())
      .unwrap_or_else(|| format!("file#{}", data_in.file_id));
    let message = if crashed {
      format!("[{:3}%] {}/{} {} indexing crashed.", percent, idx, total, file)
    } else {
      format!(
        "[{:3}%] {}/{} {} {} symbols.",
        percent,
        idx,
        total,
        file,
        data_in.symbol_count()
      )
    };

    if data.job_data.is_empty() {
      data.job_counter = 0;
      data.completed = 0;
    }
    FinishAction::Committed { message }
  }

  pub async fn is_indexing(&self) -> bool {
    let data = self.data.read().await;
    data
      .job_data
      .values()
      .any(|jd| jd.active_job.is_some() || jd.pending.is_some() || jd.retry_queued)
  }

  /// No live jobs and nothing queued: safe to write the snapshot.
  pub async fn is_idle(&self) -> bool {
    self.data.read().await.job_data.is_empty()
  }

  pub async fn is_indexed(&self, file_id: u32) -> bool {
    self.data.read().await.indexed_files.contains(&file_id)
  }

  /// Path-prefix project matching, used by query routing.
  pub fn matches_path(&self, path: &Path) -> bool {
    path.starts_with(&self.root)
  }

  pub async fn matches_pattern(&self, pattern: &str) -> bool {
    if pattern.is_empty() {
      return false;
    }
    if self.root.to_string_lossy().contains(pattern) {
      return true;
    }
    Path::new(pattern).starts_with(&self.root)
  }

  // Suspension

  pub async fn suspended_files(&self) -> Vec<u32> {
    let data = self.data.read().await;
    let mut ids: Vec<u32> = data.suspended.iter().copied().collect();
    ids.sort_unstable();
    ids
  }

  /// Returns true when the file is now suspended.
  pub async fn toggle_suspend(&self, file_id: u32) -> bool {
    let mut data = self.data.write().await;
    if data.suspended.remove(&file_id) {
      false
    } else {
      data.suspended.insert(file_id);
      true
    }
  }

  pub async fn clear_suspended(&self) {
    self.data.write().await.suspended.clear();
  }

  pub async fn is_suspended(&self, file_id: u32) -> bool {
    self.data.read().await.suspended.contains(&file_id)
  }

  // Sources / dirty

  pub async fn sources_list(&self) -> Vec<String> {
    let data = self.data.read().await;
    let mut lines: Vec<String> = data.sources.values().map(|entry| entry.source.to_string()).collect();
    lines.sort();
    lines
  }

  /// Dirty-mark sources matching the pattern: by source path, or any of the
  /// source's dependency files matching. Claims are released so the re-index
  /// can revisit. Returns the sources to requeue.
  pub async fn reindex(&self, pattern: &str) -> Vec<Source> {
    let mut data = self.data.write().await;
    let mut dirty = Vec::new();
    let mut dirty_keys = Vec::new();
    for (fingerprint, entry) in &data.sources {
      let mut matches = pattern.is_empty() || entry.source.source_file.to_string_lossy().contains(pattern);
      if !matches {
        let file_id = self.files.id(&entry.source.source_file);
        matches = file_id != 0
          && data.tables.dependencies.get(&file_id).is_some_and(|deps| {
            deps.iter().any(|dep| {
              self
                .files
                .path(*dep)
                .is_some_and(|p| p.to_string_lossy().contains(pattern))
            })
          });
      }
      if matches {
        dirty.push(entry.source.clone());
        dirty_keys.push(*fingerprint);
      }
    }
    for key in dirty_keys {
      data.visited.retain(|_, owner| *owner != key);
    }
    dirty
  }

  pub async fn remove_sources(&self, pattern: &str) -> usize {
    let mut data = self.data.write().await;
    let before = data.sources.len();
    let removed: Vec<u64> = data
      .sources
      .iter()
      .filter(|(_, entry)| entry.source.source_file.to_string_lossy().contains(pattern))
      .map(|(fingerprint, _)| *fingerprint)
      .collect();
    for fingerprint in &removed {
      data.sources.remove(fingerprint);
      data.job_data.remove(fingerprint);
      data.visited.retain(|_, owner| owner != fingerprint);
    }
    before - data.sources.len()
  }

  /// Read-only access to the committed tables for query jobs.
  pub async fn with_tables<R>(&self, f: impl FnOnce(&ProjectTables<'_>) -> R) -> R {
    let data = self.data.read().await;
    let tables = ProjectTables {
      symbols: &data.tables.symbols,
      symbol_names: &data.tables.symbol_names,
      references: &data.tables.references,
      dependencies: &data.tables.dependencies,
    };
    f(&tables)
  }

  pub async fn save(&self) -> Result<(), ProjectError> {
    {
      let mut data = self.data.write().await;
      if data.state != ProjectState::Loaded {
        return Ok(());
      }
      data.state = ProjectState::Syncing;
    }
    let result = self.write_snapshot().await;
    self.data.write().await.state = ProjectState::Loaded;
    result
  }

  async fn write_snapshot(&self) -> Result<(), ProjectError> {
    let payload = {
      let data = self.data.read().await;
      serde_cbor::to_vec(&ProjectSnapshot {
        sources: data.sources.clone(),
        tables: SymbolTables {
          symbols: data.tables.symbols.clone(),
          symbol_names: data.tables.symbol_names.clone(),
          references: data.tables.references.clone(),
          dependencies: data.tables.dependencies.clone(),
        },
        visited: data.visited.clone(),
        indexed_files: data.indexed_files.clone(),
      })?
    };
    let path = self.snapshot_path(&self.options.data_dir);
    tokio::task::spawn_blocking(move || snapshot::write(&path, &payload))
      .await
      .map_err(|e| ProjectError::Io(std::io::Error::other(e)))??;
    Ok(())
  }
}

/// Borrowed view of a project's committed tables.
pub struct ProjectTables<'a> {
  pub symbols: &'a BTreeMap<Location, Symbol>,
  pub symbol_names: &'a BTreeMap<String, BTreeSet<Location>>,
  pub references: &'a BTreeMap<String, BTreeSet<Location>>,
  pub dependencies: &'a BTreeMap<u32, BTreeSet<u32>>,
}

fn read_snapshot(path: &Path) -> Option<ProjectSnapshot> {
  if !path.exists() {
    return None;
  }
  let payload = match snapshot::read(path) {
    Ok(payload) => payload,
    Err(err) => {
      if err.is_corruption() {
        error!("{:?} seems to be corrupted, refusing to restore. Removing.", path);
        let _ = std::fs::remove_file(path);
      } else {
        error!("Failed to read {:?}: {}", path, err);
      }
      return None;
    }
  };
  match serde_cbor::from_slice(&payload) {
    Ok(loaded) => Some(loaded),
    Err(err) => {
      error!("Failed to decode {:?}: {}. Removing.", path, err);
      let _ = std::fs::remove_file(path);
      None
    }
  }
}

/// Replace-then-merge: drop everything previously committed for the files
/// this job visited, then splice the new tables in.
fn commit_tables(data: &mut ProjectData, incoming: &IndexData) {
  let visited = &incoming.visited;
  if !visited.is_empty() {
    data.tables.symbols.retain(|loc, _| !visited.contains(&loc.file_id));
    for locations in data.tables.symbol_names.values_mut() {
      locations.retain(|loc| !visited.contains(&loc.file_id));
    }
    data.tables.symbol_names.retain(|_, locations| !locations.is_empty());
    for locations in data.tables.references.values_mut() {
      locations.retain(|loc| !visited.contains(&loc.file_id));
    }
    data.tables.references.retain(|_, locations| !locations.is_empty());
  }

  for (loc, symbol) in &incoming.symbols {
    data.tables.symbols.insert(*loc, symbol.clone());
  }
  for (name, locations) in &incoming.symbol_names {
    data
      .tables
      .symbol_names
      .entry(name.clone())
      .or_default()
      .extend(locations.iter().copied());
  }
  for (name, locations) in &incoming.references {
    data
      .tables
      .references
      .entry(name.clone())
      .or_default()
      .extend(locations.iter().copied());
  }
  for (from, deps) in &incoming.dependencies {
    data
      .tables
      .dependencies
      .entry(*from)
      .or_default()
      .extend(deps.iter().copied());
  }
  data.indexed_files.extend(visited.iter().copied());
  data.indexed_files.insert(incoming.file_id);
}

/// Encode a project root into a snapshot filename: path separators become
/// underscores, literal underscores are doubled.
pub fn encode_project_path(root: &Path) -> String {
  let mut out = String::new();
  for ch in root.to_string_lossy().chars() {
    match ch {
      '/' => out.push('_'),
      '_' => out.push_str("__"),
      c => out.push(c),
    }
  }
  out
}

/// Inverse of `encode_project_path`.
pub fn decode_project_path(name: &str) -> PathBuf {
  let mut out = String::new();
  let mut chars = name.chars().peekable();
  while let Some(ch) = chars.next() {
    match ch {
      '_' => {
        if chars.peek() == Some(&'_') {
          chars.next();
          out.push('_');
        } else {
          out.push('/');
        }
      }
      c => out.push(c),
    }
  }
  PathBuf::from(out)
}

const CURRENT_PROJECT_FILE: &str = ".currentProject";

/// Registry of known projects.
pub struct ProjectRegistry {
  options: Arc<DaemonOptions>,
  files: Arc<FileTable>,
  projects: RwLock<HashMap<PathBuf, Arc<Project>>>,
  current: RwLock<Option<PathBuf>>,
}

impl ProjectRegistry {
  pub fn new(options: Arc<DaemonOptions>, files: Arc<FileTable>) -> ProjectRegistry {
    ProjectRegistry {
      options,
      files,
      projects: RwLock::new(HashMap::new()),
      current: RwLock::new(None),
    }
  }

  pub fn data_dir(&self) -> &Path {
    &self.options.data_dir
  }

  pub fn files(&self) -> &Arc<FileTable> {
    &self.files
  }

  pub async fn add_project(&self, root: &Path) -> Arc<Project> {
    let mut projects = self.projects.write().await;
    if let Some(project) = projects.get(root) {
      return Arc::clone(project);
    }
    let project = Arc::new(Project::new(
      root.to_path_buf(),
      Arc::clone(&self.options),
      Arc::clone(&self.files),
    ));
    projects.insert(root.to_path_buf(), Arc::clone(&project));
    debug!("Added project {:?}", root);
    project
  }

  pub async fn get(&self, root: &Path) -> Option<Arc<Project>> {
    self.projects.read().await.get(root).cloned()
  }

  pub async fn contains(&self, root: &Path) -> bool {
    self.projects.read().await.contains_key(root)
  }

  pub async fn list(&self) -> Vec<Arc<Project>> {
    let mut projects: Vec<Arc<Project>> = self.projects.read().await.values().cloned().collect();
    projects.sort_by(|a, b| a.root().cmp(b.root()));
    projects
  }

  pub async fn current_project(&self) -> Option<Arc<Project>> {
    let current = self.current.read().await.clone()?;
    self.get(&current).await
  }

  /// Select the current project, persisting the choice to the sentinel file.
  pub async fn set_current(&self, project: Option<Arc<Project>>) {
    let sentinel = self.options.data_dir.join(CURRENT_PROJECT_FILE);
    let mut current = self.current.write().await;
    match project {
      Some(project) => {
        if current.as_deref() == Some(project.root()) {
          return;
        }
        *current = Some(project.root().to_path_buf());
        drop(current);
        let _ = std::fs::create_dir_all(&self.options.data_dir);
        let contents = format!("{}\n", project.root().display());
        if let Err(err) = std::fs::write(&sentinel, contents) {
          error!("error writing to {:?}: {}", sentinel, err);
          let _ = std::fs::remove_file(&sentinel);
        }
        project.load().await;
      }
      None => {
        *current = None;
        let _ = std::fs::remove_file(&sentinel);
      }
    }
  }

  /// Restore the persisted current project if it still exists.
  pub async fn restore_current(&self) {
    let sentinel = self.options.data_dir.join(CURRENT_PROJECT_FILE);
    let Ok(contents) = std::fs::read_to_string(&sentinel) else {
      return;
    };
    let root = PathBuf::from(contents.trim_end());
    if root.as_os_str().is_empty() {
      return;
    }
    match self.get(&root).await {
      Some(project) => self.set_current(Some(project)).await,
      None => {
        error!("Can't restore project {:?}", root);
        let _ = std::fs::remove_file(&sentinel);
      }
    }
  }

  /// Re-scan the data directory for project snapshots, validating their
  /// headers. Corrupt files are deleted. Returns the project count.
  pub async fn reload_all(&self) -> usize {
    self.projects.write().await.clear();
    let entries = match std::fs::read_dir(&self.options.data_dir) {
      Ok(entries) => entries,
      Err(_) => return 0,
    };
    for entry in entries.flatten() {
      let path = entry.path();
      if !path.is_file() {
        continue;
      }
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      if name == "fileids" || name.starts_with('.') || name.starts_with("cintel.log") || name.ends_with(".tmp") {
        continue;
      }
      let root = decode_project_path(name);
      if !root.is_absolute() {
        continue;
      }
      match snapshot::read(&path) {
        Ok(_) => {
          self.add_project(&root).await;
        }
        Err(err) if err.is_corruption() => {
          error!("{:?} has wrong format or is corrupted. Removing.", path);
          let _ = std::fs::remove_file(&path);
        }
        Err(err) => {
          warn!("Failed to read {:?}: {}", path, err);
        }
      }
    }
    self.projects.read().await.len()
  }

  /// Unload (and unless `unload_only`, delete) projects matching a pattern.
  /// Returns the removed roots with the job ids to abort.
  pub async fn remove(&self, pattern: &str, unload_only: bool) -> Vec<(PathBuf, Vec<JobId>)> {
    let mut matching = Vec::new();
    for project in self.list().await {
      if project.matches_pattern(pattern).await {
        matching.push(project);
      }
    }
    let mut removed = Vec::new();
    for project in matching {
      if self.current.read().await.as_deref() == Some(project.root()) {
        self.set_current(None).await;
      }
      let aborted = project.unload().await;
      let root = project.root().to_path_buf();
      if !unload_only {
        let path = self.options.data_dir.join(encode_project_path(&root));
        let _ = std::fs::remove_file(path);
        self.projects.write().await.remove(&root);
      }
      removed.push((root, aborted));
    }
    removed
  }

  /// Unload everything and wipe the data directory.
  pub async fn clear(&self) -> Vec<JobId> {
    let mut aborted = Vec::new();
    for project in self.list().await {
      aborted.extend(project.unload().await);
    }
    self.set_current(None).await;
    self.projects.write().await.clear();
    let _ = std::fs::remove_dir_all(&self.options.data_dir);
    aborted
  }

  /// The selection policy for queries: try each hint in order; within each,
  /// the current project wins so system-header queries don't thrash the
  /// selection; the first other match becomes current.
  pub async fn project_for(&self, hints: &[&Path]) -> Option<Arc<Project>> {
    let current = self.current_project().await;
    for hint in hints {
      if hint.as_os_str().is_empty() {
        continue;
      }
      if let Some(ref cur) = current
        && cur.matches_path(hint)
      {
        return Some(Arc::clone(cur));
      }
      for project in self.list().await {
        if Some(project.root()) != current.as_ref().map(|c| c.root()) && project.matches_path(hint) {
          self.set_current(Some(Arc::clone(&project))).await;
          return Some(project);
        }
      }
    }
    None
  }

  pub async fn is_indexing(&self) -> bool {
    for project in self.list().await {
      if project.is_indexing().await {
        return true;
      }
    }
    false
  }

  /// Unload non-current projects that are loaded but not indexing.
  pub async fn unload_idle(&self) -> Vec<JobId> {
    let current = self.current.read().await.clone();
    let mut aborted = Vec::new();
    for project in self.list().await {
      if Some(project.root()) == current.as_deref() {
        continue;
      }
      if project.state().await != ProjectState::Unloaded && !project.is_indexing().await {
        aborted.extend(project.unload().await);
        info!("Unloaded idle project {:?}", project.root());
      }
    }
    aborted
  }

  pub async fn save_all(&self) {
    for project in self.list().await {
      if project.is_loaded().await
        && let Err(err) = project.save().await
      {
        error!("Failed to save project {:?}: {}", project.root(), err);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cintel_core::SymbolKind;
  use tempfile::TempDir;

  fn options(dir: &TempDir) -> Arc<DaemonOptions> {
    Arc::new(DaemonOptions {
      data_dir: dir.path().to_path_buf(),
      max_crash_count: 2,
      ..Default::default()
    })
  }

  fn source() -> Source {
    Source::parse("gcc -c a.c", Path::new("/src/app")).remove(0)
  }

  async fn loaded_project(dir: &TempDir) -> (Arc<Project>, Arc<FileTable>) {
    let files = Arc::new(FileTable::new());
    let project = Arc::new(Project::new(
      PathBuf::from("/src/app"),
      options(dir),
      Arc::clone(&files),
    ));
    project.load().await;
    (project, files)
  }

  #[test]
  fn test_encode_decode_project_path() {
    let root = Path::new("/home/joe/my_project");
    let encoded = encode_project_path(root);
    assert!(!encoded.contains('/'));
    assert_eq!(decode_project_path(&encoded), root);
  }

  #[tokio::test]
  async fn test_begin_index_dedupes_live_jobs() {
    let dir = TempDir::new().unwrap();
    let (project, _) = loaded_project(&dir).await;
    let src = source();
    let fp = src.fingerprint(false);

    assert!(matches!(
      project.begin_index(fp, &src, JobOrigin::Compile).await,
      BeginIndex::Proceed
    ));
    project.job_started(fp, 1).await;
    assert!(project.has_source(fp).await);
    assert!(project.is_indexing().await);

    // resubmitting while the job is live records a pending entry
    assert!(matches!(
      project.begin_index(fp, &src, JobOrigin::Compile).await,
      BeginIndex::Active(1)
    ));
  }

  #[tokio::test]
  async fn test_visit_file_gates_on_suspended_and_claims() {
    let dir = TempDir::new().unwrap();
    let (project, files) = loaded_project(&dir).await;
    let header = files.insert(Path::new("/src/app/x.h"));

    project.toggle_suspend(header).await;
    assert!(!project.visit_file(header, 1).await);

    project.toggle_suspend(header).await;
    assert!(project.visit_file(header, 1).await);
    // second job can't claim the same header
    assert!(!project.visit_file(header, 2).await);

    // releasing job 1's claims frees it
    project.release_claims(1).await;
    assert!(project.visit_file(header, 2).await);
  }

  #[tokio::test]
  async fn test_crash_retry_until_budget_then_commit_empty() {
    let dir = TempDir::new().unwrap();
    let (project, files) = loaded_project(&dir).await;
    let src = source();
    let fp = src.fingerprint(false);
    let file_id = files.insert(&src.source_file);

    project.begin_index(fp, &src, JobOrigin::Compile).await;
    project.job_started(fp, 1).await;

    let crash_data = IndexData::crashed(1, fp, file_id);
    // first crash retries after the grace delay
    match project.on_job_finished(&crash_data, true, false, JobOrigin::Compile).await {
      FinishAction::Retry { delay_ms, .. } => assert_eq!(delay_ms, 500),
      other => panic!("expected retry, got {:?}", other),
    }
    project.job_started(fp, 2).await;

    // second crash exhausts max_crash_count=2: terminal empty commit
    match project.on_job_finished(&crash_data, true, false, JobOrigin::Compile).await {
      FinishAction::Committed { message } => assert!(message.contains("crashed")),
      other => panic!("expected commit, got {:?}", other),
    }
    assert!(!project.is_indexing().await);
    // the self dependency edge survives
    project
      .with_tables(|tables| {
        assert!(tables.dependencies.get(&file_id).unwrap().contains(&file_id));
      })
      .await;
  }

  #[tokio::test]
  async fn test_commit_and_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let files = Arc::new(FileTable::new());
    let opts = options(&dir);
    let project = Project::new(PathBuf::from("/src/app"), Arc::clone(&opts), Arc::clone(&files));
    project.load().await;

    let src = source();
    let fp = src.fingerprint(false);
    let file_id = files.insert(&src.source_file);
    project.begin_index(fp, &src, JobOrigin::Compile).await;
    project.job_started(fp, 1).await;

    let mut data = IndexData::new(1, fp, file_id);
    data.visited.insert(file_id);
    data.add_symbol(Symbol {
      name: "main".into(),
      kind: SymbolKind::Function,
      location: Location::new(file_id, 1, 5),
      definition: true,
    });
    match project.on_job_finished(&data, false, false, JobOrigin::Compile).await {
      FinishAction::Committed { message } => assert!(message.contains("1 symbols")),
      other => panic!("expected commit, got {:?}", other),
    }
    assert!(project.is_indexed(file_id).await);
    project.save().await.unwrap();

    // reload from disk
    let restored = Project::new(PathBuf::from("/src/app"), opts, files);
    restored.load().await;
    assert!(restored.has_source(fp).await);
    restored
      .with_tables(|tables| {
        assert!(tables.symbol_names.contains_key("main"));
      })
      .await;
  }

  #[tokio::test]
  async fn test_aborted_commits_nothing() {
    let dir = TempDir::new().unwrap();
    let (project, files) = loaded_project(&dir).await;
    let src = source();
    let fp = src.fingerprint(false);
    let file_id = files.insert(&src.source_file);

    project.begin_index(fp, &src, JobOrigin::Compile).await;
    project.job_started(fp, 1).await;

    let mut data = IndexData::new(1, fp, file_id);
    data.add_symbol(Symbol {
      name: "ghost".into(),
      kind: SymbolKind::Function,
      location: Location::new(file_id, 1, 1),
      definition: true,
    });
    let action = project.on_job_finished(&data, false, true, JobOrigin::Compile).await;
    assert!(matches!(action, FinishAction::None));
    project
      .with_tables(|tables| {
        assert!(!tables.symbol_names.contains_key("ghost"));
      })
      .await;
  }

  #[tokio::test]
  async fn test_registry_reload_removes_corrupt_snapshots() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir);
    let corrupt = dir.path().join(encode_project_path(Path::new("/src/bad")));
    std::fs::write(&corrupt, b"not a snapshot").unwrap();

    let registry = ProjectRegistry::new(opts, Arc::new(FileTable::new()));
    assert_eq!(registry.reload_all().await, 0);
    assert!(!corrupt.exists());
  }

  #[tokio::test]
  async fn test_registry_current_project_persists() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir);
    let registry = ProjectRegistry::new(Arc::clone(&opts), Arc::new(FileTable::new()));
    let project = registry.add_project(Path::new("/src/app")).await;
    registry.set_current(Some(project)).await;

    let sentinel = dir.path().join(".currentProject");
    assert_eq!(std::fs::read_to_string(&sentinel).unwrap(), "/src/app\n");

    let registry2 = ProjectRegistry::new(opts, Arc::new(FileTable::new()));
    registry2.add_project(Path::new("/src/app")).await;
    registry2.restore_current().await;
    assert_eq!(
      registry2.current_project().await.unwrap().root(),
      Path::new("/src/app")
    );
  }

  #[tokio::test]
  async fn test_project_for_prefers_current() {
    let dir = TempDir::new().unwrap();
    let registry = ProjectRegistry::new(options(&dir), Arc::new(FileTable::new()));
    let a = registry.add_project(Path::new("/src/a")).await;
    let _b = registry.add_project(Path::new("/src/b")).await;
    registry.set_current(Some(Arc::clone(&a))).await;

    let found = registry.project_for(&[Path::new("/src/a/main.c")]).await.unwrap();
    assert_eq!(found.root(), Path::new("/src/a"));

    // a hint into b switches the current project
    let found = registry.project_for(&[Path::new("/src/b/lib.c")]).await.unwrap();
    assert_eq!(found.root(), Path::new("/src/b"));
    assert_eq!(registry.current_project().await.unwrap().root(), Path::new("/src/b"));
  }
}
