//! The query router.
//!
//! Dispatches client queries to the owning project and the matching query
//! job. Replies are a list of output lines plus a finish code; the standard
//! dispositions are "No project" (finish 1), "Project loading" (finish 2,
//! the client may retry) and "Not indexed" for unknown locations.

use crate::jobs::JobOrigin;
use crate::peers::PeerHandle;
use crate::projects::{Project, ProjectRegistry};
use crate::query;
use crate::scheduler::{Event, SchedulerHandle};
use crate::server::ShutdownHandle;
use cintel_core::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info};
use wire::{Message, Method, Request};

/// A buffered query reply: output lines and the finish code.
#[derive(Debug, Default)]
pub struct Reply {
  pub lines: Vec<String>,
  pub code: i32,
}

impl Reply {
  fn ok(lines: Vec<String>) -> Reply {
    Reply { lines, code: 0 }
  }

  fn one(line: impl Into<String>) -> Reply {
    Reply {
      lines: vec![line.into()],
      code: 0,
    }
  }

  fn fail(line: impl Into<String>, code: i32) -> Reply {
    Reply {
      lines: vec![line.into()],
      code,
    }
  }

  fn no_project() -> Reply {
    error!("No project");
    Reply { lines: Vec::new(), code: 1 }
  }

  fn loading() -> Reply {
    Reply::fail("Project loading", 2)
  }
}

pub struct Router {
  registry: Arc<ProjectRegistry>,
  scheduler: SchedulerHandle,
  peers: PeerHandle,
  shutdown: ShutdownHandle,
  exit_code: Arc<AtomicI32>,
}

impl Router {
  pub fn new(
    registry: Arc<ProjectRegistry>,
    scheduler: SchedulerHandle,
    peers: PeerHandle,
    shutdown: ShutdownHandle,
    exit_code: Arc<AtomicI32>,
  ) -> Router {
    Router {
      registry,
      scheduler,
      peers,
      shutdown,
      exit_code,
    }
  }

  pub async fn handle(&self, request: Request) -> Reply {
    match request.method {
      Method::FollowLocation => self.follow_location(&request).await,
      Method::ReferencesLocation => self.references_location(&request).await,
      Method::ReferencesName => self.references_name(&request).await,
      Method::ListSymbols => self.list_symbols(&request).await,
      Method::FindSymbols => self.find_symbols(&request).await,
      Method::Dependencies => self.dependencies(&request).await,
      Method::IsIndexing => self.is_indexing().await,
      Method::IsIndexed => self.is_indexed(&request).await,
      Method::Sources => self.sources(&request).await,
      Method::Reindex => self.reindex(&request).await,
      Method::RemoveFile => self.remove_file(&request).await,
      Method::SuspendFile => self.suspend_file(&request).await,
      Method::Project => self.project(&request).await,
      Method::ReloadProjects => self.reload_projects().await,
      Method::ClearProjects => self.clear_projects().await,
      Method::RemoveProject => self.remove_project(&request, false).await,
      Method::UnloadProject => self.remove_project(&request, true).await,
      Method::JobCount => self.job_count(&request).await,
      Method::Status => self.status().await,
      Method::DumpJobs => self.dump_jobs().await,
      Method::Shutdown => self.shutdown(&request).await,
    }
  }

  /// Project lookup for a query: the explicit location path, then the
  /// "current file" hint, falling back to the current project.
  async fn project_for_query(&self, location: Option<&Path>, current_file: &str) -> Option<Arc<Project>> {
    let mut hints: Vec<&Path> = Vec::new();
    if let Some(path) = location {
      hints.push(path);
    }
    let current_file = Path::new(current_file);
    if !current_file.as_os_str().is_empty() {
      hints.push(current_file);
    }
    match self.registry.project_for(&hints).await {
      Some(project) => Some(project),
      None => self.registry.current_project().await,
    }
  }

  async fn follow_location(&self, request: &Request) -> Reply {
    let Some((path, line, column)) = query::parse_location(request.str_param("location")) else {
      return Reply::fail("Not indexed", 1);
    };
    let Some(project) = self
      .project_for_query(Some(&path), request.str_param("current_file"))
      .await
    else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::loading();
    }

    let files = self.registry.files();
    let file_id = files.id(&path);
    if file_id == 0 {
      return Reply::fail("Not indexed", 1);
    }
    let location = Location::new(file_id, line, column);
    if let Some(target) = project.with_tables(|tables| query::follow_location(tables, location)).await {
      return Reply::one(query::format_location(files, target));
    }

    // The file may be a header shared with another project whose root
    // prefixes it; load and retry there.
    if !path.starts_with(project.root()) {
      for other in self.registry.list().await {
        if other.root() == project.root() || !path.starts_with(other.root()) {
          continue;
        }
        other.load().await;
        if let Some(target) = other.with_tables(|tables| query::follow_location(tables, location)).await {
          return Reply::one(query::format_location(files, target));
        }
      }
    }
    Reply { lines: Vec::new(), code: 1 }
  }

  async fn references_location(&self, request: &Request) -> Reply {
    let Some((path, line, column)) = query::parse_location(request.str_param("location")) else {
      return Reply::fail("Not indexed", 1);
    };
    let Some(project) = self
      .project_for_query(Some(&path), request.str_param("current_file"))
      .await
    else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::loading();
    }
    let files = self.registry.files();
    let file_id = files.id(&path);
    if file_id == 0 {
      return Reply::fail("Not indexed", 1);
    }
    let location = Location::new(file_id, line, column);
    let lines = project
      .with_tables(|tables| {
        let Some(name) = query::symbol_at(tables, location) else {
          return Vec::new();
        };
        query::references_for_name(tables, &name, false)
          .into_iter()
          .map(|site| query::format_location(files, site))
          .collect()
      })
      .await;
    Reply::ok(lines)
  }

  async fn references_name(&self, request: &Request) -> Reply {
    let Some(project) = self.registry.current_project().await else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::loading();
    }
    let name = request.str_param("name").to_string();
    let files = self.registry.files();
    let lines = project
      .with_tables(|tables| {
        query::references_for_name(tables, &name, true)
          .into_iter()
          .map(|site| query::format_location(files, site))
          .collect()
      })
      .await;
    Reply::ok(lines)
  }

  async fn list_symbols(&self, request: &Request) -> Reply {
    let Some(project) = self.registry.current_project().await else {
      return Reply::no_project();
    };
    let pattern = request.str_param("match").to_string();
    let lines = project
      .with_tables(|tables| query::list_symbol_names(tables, &pattern))
      .await;
    Reply::ok(lines)
  }

  async fn find_symbols(&self, request: &Request) -> Reply {
    let Some(project) = self.registry.current_project().await else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::loading();
    }
    let pattern = request.str_param("match").to_string();
    let files = self.registry.files();
    let lines = project
      .with_tables(|tables| query::find_symbols(tables, files, &pattern))
      .await;
    Reply::ok(lines)
  }

  async fn dependencies(&self, request: &Request) -> Reply {
    let path = PathBuf::from(request.str_param("path"));
    let Some(project) = self.project_for_query(Some(&path), "").await else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::loading();
    }
    let files = self.registry.files();
    let lines = project
      .with_tables(|tables| query::dependents_of(tables, files, &path))
      .await;
    Reply::ok(lines)
  }

  async fn is_indexing(&self) -> Reply {
    if self.registry.is_indexing().await {
      return Reply::one("1");
    }
    // jobs can also sit in the scheduler before any project sees them
    let status = self.scheduler.status().await;
    let busy = !status.pending.is_empty()
      || !status.local.is_empty()
      || !status.processing.is_empty()
      || status.busy_preprocess > 0
      || status.backlog_preprocess > 0;
    Reply::one(if busy { "1" } else { "0" })
  }

  async fn is_indexed(&self, request: &Request) -> Reply {
    let path = PathBuf::from(request.str_param("path"));
    let Some(project) = self.project_for_query(Some(&path), "").await else {
      return Reply::one("unknown");
    };
    let file_id = self.registry.files().id(&path);
    let answer = if file_id != 0 && project.is_indexed(file_id).await {
      "indexed"
    } else if project.matches_path(&path) {
      "managed"
    } else {
      "unknown"
    };
    info!("=> {}", answer);
    Reply::one(answer)
  }

  async fn sources(&self, request: &Request) -> Reply {
    let path = request.str_param("path");
    let project = if path.is_empty() {
      self.registry.current_project().await
    } else {
      self.project_for_query(Some(Path::new(path)), "").await
    };
    let Some(project) = project else {
      return Reply::fail("No project", 0);
    };
    if !project.is_loaded().await {
      return Reply::fail("Project loading", 0);
    }
    let mut lines = project.sources_list().await;
    if !path.is_empty() {
      lines.retain(|line| line.contains(path));
    }
    Reply::ok(lines)
  }

  async fn reindex(&self, request: &Request) -> Reply {
    let pattern = request.str_param("match");
    let project = match self.project_for_query(Some(Path::new(pattern)), "").await {
      Some(project) => project,
      None => match self.registry.current_project().await {
        Some(project) => project,
        None => return Reply::no_project(),
      },
    };
    if !project.is_loaded().await {
      return Reply::fail("Project loading", 0);
    }
    let dirty = project.reindex(pattern).await;
    let count = dirty.len();
    for source in dirty {
      self.scheduler.send(Event::RetryIndex {
        source,
        project: project.root().to_path_buf(),
        origin: JobOrigin::Dirty,
      });
    }
    if count > 0 {
      Reply::one(format!("Dirtied {} files", count))
    } else {
      Reply::one("No matches")
    }
  }

  async fn remove_file(&self, request: &Request) -> Reply {
    let pattern = request.str_param("match");
    let Some(project) = self.project_for_query(Some(Path::new(pattern)), "").await else {
      return Reply::no_project();
    };
    if !project.is_loaded().await {
      return Reply::fail("Project loading", 0);
    }
    let count = project.remove_sources(pattern).await;
    if count > 0 {
      Reply::one(format!("Removed {} files", count))
    } else {
      Reply::one("No matches")
    }
  }

  async fn suspend_file(&self, request: &Request) -> Reply {
    let pattern = request.str_param("match");
    let project = if pattern.is_empty() || pattern == "clear" {
      self.registry.current_project().await
    } else {
      self.project_for_query(Some(Path::new(pattern)), "").await
    };
    let Some(project) = project else {
      return Reply::fail("No project", 0);
    };
    if !project.is_loaded().await {
      return Reply::fail("Project loading", 0);
    }

    let files = self.registry.files();
    if pattern.is_empty() {
      let suspended = project.suspended_files().await;
      if suspended.is_empty() {
        return Reply::one(format!(
          "No files suspended for project {}",
          project.root().display()
        ));
      }
      let lines = suspended
        .into_iter()
        .filter_map(|id| files.path(id))
        .map(|path| format!("{} is suspended", path.display()))
        .collect();
      return Reply::ok(lines);
    }
    if pattern == "clear" {
      project.clear_suspended().await;
      return Reply::one("No files are suspended");
    }
    let path = Path::new(pattern);
    if !path.is_file() {
      return Reply::one(format!("{} doesn't seem to exist", pattern));
    }
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let file_id = files.insert(&resolved);
    let suspended = project.toggle_suspend(file_id).await;
    Reply::one(format!(
      "{} is {} suspended",
      resolved.display(),
      if suspended { "now" } else { "no longer" }
    ))
  }

  async fn project(&self, request: &Request) -> Reply {
    let pattern = request.str_param("match");
    if pattern.is_empty() {
      let current = self.registry.current_project().await;
      let mut lines = Vec::new();
      for project in self.registry.list().await {
        let marker = if current.as_ref().map(|c| c.root()) == Some(project.root()) {
          " <="
        } else {
          ""
        };
        lines.push(format!(
          "{} {}{}",
          project.root().display(),
          project.state().await.label(),
          marker
        ));
      }
      return Reply::ok(lines);
    }

    let mut selected = None;
    for project in self.registry.list().await {
      if project.matches_pattern(pattern).await {
        if selected.is_some() {
          return Reply::one(format!("Multiple matches for {}", pattern));
        }
        selected = Some(project);
      }
    }
    match selected {
      Some(project) => {
        let current = self.registry.current_project().await;
        if current.as_ref().map(|c| c.root()) == Some(project.root()) {
          Reply::one(format!("{} is already the active project", project.root().display()))
        } else {
          let line = format!("Selected project: {} for {}", project.root().display(), pattern);
          self.registry.set_current(Some(project)).await;
          Reply::one(line)
        }
      }
      None => Reply::one(format!("No matches for {}", pattern)),
    }
  }

  async fn remove_project(&self, request: &Request, unload_only: bool) -> Reply {
    let pattern = request.str_param("match");
    let removed = self.registry.remove(pattern, unload_only).await;
    if removed.is_empty() {
      return Reply::one(format!("No projects matching {}", pattern));
    }
    let mut lines = Vec::new();
    for (root, aborted) in removed {
      if !aborted.is_empty() {
        self.scheduler.send(Event::AbortJobs { ids: aborted });
      }
      lines.push(format!(
        "{} project: {}",
        if unload_only { "Unloaded" } else { "Deleted" },
        root.display()
      ));
    }
    Reply::ok(lines)
  }

  async fn reload_projects(&self) -> Reply {
    let old = self.registry.list().await.len();
    let new = self.registry.reload_all().await;
    Reply::one(format!("Changed from {} to {} projects", old, new))
  }

  async fn clear_projects(&self) -> Reply {
    let aborted = self.registry.clear().await;
    if !aborted.is_empty() {
      self.scheduler.send(Event::AbortJobs { ids: aborted });
    }
    Reply::one("Cleared projects")
  }

  async fn job_count(&self, request: &Request) -> Reply {
    match request.params.get("count").and_then(|v| v.as_u64()) {
      None => {
        let status = self.scheduler.status().await;
        Reply::one(format!("Running with {} jobs", status.job_count))
      }
      Some(count) if count > 100 => Reply::one(format!("Invalid job count {}", count)),
      Some(count) => {
        let (tx, rx) = oneshot::channel();
        self.scheduler.send(Event::SetJobCount {
          count: count as usize,
          reply: tx,
        });
        match rx.await {
          Ok(line) => Reply::one(line),
          Err(_) => Reply::fail("Scheduler unavailable", 1),
        }
      }
    }
  }

  async fn status(&self) -> Reply {
    let mut lines = vec![format!("cintel {}", env!("CARGO_PKG_VERSION"))];
    let current = self.registry.current_project().await;
    lines.push(format!("projects: {}", self.registry.list().await.len()));
    for project in self.registry.list().await {
      let marker = if current.as_ref().map(|c| c.root()) == Some(project.root()) {
        " <="
      } else {
        ""
      };
      lines.push(format!(
        "  {} {}{}",
        project.root().display(),
        project.state().await.label(),
        marker
      ));
    }
    let status = self.scheduler.status().await;
    lines.push(format!(
      "jobs: {} slots, {} pending, {} local, {} processing",
      status.job_count,
      status.pending.len(),
      status.local.len(),
      status.processing.len()
    ));
    lines.push(format!(
      "preprocess: {} active, {} backlog",
      status.busy_preprocess, status.backlog_preprocess
    ));
    lines.push(format!(
      "peers: {} remotes, {}",
      status.remotes,
      if self.peers.has_server() {
        "coordinator reachable"
      } else {
        "no coordinator"
      }
    ));
    Reply::ok(lines)
  }

  async fn dump_jobs(&self) -> Reply {
    let status = self.scheduler.status().await;
    let mut lines = Vec::new();
    if !status.pending.is_empty() {
      lines.push("Pending:".to_string());
      lines.extend(status.pending);
    }
    if !status.local.is_empty() {
      lines.push("Local:".to_string());
      lines.extend(status.local);
    }
    if !status.processing.is_empty() {
      lines.push("Processing:".to_string());
      lines.extend(status.processing);
    }
    if status.busy_preprocess > 0 || status.backlog_preprocess > 0 {
      lines.push(format!(
        "Preprocessing:\nactive {} pending {}",
        status.busy_preprocess, status.backlog_preprocess
      ));
    }
    Reply::ok(lines)
  }

  async fn shutdown(&self, request: &Request) -> Reply {
    for project in self.registry.list().await {
      let aborted = project.unload().await;
      if !aborted.is_empty() {
        self.scheduler.send(Event::AbortJobs { ids: aborted });
      }
    }
    let exit_code = request.params.get("exit_code").and_then(|v| v.as_i64());
    match exit_code {
      Some(code) => {
        self.exit_code.store(code as i32, Ordering::Relaxed);
        let forwarded = self.peers.send_to_server(Message::Exit {
          code: code as i32,
          forward: true,
        });
        let notified = if forwarded {
          1
        } else {
          self.peers.broadcast_clients(
            Message::Exit {
              code: code as i32,
              forward: false,
            },
            None,
          )
        };
        if notified == 0 {
          self.shutdown.shutdown();
        } else {
          let shutdown = self.shutdown.clone();
          tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            shutdown.shutdown();
          });
        }
      }
      None => self.shutdown.shutdown(),
    }
    Reply::one("Shutting down")
  }
}
