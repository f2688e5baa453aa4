//! The scheduling core.
//!
//! One actor task owns all job state: the pending queue, the job table, the
//! processing set, the local worker map, the preprocess backlog, the
//! round-robin remote list and the pending-job-request budget. Every other
//! part of the daemon talks to it through events; each handled batch of
//! events ends with a single trailing `work()` pass so cascades of events
//! coalesce into one scheduling decision.

use crate::jobs::{BorrowedFrom, IndexerJob, JobId, JobOrigin, Outcome, RemoteShip};
use crate::peers::{ConnId, Outbound, PeerHandle, PeerWriter};
use crate::preprocess::{self, PreprocessRequest};
use crate::projects::{BeginIndex, FinishAction, Project, ProjectRegistry, ProjectState};
use crate::stats::StatsBus;
use crate::workers;
use cintel_core::{DaemonOptions, FileTable, IndexData, Source, Unit};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use wire::{JobResponse, Message, ShippedJob};

#[derive(Debug, Clone)]
pub struct Remote {
  pub host: String,
  pub port: u16,
}

#[derive(Debug)]
pub enum Event {
  Compile {
    arguments: String,
    working_directory: PathBuf,
    project_root: Option<PathBuf>,
    reply: Option<oneshot::Sender<bool>>,
  },
  Preprocessed {
    unit: Unit,
    project: PathBuf,
    origin: JobOrigin,
  },
  PreprocessFailed {
    source_file: PathBuf,
  },
  WorkerFinished {
    token: u64,
    exit_code: i32,
    stderr: String,
  },
  IndexerResult {
    project: PathBuf,
    data: Box<IndexData>,
    remote_host: Option<String>,
  },
  /// Delayed completion of a crashed or aborted local job
  FinishFailed {
    job: Box<IndexerJob>,
    data: Box<IndexData>,
  },
  VisitFile {
    project: PathBuf,
    path: PathBuf,
    job_key: u64,
    reply: oneshot::Sender<Message>,
  },
  Announcement {
    host: String,
    port: u16,
  },
  ClientJoined,
  JobRequest {
    num_jobs: u32,
    peer_host: String,
    writer: PeerWriter,
  },
  JobsShipped {
    ids: Vec<JobId>,
    host: String,
    finished: bool,
  },
  JobShipFailed {
    ids: Vec<JobId>,
  },
  JobResponseReceived {
    host: String,
    response: JobResponse,
    conn: Option<ConnId>,
  },
  PeerDisconnected {
    conn: ConnId,
  },
  RescheduleTick,
  UnloadTick,
  /// Jobs whose project was unloaded or removed
  AbortJobs {
    ids: Vec<JobId>,
  },
  RetryIndex {
    source: Source,
    project: PathBuf,
    origin: JobOrigin,
  },
  SetJobCount {
    count: usize,
    reply: oneshot::Sender<String>,
  },
  QueryState {
    reply: oneshot::Sender<SchedulerStatus>,
  },
  Shutdown,
}

/// Snapshot of the scheduler's tables for status/dump queries.
#[derive(Debug, Default)]
pub struct SchedulerStatus {
  pub job_count: usize,
  pub pending: Vec<String>,
  pub local: Vec<String>,
  pub processing: Vec<String>,
  pub busy_preprocess: usize,
  pub backlog_preprocess: usize,
  pub remotes: usize,
  pub announced: bool,
}

#[derive(Clone)]
pub struct SchedulerHandle {
  tx: mpsc::UnboundedSender<Event>,
}

impl SchedulerHandle {
  pub fn send(&self, event: Event) {
    let _ = self.tx.send(event);
  }

  pub async fn status(&self) -> SchedulerStatus {
    let (tx, rx) = oneshot::channel();
    self.send(Event::QueryState { reply: tx });
    rx.await.unwrap_or_default()
  }
}

struct LocalJob {
  job_id: JobId,
  kill: Option<oneshot::Sender<()>>,
}

pub struct Scheduler {
  options: Arc<DaemonOptions>,
  registry: Arc<ProjectRegistry>,
  files: Arc<FileTable>,
  stats: StatsBus,
  peers: PeerHandle,
  rx: mpsc::UnboundedReceiver<Event>,
  handle: SchedulerHandle,

  job_count: usize,
  next_job_id: JobId,
  next_token: u64,
  pending: VecDeque<JobId>,
  jobs: HashMap<JobId, IndexerJob>,
  /// Local-origin jobs dispatched and awaiting a result; a result whose id
  /// is not in here is a losing duplicate and is dropped.
  processing: HashSet<JobId>,
  local: HashMap<u64, LocalJob>,
  pending_preprocess: VecDeque<PreprocessRequest>,
  busy_preprocess: usize,
  /// Round-robin list; the front is tried next and rotates to the back.
  remotes: VecDeque<Remote>,
  pending_job_requests: HashMap<ConnId, u32>,
  announced: bool,
  reschedule_armed: bool,
  work_pending: bool,
}

impl Scheduler {
  pub fn new(
    options: Arc<DaemonOptions>,
    registry: Arc<ProjectRegistry>,
    stats: StatsBus,
    peers: PeerHandle,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
  ) -> Scheduler {
    let files = Arc::clone(registry.files());
    Scheduler {
      job_count: options.job_count,
      options,
      registry,
      files,
      stats,
      peers,
      rx,
      handle: SchedulerHandle { tx },
      next_job_id: 1,
      next_token: 1,
      pending: VecDeque::new(),
      jobs: HashMap::new(),
      processing: HashSet::new(),
      local: HashMap::new(),
      pending_preprocess: VecDeque::new(),
      busy_preprocess: 0,
      remotes: VecDeque::new(),
      pending_job_requests: HashMap::new(),
      announced: false,
      reschedule_armed: false,
      work_pending: false,
    }
  }

  pub fn handle(&self) -> SchedulerHandle {
    self.handle.clone()
  }

  pub async fn run(mut self) {
    while let Some(event) = self.rx.recv().await {
      if matches!(event, Event::Shutdown) {
        self.shutdown();
        return;
      }
      self.handle_event(event).await;
      // drain the burst, then run a single trailing work() pass
      while let Ok(event) = self.rx.try_recv() {
        if matches!(event, Event::Shutdown) {
          self.shutdown();
          return;
        }
        self.handle_event(event).await;
      }
      if self.work_pending {
        self.work_pending = false;
        self.work().await;
      }
    }
  }

  fn shutdown(&mut self) {
    for local in self.local.values_mut() {
      if let Some(kill) = local.kill.take() {
        let _ = kill.send(());
      }
    }
    info!("Scheduler stopped");
  }

  async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Compile {
        arguments,
        working_directory,
        project_root,
        reply,
      } => {
        self.work_pending = true;
        let accepted = self
          .handle_compile(&arguments, &working_directory, project_root.as_deref())
          .await;
        if let Some(reply) = reply {
          let _ = reply.send(accepted);
        }
      }
      Event::Preprocessed { unit, project, origin } => {
        self.work_pending = true;
        self.busy_preprocess = self.busy_preprocess.saturating_sub(1);
        self.index_unit(unit, project, origin).await;
      }
      Event::PreprocessFailed { source_file } => {
        self.work_pending = true;
        self.busy_preprocess = self.busy_preprocess.saturating_sub(1);
        warn!("Dropping {:?}, preprocessing failed", source_file);
      }
      Event::WorkerFinished { token, exit_code, stderr } => {
        self.work_pending = true;
        self.handle_worker_finished(token, exit_code, &stderr).await;
      }
      Event::IndexerResult {
        project,
        data,
        remote_host,
      } => {
        self.work_pending = true;
        self.handle_indexer_result(&project, &data, remote_host).await;
      }
      Event::FinishFailed { job, data } => {
        self.work_pending = true;
        self.handle_finish_failed(*job, &data).await;
      }
      Event::VisitFile {
        project,
        path,
        job_key,
        reply,
      } => {
        self.handle_visit_file(&project, path, job_key, reply).await;
      }
      Event::Announcement { host, port } => {
        self.work_pending = true;
        debug!("Getting job announcement from {}:{}", host, port);
        self.remotes.retain(|remote| remote.host != host);
        self.remotes.push_front(Remote { host, port });
      }
      Event::ClientJoined => {
        self.work_pending = true;
        self.announced = false;
      }
      Event::JobRequest {
        num_jobs,
        peer_host,
        writer,
      } => {
        self.work_pending = true;
        self.handle_job_request(num_jobs as usize, peer_host, writer).await;
      }
      Event::JobsShipped { ids, host, finished } => {
        self.work_pending = true;
        self.handle_jobs_shipped(ids, host, finished);
      }
      Event::JobShipFailed { ids } => {
        self.work_pending = true;
        for id in ids {
          if let Some(job) = self.jobs.get_mut(&id) {
            job.rescheduled = false;
            self.pending.push_back(id);
          }
        }
      }
      Event::JobResponseReceived { host, response, conn } => {
        self.work_pending = true;
        self.handle_job_response(host, response, conn);
      }
      Event::PeerDisconnected { conn } => {
        self.work_pending = true;
        self.pending_job_requests.remove(&conn);
      }
      Event::RescheduleTick => {
        self.work_pending = true;
        self.handle_reschedule_tick();
      }
      Event::UnloadTick => {
        self.work_pending = true;
        let aborted = self.registry.unload_idle().await;
        for id in aborted {
          self.abort_job(id);
        }
      }
      Event::AbortJobs { ids } => {
        self.work_pending = true;
        for id in ids {
          self.abort_job(id);
        }
      }
      Event::RetryIndex { source, project, origin } => {
        self.work_pending = true;
        self.preprocess_source(source, project, origin).await;
      }
      Event::SetJobCount { count, reply } => {
        self.work_pending = true;
        self.job_count = count;
        let _ = reply.send(format!("Changed jobs to {}", count));
      }
      Event::QueryState { reply } => {
        let _ = reply.send(self.status());
      }
      Event::Shutdown => unreachable!("handled by run()"),
    }
  }

  fn status(&self) -> SchedulerStatus {
    let describe = |id: &JobId| -> Option<String> {
      self
        .jobs
        .get(id)
        .map(|job| format!("{}: {}", job.unit.source_file.display(), job.describe_flags()))
    };
    SchedulerStatus {
      job_count: self.job_count,
      pending: self.pending.iter().filter_map(describe).collect(),
      local: self
        .local
        .values()
        .filter_map(|local| describe(&local.job_id))
        .collect(),
      processing: self.processing.iter().filter_map(describe).collect(),
      busy_preprocess: self.busy_preprocess,
      backlog_preprocess: self.pending_preprocess.len(),
      remotes: self.remotes.len(),
      announced: self.announced,
    }
  }

  // Compile intake

  async fn handle_compile(&mut self, arguments: &str, working_directory: &Path, root_override: Option<&Path>) -> bool {
    let sources = Source::parse(arguments, working_directory);
    let mut accepted = false;
    for source in sources {
      let root = self.resolve_project_root(&source, root_override).await;
      if self.should_index(&source, &root).await {
        accepted = true;
        self.preprocess_source(source, root, JobOrigin::Compile).await;
      }
    }
    accepted
  }

  async fn resolve_project_root(&self, source: &Source, root_override: Option<&Path>) -> PathBuf {
    if let Some(current) = self.registry.current_project().await
      && current.matches_path(&source.source_file)
    {
      return current.root().to_path_buf();
    }
    for project in self.registry.list().await {
      if project.matches_path(&source.source_file) {
        return project.root().to_path_buf();
      }
    }
    if let Some(root) = root_override {
      return root.to_path_buf();
    }
    find_project_root(&source.source_file)
  }

  async fn should_index(&self, source: &Source, root: &Path) -> bool {
    if root.as_os_str().is_empty() {
      warn!("Shouldn't index {:?} because of missing project root", source.source_file);
      return false;
    }
    if self.options.ignored_compilers.contains(&source.compiler) {
      warn!("Shouldn't index {:?} because of ignored compiler", source.source_file);
      return false;
    }
    let path = source.source_file.to_string_lossy();
    if self
      .options
      .exclude_filters
      .iter()
      .any(|filter| filter_matches(filter, &path))
    {
      warn!("Shouldn't index {:?} because of exclude filter", source.source_file);
      return false;
    }
    let fingerprint = source.fingerprint(self.options.separate_debug_and_release);
    if let Some(project) = self.registry.get(root).await
      && project.has_source(fingerprint).await
    {
      warn!(
        "Shouldn't index {:?} because we already have indexed it",
        source.source_file
      );
      return false;
    }
    true
  }

  /// Queue a source toward indexing: either through the preprocess pool
  /// (networked or forced) or directly as a raw unit.
  async fn preprocess_source(&mut self, source: Source, root: PathBuf, origin: JobOrigin) {
    let project = self.registry.add_project(&root).await;
    let queued = project.load().await;
    for (queued_source, queued_origin) in queued {
      self.handle.send(Event::RetryIndex {
        source: queued_source,
        project: root.clone(),
        origin: queued_origin,
      });
    }

    if !self.options.force_preprocessing && !self.peers.has_server() {
      debug!("Not preprocessing {:?} since we're not on the farm", source.source_file);
      let unit = Unit::new(source);
      self.index_unit(unit, root, origin).await;
    } else {
      self.pending_preprocess.push_back(PreprocessRequest {
        source,
        project: root,
        origin,
      });
    }
  }

  /// Wrap a unit in a job and queue it, handling supersession of any live
  /// job for the same source.
  async fn index_unit(&mut self, unit: Unit, root: PathBuf, origin: JobOrigin) {
    let Some(project) = self.registry.get(&root).await else {
      warn!("Dropping unit for unknown project {:?}", root);
      return;
    };
    if self.registry.current_project().await.is_none() {
      self.registry.set_current(Some(Arc::clone(&project))).await;
    }
    let fingerprint = unit.source.fingerprint(self.options.separate_debug_and_release);
    match project.begin_index(fingerprint, &unit.source, origin).await {
      BeginIndex::Deferred => {}
      BeginIndex::Active(old_id) => {
        if let Some(old) = self.jobs.get_mut(&old_id) {
          if !old.running_local && old.remote.is_none() && !old.is_complete() {
            // still queued: refresh in place
            old.unit = unit;
            old.origin = origin;
            project.clear_pending(fingerprint).await;
            return;
          }
          self.abort_job(old_id);
        } else {
          // stale bookkeeping; start fresh
          project.clear_pending(fingerprint).await;
          self.create_job(unit, root, fingerprint, origin, &project).await;
        }
      }
      BeginIndex::Proceed => {
        self.create_job(unit, root, fingerprint, origin, &project).await;
      }
    }
  }

  async fn create_job(
    &mut self,
    unit: Unit,
    root: PathBuf,
    fingerprint: u64,
    origin: JobOrigin,
    project: &Arc<Project>,
  ) {
    project.release_claims(fingerprint).await;
    let id = self.next_job_id;
    self.next_job_id += 1;
    let job = IndexerJob::new(id, unit, root, fingerprint, origin);
    debug!("adding job {} for {:?}", id, job.unit.source_file);
    self.jobs.insert(id, job);
    self.pending.push_back(id);
    project.job_started(fingerprint, id).await;
  }

  fn abort_job(&mut self, id: JobId) {
    let Some(job) = self.jobs.get_mut(&id) else {
      return;
    };
    job.aborted = true;
    let still_running = job.running_local;
    let still_remote = job.remote.is_some();
    if still_running {
      let token = self
        .local
        .iter()
        .find(|(_, local)| local.job_id == id)
        .map(|(token, _)| *token);
      if let Some(token) = token
        && let Some(local) = self.local.get_mut(&token)
        && let Some(kill) = local.kill.take()
      {
        let _ = kill.send(());
      }
    }
    self.pending.retain(|pending| *pending != id);
    if !still_running && !still_remote {
      self.processing.remove(&id);
      self.jobs.remove(&id);
    }
  }

  // Worker outcomes

  async fn handle_worker_finished(&mut self, token: u64, exit_code: i32, stderr: &str) {
    let Some(local) = self.local.remove(&token) else {
      return;
    };
    let id = local.job_id;
    let Some(job) = self.jobs.get(&id) else {
      return;
    };
    if !stderr.is_empty() {
      error!("{}", stderr);
    }

    if let Some(from) = &job.borrowed {
      info!(
        "Built remote job {:?} for {} with exit {}",
        job.unit.source_file, from.host, exit_code
      );
      self.jobs.remove(&id);
      return;
    }

    let failed = exit_code != 0 || !stderr.is_empty();
    let complete = job.is_complete();
    if !complete && failed {
      self.processing.remove(&id);
      self.pending.retain(|pending| *pending != id);
      let Some(mut job) = self.jobs.remove(&id) else {
        return;
      };
      if !job.aborted {
        job.crashed = true;
      }
      job.running_local = false;

      let project_ok = match self.registry.get(&job.project).await {
        Some(project) => matches!(project.state().await, ProjectState::Loaded | ProjectState::Syncing),
        None => false,
      };
      if project_ok {
        let file_id = self.files.insert(&job.unit.source_file);
        let data = IndexData::crashed(job.id, job.fingerprint, file_id);
        let handle = self.handle.clone();
        // give the machine a moment before the crash bookkeeping runs
        tokio::spawn(async move {
          tokio::time::sleep(Duration::from_millis(500)).await;
          handle.send(Event::FinishFailed {
            job: Box::new(job),
            data: Box::new(data),
          });
        });
      }
      return;
    }

    if complete {
      // reconciler already handled the result; this is just process cleanup
      if let Some(job) = self.jobs.get_mut(&id) {
        job.running_local = false;
        if job.remote.is_none() {
          self.jobs.remove(&id);
        }
      }
    }
    // clean exit with the result still in flight: the reconciler finishes up
  }

  async fn handle_finish_failed(&mut self, job: IndexerJob, data: &IndexData) {
    let Some(project) = self.registry.get(&job.project).await else {
      return;
    };
    let action = project.on_job_finished(data, job.crashed, job.aborted, job.origin).await;
    self.apply_finish_action(action, &project, None).await;
  }

  // The reconciler

  async fn handle_indexer_result(&mut self, project_path: &Path, data: &IndexData, remote_host: Option<String>) {
    if !self.processing.contains(&data.job_id) {
      // a losing duplicate, or a job we no longer know; drop silently
      debug!("already got a response for job {}", data.job_id);
      return;
    }
    self.processing.remove(&data.job_id);
    let Some(job) = self.jobs.get_mut(&data.job_id) else {
      return;
    };

    match remote_host {
      Some(_) => job.remote = None,
      None => job.running_local = false,
    }

    // we only care about the first result that returns
    if job.outcome.is_none() {
      if !job.aborted {
        job.outcome = Some(match remote_host {
          Some(_) => Outcome::Remote,
          None => Outcome::Local,
        });
      }
      let aborted = job.aborted;
      let origin = job.origin;
      match self.registry.get(project_path).await {
        Some(project) => {
          let action = project.on_job_finished(data, false, aborted, origin).await;
          self.apply_finish_action(action, &project, remote_host.as_deref()).await;
        }
        None => {
          error!(
            "Can't find project root for this result: {:?} job {}",
            project_path, data.job_id
          );
        }
      }
    }

    if let Some(job) = self.jobs.get(&data.job_id)
      && !job.running_local
    {
      self.pending.retain(|pending| *pending != data.job_id);
      self.jobs.remove(&data.job_id);
    }
  }

  async fn apply_finish_action(&mut self, action: FinishAction, project: &Arc<Project>, remote_host: Option<&str>) {
    match action {
      FinishAction::None => {}
      FinishAction::Retry { source, origin, delay_ms } => {
        let root = project.root().to_path_buf();
        if delay_ms == 0 {
          self.preprocess_source(source, root, origin).await;
        } else {
          let handle = self.handle.clone();
          tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            handle.send(Event::RetryIndex {
              source,
              project: root,
              origin,
            });
          });
        }
      }
      FinishAction::Committed { message } => {
        let line = match remote_host {
          Some(host) => format!("{} from {}", message, host),
          None => message,
        };
        self.stats.publish(line);
        if project.is_idle().await {
          let project = Arc::clone(project);
          tokio::spawn(async move {
            if let Err(err) = project.save().await {
              error!("Failed to save project {:?}: {}", project.root(), err);
            }
          });
        }
      }
    }
  }

  // Visit-file handshake

  async fn handle_visit_file(
    &mut self,
    project_path: &Path,
    path: PathBuf,
    job_key: u64,
    reply: oneshot::Sender<Message>,
  ) {
    let mut file_id = 0;
    let mut visit = false;
    let resolved = path.canonicalize().unwrap_or(path);
    if let Some(project) = self.registry.get(project_path).await
      && project.is_valid_job(job_key).await
    {
      file_id = self.files.insert(&resolved);
      visit = project.visit_file(file_id, job_key).await;
    }
    let _ = reply.send(Message::VisitFileResponse {
      file_id,
      path: resolved,
      visit,
    });
  }

  // Peer scheduling

  async fn handle_job_request(&mut self, num_jobs: usize, peer_host: String, writer: PeerWriter) {
    debug!(
      "got a request for {} jobs from {}, {} potential jobs here",
      num_jobs,
      peer_host,
      self.pending.len()
    );
    let mut selected = Vec::new();
    let mut finished = true;
    let queue = std::mem::take(&mut self.pending);
    for id in queue {
      let Some(job) = self.jobs.get_mut(&id) else {
        continue;
      };
      if job.is_complete() {
        self.jobs.remove(&id);
        continue;
      }
      if selected.len() < num_jobs && job.is_exportable() {
        if self.options.compression_remote
          && !job.unit.compressed
          && let Err(err) = job.unit.compress()
        {
          error!("Couldn't compress {:?}: {}", job.unit.source_file, err);
        }
        selected.push(id);
        if selected.len() == num_jobs {
          finished = false;
        }
      } else {
        self.pending.push_back(id);
      }
    }

    let mut shipped = Vec::with_capacity(selected.len());
    for id in &selected {
      let Some(job) = self.jobs.get(id) else {
        continue;
      };
      let blocked_files = match self.registry.get(&job.project).await {
        Some(project) => project.visited_files().await,
        None => HashMap::new(),
      };
      shipped.push(ShippedJob {
        unit: job.unit.clone(),
        project: job.project.clone(),
        id: job.id,
        blocked_files,
      });
    }
    debug!("Sending {} jobs to {} finished {}", shipped.len(), peer_host, finished);

    let message = Message::JobResponse(JobResponse {
      jobs: shipped,
      tcp_port: self.options.tcp_port,
      finished,
    });
    let (done_tx, done_rx) = oneshot::channel();
    let delivered = writer
      .send(Outbound {
        message,
        done: Some(done_tx),
      })
      .is_ok();
    if !delivered {
      self.handle.send(Event::JobShipFailed { ids: selected });
      return;
    }
    let handle = self.handle.clone();
    tokio::spawn(async move {
      let ok = done_rx.await.unwrap_or(false);
      handle.send(if ok {
        Event::JobsShipped {
          ids: selected,
          host: peer_host,
          finished,
        }
      } else {
        Event::JobShipFailed { ids: selected }
      });
    });
  }

  fn handle_jobs_shipped(&mut self, ids: Vec<JobId>, host: String, finished: bool) {
    for id in &ids {
      if let Some(job) = self.jobs.get_mut(id) {
        self.processing.insert(*id);
        job.remote = Some(RemoteShip {
          host: host.clone(),
          started: Instant::now(),
        });
        job.rescheduled = false;
        debug!("Sent job {:?}", job.unit.source_file);
      }
    }
    if finished {
      self.announced = false;
    }
    if !ids.is_empty() {
      self.arm_reschedule_timer();
    }
  }

  fn handle_job_response(&mut self, host: String, response: JobResponse, conn: Option<ConnId>) {
    if let Some(conn) = conn {
      self.pending_job_requests.remove(&conn);
    }
    debug!(
      "Got {} jobs from {} finished {}",
      response.jobs.len(),
      host,
      response.finished
    );
    for shipped in response.jobs {
      let fingerprint = shipped
        .unit
        .source
        .fingerprint(self.options.separate_debug_and_release);
      let id = self.next_job_id;
      self.next_job_id += 1;
      let mut job = IndexerJob::new(id, shipped.unit, shipped.project, fingerprint, JobOrigin::Compile);
      job.borrowed = Some(BorrowedFrom {
        host: host.clone(),
        port: response.tcp_port,
        origin_id: shipped.id,
      });
      job.blocked_files = shipped.blocked_files;
      self.jobs.insert(id, job);
      self.pending.push_back(id);
    }
    if response.finished {
      self.remotes.retain(|remote| remote.host != host);
    }
  }

  // Reschedule timer

  fn arm_reschedule_timer(&mut self) {
    if self.reschedule_armed {
      return;
    }
    self.reschedule_armed = true;
    let handle = self.handle.clone();
    let timeout = Duration::from_millis(self.options.reschedule_timeout_ms);
    tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      handle.send(Event::RescheduleTick);
    });
  }

  fn handle_reschedule_tick(&mut self) {
    self.reschedule_armed = false;
    let now = Instant::now();
    let timeout = Duration::from_millis(self.options.reschedule_timeout_ms);
    let mut rearm = false;
    let ids: Vec<JobId> = self.processing.iter().copied().collect();
    for id in ids {
      let Some(job) = self.jobs.get_mut(&id) else {
        self.processing.remove(&id);
        continue;
      };
      if job.is_complete() {
        // completed while we were shipping it
        self.processing.remove(&id);
        continue;
      }
      if let Some(ship) = &job.remote
        && !job.rescheduled
        && !job.running_local
      {
        if now.duration_since(ship.started) >= timeout {
          error!(
            "rescheduling job {:?} {} it's been {:.1} seconds",
            job.unit.source_file,
            job.id,
            now.duration_since(ship.started).as_secs_f64()
          );
          // stays in the processing table: a late reply is still accepted
          job.rescheduled = true;
          self.pending.push_back(id);
        } else {
          rearm = true;
        }
      }
    }
    if rearm {
      self.arm_reschedule_timer();
    }
  }

  // The work() loop

  async fn work(&mut self) {
    // 1. drain the preprocess backlog under the ceiling
    let in_flight = self.busy_preprocess + self.pending.len();
    let ceiling = self.options.max_pending_preprocess_size.saturating_sub(in_flight);
    let drain = self.pending_preprocess.len().min(ceiling);
    for _ in 0..drain {
      let Some(request) = self.pending_preprocess.pop_front() else {
        break;
      };
      self.busy_preprocess += 1;
      preprocess::spawn(request, Arc::clone(&self.options), self.handle.clone());
    }

    // 2. free local slots
    let requested: usize = self.pending_job_requests.values().map(|n| *n as usize).sum();
    let used = self.busy_preprocess + self.local.len() + requested;
    let mut slots = if self.options.no_local_compiles {
      0
    } else {
      self.job_count.saturating_sub(used)
    };
    debug!(
      "Working. Open slots {} active jobs {} pending jobs {} {}",
      slots,
      self.local.len(),
      self.pending.len(),
      if self.announced { "announced" } else { "not announced" }
    );

    // 3. nothing to run locally and no one to give work to
    if slots == 0 && !self.peers.has_server() {
      return;
    }

    // 4. walk the pending queue
    let mut announcables = 0;
    let queue = std::mem::take(&mut self.pending);
    for id in queue {
      let Some(job) = self.jobs.get_mut(&id) else {
        continue;
      };
      if job.is_complete() {
        if !job.running_local && job.remote.is_none() {
          self.jobs.remove(&id);
        }
        continue;
      }
      if job.aborted {
        if !job.running_local && job.remote.is_none() {
          self.processing.remove(&id);
          self.jobs.remove(&id);
        }
        continue;
      }
      if slots > 0 {
        job.rescheduled = false;
        job.running_local = true;
        if job.borrowed.is_none() {
          self.processing.insert(id);
        }
        let token = self.next_token;
        self.next_token += 1;
        let Some(job) = self.jobs.get(&id) else { continue };
        debug!("starting job locally for {:?} {}", job.unit.source_file, id);
        let spawned = workers::spawn(token, job, &job.blocked_files, &self.options, self.handle.clone());
        self.local.insert(
          token,
          LocalJob {
            job_id: id,
            kill: Some(spawned.kill),
          },
        );
        slots -= 1;
      } else {
        if job.borrowed.is_none() {
          if !self.registry.contains(&job.project).await {
            self.processing.remove(&id);
            self.jobs.remove(&id);
            continue;
          }
          announcables += 1;
        }
        self.pending.push_back(id);
      }
    }

    if !self.peers.has_server() {
      return;
    }

    // 5. advertise leftover work
    if slots == 0 && announcables > 0 && !self.announced {
      self.announced = true;
      debug!("announcing because we have {} announcables", announcables);
      let sent = self.peers.send_to_server(Message::ProxyJobAnnouncement {
        port: self.options.tcp_port,
      });
      if !sent {
        // we are the coordinator (or there is none): announce directly;
        // the receiver derives our host from the connection
        self.peers.broadcast_clients(
          Message::JobAnnouncement {
            host: String::new(),
            port: self.options.tcp_port,
          },
          None,
        );
      }
    }

    // 6. pull work from a peer for the remaining slots
    if slots == 0 || self.remotes.is_empty() {
      return;
    }
    let mut attempts = self.remotes.len();
    while attempts > 0 {
      attempts -= 1;
      let Some(remote) = self.remotes.pop_front() else {
        break;
      };
      self.remotes.push_back(remote.clone());
      debug!("We can grab {} jobs, trying {}", slots, remote.host);
      // TODO: cache these connections; reuse the coordinator link when it
      // is the chosen peer
      match self.peers.request_jobs(&remote.host, remote.port, slots as u32).await {
        Ok(conn) => {
          self.pending_job_requests.insert(conn, slots as u32);
          break;
        }
        Err(err) => {
          error!("Failed to connect to {}:{}: {}", remote.host, remote.port, err);
        }
      }
    }
  }
}

/// Walk up from a source file looking for a plausible project root; the
/// outermost directory with a marker wins.
fn find_project_root(source_file: &Path) -> PathBuf {
  const MARKERS: &[&str] = &[
    "compile_commands.json",
    ".git",
    ".svn",
    "CMakeLists.txt",
    "configure",
    "Makefile",
  ];
  let start = source_file.parent().unwrap_or(source_file);
  let mut best: Option<&Path> = None;
  let mut dir = Some(start);
  while let Some(current) = dir {
    if MARKERS.iter().any(|marker| current.join(marker).exists()) {
      best = Some(current);
    }
    dir = current.parent();
  }
  best.unwrap_or(start).to_path_buf()
}

/// Minimal `*`-wildcard matching for exclude filters; a pattern without a
/// star matches as a substring.
fn filter_matches(pattern: &str, path: &str) -> bool {
  if !pattern.contains('*') {
    return path.contains(pattern);
  }
  let segments: Vec<&str> = pattern.split('*').collect();
  let mut remainder = path;
  for (i, segment) in segments.iter().enumerate() {
    if segment.is_empty() {
      continue;
    }
    match remainder.find(segment) {
      Some(pos) => {
        if i == 0 && pos != 0 {
          return false;
        }
        remainder = &remainder[pos + segment.len()..];
      }
      None => return false,
    }
  }
  if let Some(last) = segments.last()
    && !last.is_empty()
  {
    return path.ends_with(last);
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_filter_matches() {
    assert!(filter_matches("*/CMakeFiles/*", "/src/app/CMakeFiles/feature.c"));
    assert!(!filter_matches("*/CMakeFiles/*", "/src/app/lib/feature.c"));
    assert!(filter_matches("generated", "/src/generated/x.c"));
    assert!(filter_matches("*.pb.c", "/src/proto/msg.pb.c"));
    assert!(!filter_matches("*.pb.c", "/src/proto/msg.c"));
  }

  #[test]
  fn test_find_project_root_picks_outermost_marker() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("sub/deep")).unwrap();
    std::fs::write(root.join("Makefile"), "all:\n").unwrap();
    std::fs::write(root.join("sub/deep/a.c"), "int x;\n").unwrap();
    assert_eq!(find_project_root(&root.join("sub/deep/a.c")), root);
  }

  #[test]
  fn test_find_project_root_falls_back_to_parent() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.c");
    std::fs::write(&file, "int x;\n").unwrap();
    // without markers, some ancestor (possibly the parent itself) is used
    let root = find_project_root(&file);
    assert!(file.starts_with(&root));
  }
}
