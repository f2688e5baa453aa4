//! Local worker supervision.
//!
//! Each locally-dispatched job forks a short-lived `cintel-worker` process.
//! The serialized job is streamed over the worker's stdin; the worker
//! connects back to the daemon (or, for borrowed jobs, to the originating
//! daemon over TCP) for the visit-file handshake and the final result. A
//! nonzero exit or anything on stderr is reported as a crash; the actual
//! `IndexerResult` payload arrives over the socket, never through the pipe.

use crate::jobs::IndexerJob;
use crate::scheduler::{Event, SchedulerHandle};
use cintel_core::DaemonOptions;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error};
use wire::{WorkerDestination, WorkerJob, write_worker_job};

/// Cap on captured worker stderr.
const MAX_STDERR_BYTES: usize = 256 * 1024;

/// Handle to a spawned worker: its token in the scheduler's local map and a
/// kill switch consumed on abort.
pub struct SpawnedWorker {
  pub token: u64,
  pub kill: oneshot::Sender<()>,
}

/// Build the stdin payload for a job.
fn worker_payload(job: &IndexerJob, blocked_files: &HashMap<u32, PathBuf>, options: &DaemonOptions) -> WorkerJob {
  let (destination, job_id) = match &job.borrowed {
    Some(from) => (
      WorkerDestination::Tcp {
        host: from.host.clone(),
        port: from.port,
      },
      from.origin_id,
    ),
    None => (
      WorkerDestination::Unix {
        socket: options.socket_path.clone(),
      },
      job.id,
    ),
  };
  WorkerJob {
    destination,
    unit: job.unit.clone(),
    project: job.project.clone(),
    job_id,
    job_key: job.fingerprint,
    visit_file_timeout_ms: options.visit_file_timeout_ms,
    indexer_message_timeout_ms: options.indexer_message_timeout_ms,
    connect_timeout_ms: options.connect_timeout_ms,
    blocked_files: blocked_files.clone(),
    default_arguments: options.default_arguments.clone(),
    include_paths: options.include_paths.clone(),
    dirty: matches!(job.origin, crate::jobs::JobOrigin::Dirty),
  }
}

/// Spawn a worker for a job. Failures surface as a `WorkerFinished` crash
/// event rather than an error here, so the scheduler has a single path for
/// subprocess outcomes.
pub fn spawn(
  token: u64,
  job: &IndexerJob,
  blocked_files: &HashMap<u32, PathBuf>,
  options: &Arc<DaemonOptions>,
  scheduler: SchedulerHandle,
) -> SpawnedWorker {
  let payload = worker_payload(job, blocked_files, options);
  let binary = options.worker_binary();
  let source_file = job.unit.source_file.clone();
  let (kill_tx, kill_rx) = oneshot::channel();

  tokio::spawn(async move {
    let started = Instant::now();
    let result = supervise(&binary, payload, kill_rx).await;
    let (exit_code, stderr) = match result {
      Ok(outcome) => outcome,
      Err(err) => {
        error!("Couldn't start {:?}: {}", binary, err);
        (-1, format!("failed to spawn worker: {}", err))
      }
    };
    debug!(
      "worker for {:?} finished with {} after {}ms",
      source_file,
      exit_code,
      started.elapsed().as_millis()
    );
    scheduler.send(Event::WorkerFinished { token, exit_code, stderr });
  });

  SpawnedWorker { token, kill: kill_tx }
}

async fn supervise(
  binary: &PathBuf,
  payload: WorkerJob,
  mut kill_rx: oneshot::Receiver<()>,
) -> std::io::Result<(i32, String)> {
  let mut child = Command::new(binary)
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .env("LIBCLANG_NOTHREADS", "1")
    .kill_on_drop(true)
    .spawn()?;

  {
    let mut stdin = child
      .stdin
      .take()
      .ok_or_else(|| std::io::Error::other("child stdin was not captured"))?;
    if let Err(err) = write_worker_job(&mut stdin, &payload).await {
      let _ = child.kill().await;
      return Err(std::io::Error::other(format!("writing job to worker: {}", err)));
    }
    // closing stdin signals end-of-job
  }

  let mut stderr_pipe = child
    .stderr
    .take()
    .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;
  let stderr_task = tokio::spawn(async move {
    let mut out = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
      match stderr_pipe.read(&mut buf).await {
        Ok(0) | Err(_) => break,
        Ok(n) => {
          if out.len() < MAX_STDERR_BYTES {
            let take = (MAX_STDERR_BYTES - out.len()).min(n);
            out.extend_from_slice(&buf[..take]);
          }
        }
      }
    }
    out
  });

  let status = tokio::select! {
    status = child.wait() => status?,
    _ = &mut kill_rx => {
      let _ = child.kill().await;
      child.wait().await?
    }
  };

  let stderr_bytes = stderr_task.await.unwrap_or_default();
  let stderr = String::from_utf8_lossy(&stderr_bytes).trim().to_string();
  Ok((status.code().unwrap_or(-1), stderr))
}
