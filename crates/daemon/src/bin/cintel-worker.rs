//! The indexing helper.
//!
//! Short-lived, one job per process: reads its serialized job from stdin,
//! connects back to the daemon that wants the result (the local daemon's
//! unix socket, or the originating daemon's TCP port for borrowed jobs),
//! runs the extractor with the visit-file handshake over that connection,
//! and posts the final `IndexerResult` before exiting. The daemon treats a
//! nonzero exit or any stderr output as a crash.

use daemon::extract::{self, ExtractError, VisitGate, VisitReply};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use wire::{FramedIo, Message, WorkerDestination, WorkerJob, read_worker_job};

struct RemoteGate<S> {
  io: FramedIo<S>,
  project: PathBuf,
  job_key: u64,
  timeout_ms: u64,
  /// path -> file id, pre-claimed by the origin; denied without a round trip
  blocked: HashMap<PathBuf, u32>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> VisitGate for RemoteGate<S> {
  async fn visit(&mut self, path: &Path) -> Result<VisitReply, ExtractError> {
    if let Some(file_id) = self.blocked.get(path) {
      return Ok(VisitReply {
        file_id: *file_id,
        path: path.to_path_buf(),
        visit: false,
      });
    }
    wire::send(
      &mut self.io,
      &Message::VisitFile {
        project: self.project.clone(),
        path: path.to_path_buf(),
        job_key: self.job_key,
      },
    )
    .await
    .map_err(|err| ExtractError::Gate(err.to_string()))?;

    let reply = with_timeout(self.timeout_ms, wire::recv(&mut self.io))
      .await
      .map_err(|err| ExtractError::Gate(err.to_string()))?;
    match reply {
      Some(Message::VisitFileResponse { file_id, path, visit }) => Ok(VisitReply { file_id, path, visit }),
      Some(other) => Err(ExtractError::Gate(format!("unexpected reply: {:?}", other))),
      None => Err(ExtractError::Gate("daemon closed the connection".into())),
    }
  }
}

/// `0` means wait forever.
async fn with_timeout<T, E: std::fmt::Display>(
  timeout_ms: u64,
  fut: impl Future<Output = Result<T, E>>,
) -> Result<T, String> {
  if timeout_ms == 0 {
    return fut.await.map_err(|err| err.to_string());
  }
  match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
    Ok(result) => result.map_err(|err| err.to_string()),
    Err(_) => Err("timed out".into()),
  }
}

async fn run_job<S: AsyncRead + AsyncWrite + Unpin>(io: FramedIo<S>, job: WorkerJob) -> i32 {
  let mut blocked = HashMap::new();
  for (file_id, path) in &job.blocked_files {
    blocked.insert(path.clone(), *file_id);
  }
  // -I flags in the daemon-wide default arguments count as include paths too
  let mut include_paths = job.include_paths.clone();
  let mut take_next = false;
  for arg in &job.default_arguments {
    if take_next {
      include_paths.push(PathBuf::from(arg));
      take_next = false;
    } else if arg == "-I" {
      take_next = true;
    } else if let Some(rest) = arg.strip_prefix("-I") {
      include_paths.push(PathBuf::from(rest));
    }
  }

  let mut gate = RemoteGate {
    io,
    project: job.project.clone(),
    job_key: job.job_key,
    timeout_ms: job.visit_file_timeout_ms,
    blocked,
  };
  let data = match extract::run(&job.unit, job.job_id, job.job_key, job.dirty, &include_paths, &mut gate).await {
    Ok(data) => data,
    Err(err) => {
      eprintln!("cintel-worker: extraction failed: {}", err);
      return 3;
    }
  };

  let mut io = gate.io;
  let result = Message::IndexerResult {
    project: job.project,
    data,
  };
  if let Err(err) = with_timeout(job.indexer_message_timeout_ms, wire::send(&mut io, &result)).await {
    eprintln!("cintel-worker: couldn't post result: {}", err);
    return 4;
  }
  // wait for the ack so the daemon has definitely seen the payload
  match with_timeout(job.indexer_message_timeout_ms, wire::recv(&mut io)).await {
    Ok(Some(Message::Finish { .. })) | Ok(None) => 0,
    Ok(Some(other)) => {
      eprintln!("cintel-worker: unexpected ack: {:?}", other);
      5
    }
    Err(err) => {
      eprintln!("cintel-worker: no ack: {}", err);
      5
    }
  }
}

async fn run() -> i32 {
  let mut stdin = tokio::io::stdin();
  let job = match read_worker_job(&mut stdin).await {
    Ok(job) => job,
    Err(err) => {
      eprintln!("cintel-worker: failed to read job from stdin: {}", err);
      return 1;
    }
  };

  match job.destination.clone() {
    WorkerDestination::Unix { socket } => {
      match with_timeout(job.connect_timeout_ms, UnixStream::connect(&socket)).await {
        Ok(stream) => run_job(wire::framed(stream), job).await,
        Err(err) => {
          eprintln!("cintel-worker: can't connect to {:?}: {}", socket, err);
          2
        }
      }
    }
    WorkerDestination::Tcp { host, port } => {
      match with_timeout(job.connect_timeout_ms, TcpStream::connect((host.as_str(), port))).await {
        Ok(stream) => run_job(wire::framed(stream), job).await,
        Err(err) => {
          eprintln!("cintel-worker: can't connect to {}:{}: {}", host, port, err);
          2
        }
      }
    }
  }
}

fn main() {
  // single-threaded on purpose: one job, one connection, no parallelism
  let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
    Ok(runtime) => runtime,
    Err(err) => {
      eprintln!("cintel-worker: failed to build runtime: {}", err);
      std::process::exit(1);
    }
  };
  let code = runtime.block_on(run());
  std::process::exit(code);
}
