//! The preprocess pool.
//!
//! Raw sources are turned into self-contained preprocessed translation units
//! by running the compiler in preprocess-only mode. The scheduler drains its
//! preprocess backlog through `spawn`, bounded by the ceiling formula in its
//! `work()` loop; each spawned task reports back with a `Preprocessed` or
//! `PreprocessFailed` event.

use crate::jobs::JobOrigin;
use crate::scheduler::{Event, SchedulerHandle};
use cintel_core::{DaemonOptions, Source, Unit};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Cap on captured preprocessor output. Preprocessed units beyond this are
/// almost certainly runaway include graphs.
const MAX_PREPROCESSED_BYTES: usize = 48 * 1024 * 1024;

/// A queued preprocess request, waiting for a slot.
#[derive(Debug)]
pub struct PreprocessRequest {
  pub source: Source,
  pub project: PathBuf,
  pub origin: JobOrigin,
}

/// Run `compiler -E` for one source on the runtime, reporting the resulting
/// unit to the scheduler.
pub fn spawn(request: PreprocessRequest, options: Arc<DaemonOptions>, scheduler: SchedulerHandle) {
  tokio::spawn(async move {
    let started = Instant::now();
    match run(&request, &options).await {
      Ok(preprocessed) => {
        let mut unit = Unit::new(request.source);
        unit.preprocessed = preprocessed;
        unit.preprocess_duration_ms = started.elapsed().as_millis() as u64;
        if options.compression_always
          && let Err(err) = unit.compress()
        {
          error!("Couldn't compress {:?}: {}", unit.source_file, err);
        }
        debug!(
          "Preprocessed {:?} in {}ms ({} bytes)",
          unit.source_file,
          unit.preprocess_duration_ms,
          unit.preprocessed.len()
        );
        scheduler.send(Event::Preprocessed {
          unit,
          project: request.project,
          origin: request.origin,
        });
      }
      Err(err) => {
        error!("Couldn't preprocess {:?}: {}", request.source.source_file, err);
        scheduler.send(Event::PreprocessFailed {
          source_file: request.source.source_file,
        });
      }
    }
  });
}

async fn run(request: &PreprocessRequest, options: &DaemonOptions) -> std::io::Result<Vec<u8>> {
  let source = &request.source;
  let mut command = Command::new(&source.compiler);
  command
    .arg("-E")
    .args(&source.arguments)
    .args(options.default_arguments.iter())
    .arg(&source.source_file)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true);
  for include in &options.include_paths {
    command.arg("-I").arg(include);
  }

  let mut child = command.spawn()?;
  let mut stdout = child
    .stdout
    .take()
    .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;

  let mut output = Vec::new();
  let mut buf = [0u8; 64 * 1024];
  loop {
    let n = stdout.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    if output.len() + n > MAX_PREPROCESSED_BYTES {
      let _ = child.kill().await;
      return Err(std::io::Error::other("preprocessed output too large"));
    }
    output.extend_from_slice(&buf[..n]);
  }

  let status = child.wait().await?;
  if !status.success() {
    return Err(std::io::Error::other(format!("preprocessor exited with {}", status)));
  }
  if output.is_empty() {
    return Err(std::io::Error::other("preprocessor produced no output"));
  }
  Ok(output)
}
