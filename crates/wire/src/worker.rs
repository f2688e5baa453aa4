//! The payload streamed to a worker over its stdin: a 4-byte little-endian
//! length followed by the CBOR encoding of [`WorkerJob`].

use crate::WireError;
use cintel_core::Unit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Where the worker reports back: the local daemon's unix socket for
/// locally-originated jobs, the originating daemon's TCP port for borrowed
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerDestination {
  Unix { socket: PathBuf },
  Tcp { host: String, port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
  pub destination: WorkerDestination,
  pub unit: Unit,
  pub project: PathBuf,
  /// Job id on the daemon the result goes to
  pub job_id: u64,
  /// The project's per-source key, quoted in visit-file queries
  pub job_key: u64,
  pub visit_file_timeout_ms: u64,
  pub indexer_message_timeout_ms: u64,
  pub connect_timeout_ms: u64,
  /// Files pre-claimed by the origin; denied without a round trip
  pub blocked_files: HashMap<u32, PathBuf>,
  pub default_arguments: Vec<String>,
  pub include_paths: Vec<PathBuf>,
  pub dirty: bool,
}

pub async fn write_worker_job<W: AsyncWrite + Unpin>(
  writer: &mut W,
  job: &WorkerJob,
) -> Result<(), WireError> {
  let bytes = serde_cbor::to_vec(job)?;
  writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
  writer.write_all(&bytes).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_worker_job<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WorkerJob, WireError> {
  let mut header = [0u8; 4];
  reader.read_exact(&mut header).await?;
  let len = u32::from_le_bytes(header) as usize;
  if len > crate::MAX_FRAME_LEN {
    return Err(WireError::FrameTooLarge(len, crate::MAX_FRAME_LEN));
  }
  let mut bytes = vec![0u8; len];
  reader.read_exact(&mut bytes).await?;
  Ok(serde_cbor::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use cintel_core::Source;
  use std::path::Path;

  #[tokio::test]
  async fn test_stdin_round_trip() {
    let source = Source::parse("gcc -c main.c", Path::new("/tmp")).remove(0);
    let job = WorkerJob {
      destination: WorkerDestination::Unix {
        socket: PathBuf::from("/tmp/cintel.sock"),
      },
      unit: Unit::new(source),
      project: PathBuf::from("/tmp"),
      job_id: 9,
      job_key: 0xabcd,
      visit_file_timeout_ms: 1000,
      indexer_message_timeout_ms: 1000,
      connect_timeout_ms: 1000,
      blocked_files: HashMap::new(),
      default_arguments: vec!["-Wall".into()],
      include_paths: vec![],
      dirty: false,
    };

    let mut buf = Vec::new();
    write_worker_job(&mut buf, &job).await.unwrap();
    let decoded = read_worker_job(&mut buf.as_slice()).await.unwrap();
    assert_eq!(decoded.job_id, 9);
    assert_eq!(decoded.job_key, 0xabcd);
    assert_eq!(decoded.unit.source_file, PathBuf::from("/tmp/main.c"));
    assert_eq!(
      decoded.destination,
      WorkerDestination::Unix {
        socket: PathBuf::from("/tmp/cintel.sock")
      }
    );
  }
}
