//! The indexing-job record.
//!
//! A job is owned by the scheduler's job table and referenced everywhere else
//! by its id: the pending queue, the processing set, the local worker map and
//! the in-flight-to-peer bookkeeping all hold ids. A job may run locally and
//! on a peer at the same time; the first result to arrive wins and the loser
//! is discarded by the reconciler.

use cintel_core::Unit;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

pub type JobId = u64;

/// Why this job exists: a fresh compile command or a dirty re-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
  Compile,
  Dirty,
}

/// Which dispatch path produced the committed result. Terminal; set once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Local,
  Remote,
}

/// Bookkeeping for a job currently shipped to a peer.
#[derive(Debug, Clone)]
pub struct RemoteShip {
  pub host: String,
  pub started: Instant,
}

/// This job was borrowed from a peer; we run it and the worker posts its
/// result straight back to the origin.
#[derive(Debug, Clone)]
pub struct BorrowedFrom {
  pub host: String,
  pub port: u16,
  /// The job id on the originating daemon
  pub origin_id: u64,
}

#[derive(Debug)]
pub struct IndexerJob {
  pub id: JobId,
  pub unit: Unit,
  pub project: PathBuf,
  /// The project's per-source key
  pub fingerprint: u64,
  pub origin: JobOrigin,
  pub high_priority: bool,
  pub borrowed: Option<BorrowedFrom>,
  pub remote: Option<RemoteShip>,
  pub rescheduled: bool,
  pub running_local: bool,
  pub crashed: bool,
  pub aborted: bool,
  pub outcome: Option<Outcome>,
  /// Files the origin pre-claimed, remote-reply use only
  pub blocked_files: HashMap<u32, PathBuf>,
}

impl IndexerJob {
  pub fn new(id: JobId, unit: Unit, project: PathBuf, fingerprint: u64, origin: JobOrigin) -> IndexerJob {
    IndexerJob {
      id,
      unit,
      project,
      fingerprint,
      origin,
      high_priority: false,
      borrowed: None,
      remote: None,
      rescheduled: false,
      running_local: false,
      crashed: false,
      aborted: false,
      outcome: None,
      blocked_files: HashMap::new(),
    }
  }

  pub fn is_complete(&self) -> bool {
    self.outcome.is_some()
  }

  /// Eligible to be handed out to a peer: our own work, with a preprocessed
  /// payload to ship.
  pub fn is_exportable(&self) -> bool {
    !self.is_complete() && self.borrowed.is_none() && !self.unit.preprocessed.is_empty()
  }

  pub fn describe_flags(&self) -> String {
    let mut flags = Vec::new();
    match self.origin {
      JobOrigin::Compile => flags.push("Compile"),
      JobOrigin::Dirty => flags.push("Dirty"),
    }
    if self.borrowed.is_some() {
      flags.push("FromRemote");
    }
    if self.remote.is_some() {
      flags.push("Remote");
    }
    if self.rescheduled {
      flags.push("Rescheduled");
    }
    if self.running_local {
      flags.push("RunningLocal");
    }
    if self.crashed {
      flags.push("Crashed");
    }
    if self.aborted {
      flags.push("Aborted");
    }
    match self.outcome {
      Some(Outcome::Local) => flags.push("CompleteLocal"),
      Some(Outcome::Remote) => flags.push("CompleteRemote"),
      None => {}
    }
    if self.unit.compressed {
      flags.push("PreprocessCompressed");
    }
    if self.high_priority {
      flags.push("HighPriority");
    }
    flags.join(", ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cintel_core::Source;
  use std::path::Path;

  fn job() -> IndexerJob {
    let source = Source::parse("gcc -c a.c", Path::new("/tmp")).remove(0);
    let fp = source.fingerprint(false);
    IndexerJob::new(1, Unit::new(source), PathBuf::from("/tmp"), fp, JobOrigin::Compile)
  }

  #[test]
  fn test_exportable_requires_preprocessed() {
    let mut j = job();
    assert!(!j.is_exportable());
    j.unit.preprocessed = b"int x;\n".to_vec();
    assert!(j.is_exportable());
    j.borrowed = Some(BorrowedFrom {
      host: "10.0.0.2".into(),
      port: 1,
      origin_id: 99,
    });
    // borrowed work is never re-exported
    assert!(!j.is_exportable());
  }

  #[test]
  fn test_describe_flags() {
    let mut j = job();
    j.running_local = true;
    j.remote = Some(RemoteShip {
      host: "10.0.0.3".into(),
      started: Instant::now(),
    });
    j.outcome = Some(Outcome::Local);
    let flags = j.describe_flags();
    assert!(flags.contains("RunningLocal"));
    assert!(flags.contains("Remote"));
    assert!(flags.contains("CompleteLocal"));
  }
}
