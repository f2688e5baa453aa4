//! The framed message set.

use crate::protocol::Request;
use cintel_core::{IndexData, Unit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A unit shipped to a peer inside a `JobResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippedJob {
  pub unit: Unit,
  pub project: PathBuf,
  /// The originating daemon's job id; echoed back in the IndexerResult
  pub id: u64,
  /// Files the origin has already claimed for this project; the borrowing
  /// worker treats them as visit-denied without asking.
  pub blocked_files: HashMap<u32, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
  pub jobs: Vec<ShippedJob>,
  /// The responder's peer TCP port, the address workers post results to
  pub tcp_port: u16,
  /// The responder's pending queue was emptied by this response
  pub finished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
  /// Peer -> coordinator on connect
  Client,
  /// Coordinator -> everyone else when a peer joins
  ClientConnected { host: String },
  /// Work is available at host:port. An empty host means "the sender".
  JobAnnouncement { host: String, port: u16 },
  /// Peer -> coordinator: re-broadcast my announcement, filling in my host
  ProxyJobAnnouncement { port: u16 },
  /// Peer -> peer: send me up to num_jobs preprocessed units
  JobRequest { num_jobs: u32 },
  JobResponse(JobResponse),
  /// Worker -> daemon, or borrowing worker -> originating daemon
  IndexerResult { project: PathBuf, data: IndexData },
  /// Worker -> daemon: should I parse this file for job `job_key`?
  VisitFile {
    project: PathBuf,
    path: PathBuf,
    job_key: u64,
  },
  VisitFileResponse {
    file_id: u32,
    path: PathBuf,
    visit: bool,
  },
  /// Shut the daemon down; with `forward` the coordinator relays it
  Exit { code: i32, forward: bool },
  /// Client query
  Query(Request),
  /// Daemon -> client reply line
  Output { text: String },
  /// Daemon -> client: request complete
  Finish { code: i32 },
  /// Client compile-command submission
  Compile {
    arguments: String,
    working_directory: PathBuf,
    project_root: Option<PathBuf>,
  },
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{decode, encode};
  use cintel_core::Source;
  use std::path::Path;

  fn shipped(id: u64, text: &str) -> ShippedJob {
    let source = Source::parse("gcc -c a.c", Path::new("/tmp")).remove(0);
    let mut unit = Unit::new(source);
    unit.preprocessed = text.as_bytes().to_vec();
    ShippedJob {
      unit,
      project: PathBuf::from("/tmp"),
      id,
      blocked_files: HashMap::from([(3, PathBuf::from("/tmp/x.h"))]),
    }
  }

  #[test]
  fn test_job_response_round_trip() {
    let payloads = ["int a;\n", "int b;\n", "int c;\n"];
    let msg = Message::JobResponse(JobResponse {
      jobs: payloads
        .iter()
        .enumerate()
        .map(|(i, text)| shipped(i as u64 + 1, text))
        .collect(),
      tcp_port: 12526,
      finished: true,
    });
    let bytes = encode(&msg).unwrap();
    let Message::JobResponse(decoded) = decode(&bytes).unwrap() else {
      panic!("wrong variant");
    };
    assert_eq!(decoded.jobs.len(), 3);
    assert_eq!(decoded.tcp_port, 12526);
    assert!(decoded.finished);
    for (i, job) in decoded.jobs.iter().enumerate() {
      // byte-for-byte on the preprocessed payload
      assert_eq!(job.unit.preprocessed, payloads[i].as_bytes());
      assert_eq!(job.id, i as u64 + 1);
      assert_eq!(job.blocked_files.get(&3), Some(&PathBuf::from("/tmp/x.h")));
    }
  }

  #[test]
  fn test_query_round_trip() {
    let msg = Message::Query(Request::new(
      crate::Method::FollowLocation,
      serde_json::json!({"location": "/src/a.c:3:5"}),
    ));
    let bytes = encode(&msg).unwrap();
    let Message::Query(req) = decode(&bytes).unwrap() else {
      panic!("wrong variant");
    };
    assert_eq!(req.method, crate::Method::FollowLocation);
    assert_eq!(req.str_param("location"), "/src/a.c:3:5");
  }

  #[test]
  fn test_discovery_round_trip() {
    for msg in [
      Message::Client,
      Message::ClientConnected { host: "10.0.0.2".into() },
      Message::JobAnnouncement {
        host: String::new(),
        port: 12526,
      },
      Message::ProxyJobAnnouncement { port: 12526 },
      Message::Exit { code: 2, forward: true },
    ] {
      let bytes = encode(&msg).unwrap();
      let decoded = decode(&bytes).unwrap();
      assert_eq!(format!("{:?}", decoded), format!("{:?}", msg));
    }
  }
}
