//! Daemon configuration.
//!
//! The CLI builds a `DaemonOptions` from flags; everything here has a
//! workable default so tests can construct one with `..Default::default()`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Get the cintel data directory (respects CINTEL_DATA_DIR)
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("CINTEL_DATA_DIR") {
    return PathBuf::from(dir);
  }
  if let Ok(home) = std::env::var("HOME") {
    return PathBuf::from(home).join(".cintel");
  }
  PathBuf::from("/tmp/cintel")
}

/// Get the default unix socket path
pub fn default_socket_path() -> PathBuf {
  // Try XDG_RUNTIME_DIR first, fallback to /tmp
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(runtime_dir).join("cintel.sock")
  } else {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/cintel-{}.sock", uid))
  }
}

/// A statically configured coordinator address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobServerAddr {
  pub host: String,
  pub port: u16,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonOptions {
  /// Socket path for local client IPC
  pub socket_path: PathBuf,
  /// Data directory for snapshots, the fileids table and logs
  pub data_dir: PathBuf,
  /// Number of concurrent indexing slots (preprocess threads share the pool)
  pub job_count: usize,
  /// TCP port for peer daemons (0 = no peer listener)
  pub tcp_port: u16,
  /// HTTP port for the /stats diagnostics stream (0 = disabled)
  pub http_port: u16,
  /// Multicast group used for coordinator discovery
  pub multicast_address: String,
  /// Multicast port (0 = discovery disabled)
  pub multicast_port: u16,
  /// Multicast TTL (0 = leave the OS default)
  pub multicast_ttl: u32,
  /// A job shipped to a peer is requeued after this many ms without a reply
  pub reschedule_timeout_ms: u64,
  /// Minutes of inactivity before non-current projects are unloaded (0 = never)
  pub unload_timer_mins: u64,
  /// Ceiling on queued preprocess jobs, see the scheduler's drain formula
  pub max_pending_preprocess_size: usize,
  /// Give up on a crashing source after this many attempts
  pub max_crash_count: u32,
  /// Entries kept by the completion cache (reserved for the completion layer)
  pub completion_cache_size: usize,
  /// Worker-side timeout for a visit-file round trip (0 = infinite)
  pub visit_file_timeout_ms: u64,
  /// Worker-side timeout for posting the final result (0 = infinite)
  pub indexer_message_timeout_ms: u64,
  /// Worker/peer connect timeout (0 = infinite)
  pub connect_timeout_ms: u64,
  /// Source paths containing any of these substrings are not indexed
  pub exclude_filters: Vec<String>,
  /// Compilers whose commands are ignored outright
  pub ignored_compilers: HashSet<PathBuf>,
  /// Arguments appended to every compile command
  pub default_arguments: Vec<String>,
  /// Extra include paths passed to the worker
  pub include_paths: Vec<PathBuf>,
  /// Statically configured coordinator, bypasses multicast discovery
  pub job_server: Option<JobServerAddr>,
  /// Path to the cintel-worker binary (default: next to the daemon binary)
  pub worker_path: Option<PathBuf>,

  /// Act as the coordinator for this LAN
  pub job_server_mode: bool,
  /// Never participate in the peer network
  pub no_job_server: bool,
  /// Never run indexing jobs locally (ship everything out)
  pub no_local_compiles: bool,
  /// Preprocess even when no peer network is reachable
  pub force_preprocessing: bool,
  /// Compress preprocessed units as soon as they are produced
  pub compression_always: bool,
  /// Compress preprocessed units when shipping them to a peer
  pub compression_remote: bool,
  /// Wipe all projects on startup
  pub clear_projects: bool,
  /// Do not restore the persisted current project on startup
  pub no_startup_current_project: bool,
  /// Do not watch project files (the watcher is an external collaborator)
  pub no_file_manager_watch: bool,
  /// Distinguish -g/-O fingerprints so debug and release builds coexist
  pub separate_debug_and_release: bool,
}

impl Default for DaemonOptions {
  fn default() -> Self {
    let jobs = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    Self {
      socket_path: default_socket_path(),
      data_dir: default_data_dir(),
      job_count: jobs,
      tcp_port: 0,
      http_port: 0,
      multicast_address: "237.50.50.50".into(),
      multicast_port: 0,
      multicast_ttl: 0,
      reschedule_timeout_ms: 15_000,
      unload_timer_mins: 0,
      max_pending_preprocess_size: 100,
      max_crash_count: 5,
      completion_cache_size: 10,
      visit_file_timeout_ms: 60_000,
      indexer_message_timeout_ms: 60_000,
      connect_timeout_ms: 5_000,
      exclude_filters: vec!["*/CMakeFiles/*".into()],
      ignored_compilers: HashSet::new(),
      default_arguments: Vec::new(),
      include_paths: Vec::new(),
      job_server: None,
      worker_path: None,
      job_server_mode: false,
      no_job_server: false,
      no_local_compiles: false,
      force_preprocessing: false,
      compression_always: false,
      compression_remote: false,
      clear_projects: false,
      no_startup_current_project: false,
      no_file_manager_watch: false,
      separate_debug_and_release: false,
    }
  }
}

impl DaemonOptions {
  /// Resolve the worker binary: explicit override, else `cintel-worker`
  /// next to the running executable.
  pub fn worker_binary(&self) -> PathBuf {
    if let Some(ref path) = self.worker_path {
      return path.clone();
    }
    std::env::current_exe()
      .ok()
      .and_then(|exe| exe.parent().map(|dir| dir.join("cintel-worker")))
      .unwrap_or_else(|| PathBuf::from("cintel-worker"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let options = DaemonOptions::default();
    assert!(options.job_count >= 1);
    assert_eq!(options.multicast_address, "237.50.50.50");
    assert_eq!(options.reschedule_timeout_ms, 15_000);
    assert!(!options.job_server_mode);
  }

  #[test]
  fn test_worker_binary_override() {
    let options = DaemonOptions {
      worker_path: Some(PathBuf::from("/opt/bin/worker")),
      ..Default::default()
    };
    assert_eq!(options.worker_binary(), PathBuf::from("/opt/bin/worker"));
  }
}
