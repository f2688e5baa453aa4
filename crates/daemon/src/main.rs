//! cinteld - the cintel daemon

use anyhow::Result;
use clap::Parser;
use cintel_core::{DaemonOptions, config::JobServerAddr, default_data_dir, default_socket_path};
use daemon::Daemon;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "cinteld")]
#[command(about = "Source intelligence daemon for C/C++/ObjC")]
#[command(version)]
struct Cli {
  /// Unix socket for client connections
  #[arg(long)]
  socket_file: Option<PathBuf>,
  /// Data directory for snapshots and logs
  #[arg(long)]
  data_dir: Option<PathBuf>,
  /// Concurrent indexing slots
  #[arg(short = 'j', long)]
  job_count: Option<usize>,
  /// TCP port for peer daemons (0 = off)
  #[arg(long, default_value_t = 0)]
  tcp_port: u16,
  /// HTTP port for the /stats stream (0 = off)
  #[arg(long, default_value_t = 0)]
  http_port: u16,
  /// Multicast discovery group
  #[arg(long)]
  multicast_address: Option<String>,
  /// Multicast discovery port (0 = off)
  #[arg(long, default_value_t = 0)]
  multicast_port: u16,
  /// Multicast TTL (0 = OS default)
  #[arg(long, default_value_t = 0)]
  multicast_ttl: u32,
  /// Requeue a remote job after this many ms without a reply
  #[arg(long)]
  reschedule_timeout: Option<u64>,
  /// Unload idle projects after this many minutes (0 = never)
  #[arg(long)]
  unload_timer: Option<u64>,
  /// Ceiling on queued preprocess jobs
  #[arg(long)]
  max_pending_preprocess_size: Option<usize>,
  /// Give up on a crashing source after this many attempts
  #[arg(long)]
  max_crash_count: Option<u32>,
  /// Worker visit-file timeout in ms (0 = infinite)
  #[arg(long)]
  visit_file_timeout: Option<u64>,
  /// Worker result-post timeout in ms (0 = infinite)
  #[arg(long)]
  indexer_message_timeout: Option<u64>,
  /// Peer/worker connect timeout in ms (0 = infinite)
  #[arg(long)]
  connect_timeout: Option<u64>,
  /// Don't index sources matching this filter (repeatable)
  #[arg(long = "exclude-filter")]
  exclude_filters: Vec<String>,
  /// Ignore compile commands from this compiler (repeatable)
  #[arg(long = "ignored-compiler")]
  ignored_compilers: Vec<PathBuf>,
  /// Argument added to every compile (repeatable)
  #[arg(long = "default-argument")]
  default_arguments: Vec<String>,
  /// Extra include path handed to workers (repeatable)
  #[arg(short = 'I', long = "include-path")]
  include_paths: Vec<PathBuf>,
  /// Static coordinator address as host:port (bypasses discovery)
  #[arg(long)]
  job_server_address: Option<String>,
  /// Path to the cintel-worker binary
  #[arg(long)]
  worker_path: Option<PathBuf>,
  /// Act as the coordinator for this LAN
  #[arg(long)]
  job_server: bool,
  /// Never participate in the peer network
  #[arg(long)]
  no_job_server: bool,
  /// Never run indexing jobs locally
  #[arg(long)]
  no_local_compiles: bool,
  /// Preprocess even without a peer network
  #[arg(long)]
  force_preprocessing: bool,
  /// Compress preprocessed units immediately
  #[arg(long)]
  compression_always: bool,
  /// Compress preprocessed units when shipping to peers
  #[arg(long)]
  compression_remote: bool,
  /// Wipe all projects on startup
  #[arg(long)]
  clear_projects: bool,
  /// Don't restore the persisted current project
  #[arg(long)]
  no_startup_current_project: bool,
  /// Don't watch project files
  #[arg(long)]
  no_file_manager_watch: bool,
  /// Keep separate indexes for debug and release builds
  #[arg(long)]
  separate_debug_and_release: bool,
  /// Log to the console only, skip the log file
  #[arg(long)]
  foreground: bool,
  /// Log at debug level (RUST_LOG still overrides)
  #[arg(short = 'v', long)]
  verbose: bool,
}

impl Cli {
  fn into_options(self) -> DaemonOptions {
    let defaults = DaemonOptions::default();
    let job_server = self.job_server_address.as_deref().and_then(|addr| {
      let (host, port) = addr.rsplit_once(':')?;
      Some(JobServerAddr {
        host: host.to_string(),
        port: port.parse().ok()?,
      })
    });
    DaemonOptions {
      socket_path: self.socket_file.unwrap_or_else(default_socket_path),
      data_dir: self.data_dir.unwrap_or_else(default_data_dir),
      job_count: self.job_count.unwrap_or(defaults.job_count).max(1),
      tcp_port: self.tcp_port,
      http_port: self.http_port,
      multicast_address: self.multicast_address.unwrap_or(defaults.multicast_address),
      multicast_port: self.multicast_port,
      multicast_ttl: self.multicast_ttl,
      reschedule_timeout_ms: self.reschedule_timeout.unwrap_or(defaults.reschedule_timeout_ms),
      unload_timer_mins: self.unload_timer.unwrap_or(defaults.unload_timer_mins),
      max_pending_preprocess_size: self
        .max_pending_preprocess_size
        .unwrap_or(defaults.max_pending_preprocess_size),
      max_crash_count: self.max_crash_count.unwrap_or(defaults.max_crash_count),
      completion_cache_size: defaults.completion_cache_size,
      visit_file_timeout_ms: self.visit_file_timeout.unwrap_or(defaults.visit_file_timeout_ms),
      indexer_message_timeout_ms: self
        .indexer_message_timeout
        .unwrap_or(defaults.indexer_message_timeout_ms),
      connect_timeout_ms: self.connect_timeout.unwrap_or(defaults.connect_timeout_ms),
      exclude_filters: if self.exclude_filters.is_empty() {
        defaults.exclude_filters
      } else {
        self.exclude_filters
      },
      ignored_compilers: self.ignored_compilers.into_iter().collect::<HashSet<_>>(),
      default_arguments: self.default_arguments,
      include_paths: self.include_paths,
      job_server,
      worker_path: self.worker_path,
      job_server_mode: self.job_server,
      no_job_server: self.no_job_server,
      no_local_compiles: self.no_local_compiles,
      force_preprocessing: self.force_preprocessing,
      compression_always: self.compression_always,
      compression_remote: self.compression_remote,
      clear_projects: self.clear_projects,
      no_startup_current_project: self.no_startup_current_project,
      no_file_manager_watch: self.no_file_manager_watch,
      separate_debug_and_release: self.separate_debug_and_release,
    }
  }
}

/// Compact stderr logging, mirrored into a single `cintel.log` in the data
/// dir unless `--foreground` is given. `RUST_LOG` overrides the default
/// level; `--verbose` bumps it to debug.
fn init_logging(data_dir: &std::path::Path, console_only: bool, verbose: bool) -> Option<WorkerGuard> {
  let fallback = if verbose { "debug" } else { "info" };
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .compact()
    .with_writer(std::io::stderr);
  let base = tracing_subscriber::registry().with(filter).with(stderr_layer);

  if console_only || std::fs::create_dir_all(data_dir).is_err() {
    base.init();
    return None;
  }

  let log_file = tracing_appender::rolling::never(data_dir, "cintel.log");
  let (file_writer, guard) = tracing_appender::non_blocking(log_file);
  let file_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_target(false)
    .with_writer(file_writer);
  base.with(file_layer).init();
  Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let console_only = cli.foreground;
  let verbose = cli.verbose;
  let options = cli.into_options();
  let _guard = init_logging(&options.data_dir, console_only, verbose);

  let daemon = Daemon::new(options);
  let code = daemon.run().await?;
  std::process::exit(code);
}
