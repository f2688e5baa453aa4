//! Daemon lifecycle: wiring, startup restore, shutdown persistence.

use crate::connection::ConnCtx;
use crate::http;
use crate::peers::{PeerError, PeerHandle};
use crate::projects::ProjectRegistry;
use crate::router::Router;
use crate::scheduler::{Event, Scheduler};
use crate::server::{Server, ServerError, ShutdownHandle};
use crate::stats::StatsBus;
use cintel_core::{DaemonOptions, FileTable};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Server error: {0}")]
  Server(#[from] ServerError),
  #[error("Peer error: {0}")]
  Peer(#[from] PeerError),
}

/// Daemon lifecycle manager
pub struct Daemon {
  options: Arc<DaemonOptions>,
}

impl Daemon {
  pub fn new(options: DaemonOptions) -> Daemon {
    Daemon {
      options: Arc::new(options),
    }
  }

  /// Run the daemon until shutdown; returns the exit code.
  pub async fn run(&self) -> Result<i32, LifecycleError> {
    let options = Arc::clone(&self.options);
    std::fs::create_dir_all(&options.data_dir)?;

    info!("Starting cintel daemon");
    info!("Socket: {:?}", options.socket_path);
    info!("Data dir: {:?}", options.data_dir);
    info!("Running with {} jobs", options.job_count);
    if options.tcp_port != 0 || options.multicast_port != 0 || options.http_port != 0 {
      info!(
        "tcp-port: {} multicast-port: {} http-port: {}",
        options.tcp_port, options.multicast_port, options.http_port
      );
    }

    if options.clear_projects {
      let _ = std::fs::remove_dir_all(&options.data_dir);
      std::fs::create_dir_all(&options.data_dir)?;
    }

    let files = Arc::new(FileTable::new());
    let fileids_ok = files.restore(&options.data_dir);

    let registry = Arc::new(ProjectRegistry::new(Arc::clone(&options), Arc::clone(&files)));
    if fileids_ok {
      let count = registry.reload_all().await;
      info!("Restored {} projects", count);
      if !options.no_startup_current_project {
        registry.restore_current().await;
      }
    } else {
      // file ids are meaningless without the table; snapshots go with it
      warn!("File-id table was unusable, clearing projects");
      registry.clear().await;
      std::fs::create_dir_all(&options.data_dir)?;
    }

    let stats = StatsBus::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown = ShutdownHandle::new(shutdown_tx);
    let exit_code = Arc::new(AtomicI32::new(0));
    let traffic = Arc::new(AtomicU64::new(0));

    let peers = PeerHandle::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(
      Arc::clone(&options),
      Arc::clone(&registry),
      stats.clone(),
      peers.clone(),
      event_tx,
      event_rx,
    );
    let scheduler_handle = scheduler.handle();
    tokio::spawn(scheduler.run());

    let router = Arc::new(Router::new(
      Arc::clone(&registry),
      scheduler_handle.clone(),
      peers.clone(),
      shutdown.clone(),
      Arc::clone(&exit_code),
    ));

    let ctx = ConnCtx {
      options: Arc::clone(&options),
      registry: Arc::clone(&registry),
      router,
      scheduler: scheduler_handle.clone(),
      peers: peers.clone(),
      traffic: Arc::clone(&traffic),
      shutdown: shutdown.clone(),
      exit_code: Arc::clone(&exit_code),
    };
    peers.install_ctx(ctx.clone());
    peers.start().await?;

    if options.http_port != 0 {
      let stats = stats.clone();
      let shutdown = shutdown.clone();
      let port = options.http_port;
      tokio::spawn(async move {
        if let Err(err) = http::run(port, stats, shutdown).await {
          error!("Unable to listen on http-port {}: {}", port, err);
        }
      });
    }

    if options.unload_timer_mins > 0 {
      let interval = Duration::from_secs(options.unload_timer_mins * 60);
      let traffic = Arc::clone(&traffic);
      let handle = scheduler_handle.clone();
      let mut shutdown_rx = shutdown.subscribe();
      tokio::spawn(async move {
        // a whole interval with the traffic counter unchanged means nobody
        // needs the non-current projects in memory
        let mut seen = traffic.load(Ordering::Relaxed);
        loop {
          tokio::select! {
            _ = tokio::time::sleep(interval) => {
              let handled = traffic.load(Ordering::Relaxed);
              if handled == seen {
                handle.send(Event::UnloadTick);
              }
              seen = handled;
            }
            _ = shutdown_rx.recv() => break,
          }
        }
      });
    }

    {
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
          warn!("Failed to listen for ctrl-c: {}", err);
          return;
        }
        info!("Received ctrl-c, shutting down...");
        shutdown.shutdown();
      });
    }

    let server = Server::new(options.socket_path.clone(), ctx);
    server.run().await?;

    scheduler_handle.send(Event::Shutdown);
    registry.save_all().await;
    if let Err(err) = files.save(&options.data_dir) {
      error!("Couldn't save file ids: {}", err);
    }
    info!("Daemon shutdown complete");
    Ok(exit_code.load(Ordering::Relaxed))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[tokio::test]
  async fn test_daemon_starts_and_shuts_down() {
    let dir = TempDir::new().unwrap();
    let options = DaemonOptions {
      data_dir: dir.path().join("data"),
      socket_path: dir.path().join("cintel.sock"),
      ..Default::default()
    };
    let socket_path = options.socket_path.clone();
    let daemon = Daemon::new(options);

    let handle = tokio::spawn(async move { daemon.run().await });

    // wait for the socket to appear, then shut down through it
    let mut connected = None;
    for _ in 0..100 {
      if let Ok(client) = crate::server::Client::connect_to(&socket_path).await {
        connected = Some(client);
        break;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut client = connected.expect("daemon never came up");
    let (lines, code) = client.query(wire::Method::Shutdown, serde_json::json!({})).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(lines, vec!["Shutting down"]);

    let exit = handle.await.unwrap().unwrap();
    assert_eq!(exit, 0);
  }
}
