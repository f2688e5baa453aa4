//! The unix-socket listener and the client helper.

use crate::connection::{self, ConnCtx};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use wire::{Message, Method, Request, WireError};

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Wire error: {0}")]
  Wire(#[from] WireError),
  #[error("Connection error: {0}")]
  Connection(String),
}

/// Handle to signal daemon shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
  tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
  pub fn new(tx: broadcast::Sender<()>) -> ShutdownHandle {
    ShutdownHandle { tx }
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(());
  }

  pub fn subscribe(&self) -> broadcast::Receiver<()> {
    self.tx.subscribe()
  }
}

/// Unix socket server for local clients and workers
pub struct Server {
  socket_path: PathBuf,
  ctx: ConnCtx,
}

impl Server {
  pub fn new(socket_path: PathBuf, ctx: ConnCtx) -> Server {
    Server { socket_path, ctx }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Run until the shutdown handle fires.
  pub async fn run(&self) -> Result<(), ServerError> {
    // Remove stale socket file
    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    if let Some(parent) = self.socket_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&self.socket_path)?;
    info!("Daemon listening on {:?}", self.socket_path);

    let mut shutdown_rx = self.ctx.shutdown.subscribe();
    loop {
      tokio::select! {
        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let ctx = self.ctx.clone();
              let conn_id = ctx.peers.next_conn_id();
              tokio::spawn(connection::drive(stream, ctx, None, conn_id, None));
            }
            Err(err) => {
              error!("Accept error: {}", err);
            }
          }
        }
        _ = shutdown_rx.recv() => {
          info!("Shutdown signal received");
          break;
        }
      }
    }

    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    Ok(())
  }
}

/// Client for talking to a running daemon over its unix socket.
pub struct Client {
  io: wire::FramedIo<UnixStream>,
}

impl Client {
  pub async fn connect_to(socket_path: &Path) -> Result<Client, ServerError> {
    let stream = UnixStream::connect(socket_path).await?;
    Ok(Client { io: wire::framed(stream) })
  }

  /// Run a query and collect the reply: output lines plus the finish code.
  pub async fn query(&mut self, method: Method, params: serde_json::Value) -> Result<(Vec<String>, i32), ServerError> {
    wire::send(&mut self.io, &Message::Query(Request::new(method, params))).await?;
    self.collect_reply().await
  }

  /// Submit a compile command; returns the finish code (0 = accepted).
  pub async fn compile(
    &mut self,
    arguments: &str,
    working_directory: &Path,
    project_root: Option<&Path>,
  ) -> Result<i32, ServerError> {
    wire::send(
      &mut self.io,
      &Message::Compile {
        arguments: arguments.to_string(),
        working_directory: working_directory.to_path_buf(),
        project_root: project_root.map(|p| p.to_path_buf()),
      },
    )
    .await?;
    let (_, code) = self.collect_reply().await?;
    Ok(code)
  }

  async fn collect_reply(&mut self) -> Result<(Vec<String>, i32), ServerError> {
    let mut lines = Vec::new();
    loop {
      match wire::recv(&mut self.io).await? {
        Some(Message::Output { text }) => lines.push(text),
        Some(Message::Finish { code }) => return Ok((lines, code)),
        Some(other) => {
          debug!("Ignoring unexpected reply message: {:?}", other);
        }
        None => return Err(ServerError::Connection("daemon closed the connection".into())),
      }
    }
  }
}
