//! The HTTP diagnostics stream.
//!
//! A request line of exactly `GET /stats HTTP/1.1` upgrades the socket to a
//! `text/event-stream` fed by the statistics bus, one `data:<line>` event
//! per statistics line, until the client goes away. Anything else closes
//! the socket.

use crate::server::ShutdownHandle;
use crate::stats::StatsBus;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

const STATS_REQUEST_LINE: &[u8] = b"GET /stats HTTP/1.1\r\n";
const RESPONSE_HEADER: &str = "HTTP/1.1 200 OK\r\n\
Cache: no-cache\r\n\
Cache-Control: private\r\n\
Pragma: no-cache\r\n\
Content-Type: text/event-stream\r\n\r\n";

pub async fn run(port: u16, stats: StatsBus, shutdown: ShutdownHandle) -> std::io::Result<()> {
  let listener = TcpListener::bind(("0.0.0.0", port)).await?;
  info!("HTTP stats listening on port {}", port);
  let mut shutdown_rx = shutdown.subscribe();
  loop {
    tokio::select! {
      result = listener.accept() => {
        match result {
          Ok((stream, addr)) => {
            debug!("HTTP client from {}", addr);
            let stats = stats.clone();
            tokio::spawn(async move {
              let _ = handle_client(stream, stats).await;
            });
          }
          Err(err) => error!("HTTP accept error: {}", err),
        }
      }
      _ = shutdown_rx.recv() => break,
    }
  }
  Ok(())
}

async fn handle_client(mut stream: TcpStream, stats: StatsBus) -> std::io::Result<()> {
  let mut request = Vec::new();
  let mut buf = [0u8; 1024];
  loop {
    if request.len() >= STATS_REQUEST_LINE.len() {
      break;
    }
    let n = stream.read(&mut buf).await?;
    if n == 0 {
      return Ok(());
    }
    request.extend_from_slice(&buf[..n]);
    if request.len() > 4096 {
      return Ok(());
    }
  }
  if !request.starts_with(STATS_REQUEST_LINE) {
    return Ok(());
  }

  stream.write_all(RESPONSE_HEADER.as_bytes()).await?;
  let mut rx = stats.subscribe();
  loop {
    match rx.recv().await {
      Ok(line) => {
        stream.write_all(b"data:").await?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
      }
      // lagged subscribers just miss lines
      Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
      Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
    }
  }
  Ok(())
}
