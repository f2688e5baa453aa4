//! The message-connection driver.
//!
//! Every persistent connection (local clients and workers on the unix
//! socket, peers and remote workers on TCP) runs through the same loop: a
//! writer task drains an outbound channel into the framed sink, the reader
//! dispatches each incoming message. What a connection *is* emerges from
//! what it sends: a query, a compile command, a visit-file handshake, a job
//! request, a coordinator introduction.

use crate::peers::{self, ConnId, Outbound, PeerHandle, PeerWriter};
use crate::projects::ProjectRegistry;
use crate::router::Router;
use crate::scheduler::{Event, SchedulerHandle};
use crate::server::ShutdownHandle;
use bytes::Bytes;
use cintel_core::DaemonOptions;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use wire::Message;

#[derive(Clone)]
pub struct ConnCtx {
  pub options: Arc<DaemonOptions>,
  pub registry: Arc<ProjectRegistry>,
  pub router: Arc<Router>,
  pub scheduler: SchedulerHandle,
  pub peers: PeerHandle,
  /// Messages handled across all connections; the unload watcher compares
  /// readings an interval apart to detect quiescence
  pub traffic: Arc<AtomicU64>,
  pub shutdown: ShutdownHandle,
  pub exit_code: Arc<AtomicI32>,
}

/// Drive one connection to completion. `peer_host` is set for TCP peers and
/// `None` for the unix socket; `channel` lets the caller keep the writer
/// (the coordinator link and outbound request connections do).
pub async fn drive<S>(
  stream: S,
  ctx: ConnCtx,
  peer_host: Option<String>,
  conn_id: ConnId,
  channel: Option<(PeerWriter, mpsc::UnboundedReceiver<Outbound>)>,
) where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let framed = wire::framed(stream);
  let (mut sink, mut messages) = framed.split();
  let (writer, mut outbound_rx) = channel.unwrap_or_else(mpsc::unbounded_channel);

  let writer_task = tokio::spawn(async move {
    while let Some(outbound) = outbound_rx.recv().await {
      let ok = match wire::encode(&outbound.message) {
        Ok(bytes) => sink.send(Bytes::from(bytes)).await.is_ok(),
        Err(err) => {
          error!("Couldn't encode outbound message: {}", err);
          false
        }
      };
      if let Some(done) = outbound.done {
        let _ = done.send(ok);
      }
      if !ok {
        break;
      }
    }
  });

  while let Some(frame) = messages.next().await {
    let message = match frame {
      Ok(bytes) => match wire::decode(&bytes) {
        Ok(message) => message,
        Err(err) => {
          warn!("Undecodable frame from {:?}: {}", peer_host, err);
          break;
        }
      },
      Err(err) => {
        debug!("Connection error from {:?}: {}", peer_host, err);
        break;
      }
    };
    ctx.traffic.fetch_add(1, Ordering::Relaxed);
    if handle_message(message, &ctx, &peer_host, conn_id, &writer).await.is_break() {
      break;
    }
  }

  peers::notify_disconnect(&ctx, conn_id);
  writer_task.abort();
}

fn send(writer: &PeerWriter, message: Message) -> bool {
  writer.send(Outbound { message, done: None }).is_ok()
}

async fn handle_message(
  message: Message,
  ctx: &ConnCtx,
  peer_host: &Option<String>,
  conn_id: ConnId,
  writer: &PeerWriter,
) -> std::ops::ControlFlow<()> {
  use std::ops::ControlFlow;

  match message {
    Message::Query(request) => {
      let reply = ctx.router.handle(request).await;
      for line in reply.lines {
        send(writer, Message::Output { text: line });
      }
      send(writer, Message::Finish { code: reply.code });
    }
    Message::Compile {
      arguments,
      working_directory,
      project_root,
    } => {
      let (tx, rx) = oneshot::channel();
      ctx.scheduler.send(Event::Compile {
        arguments,
        working_directory,
        project_root,
        reply: Some(tx),
      });
      let accepted = rx.await.unwrap_or(false);
      send(writer, Message::Finish { code: if accepted { 0 } else { 1 } });
    }
    Message::VisitFile { project, path, job_key } => {
      let (tx, rx) = oneshot::channel();
      ctx.scheduler.send(Event::VisitFile {
        project,
        path,
        job_key,
        reply: tx,
      });
      match rx.await {
        Ok(response) => {
          send(writer, response);
        }
        Err(_) => {
          send(
            writer,
            Message::VisitFileResponse {
              file_id: 0,
              path: Default::default(),
              visit: false,
            },
          );
        }
      }
    }
    Message::IndexerResult { project, data } => {
      ctx.scheduler.send(Event::IndexerResult {
        project,
        data: Box::new(data),
        remote_host: peer_host.clone(),
      });
      send(writer, Message::Finish { code: 0 });
    }
    Message::Client => {
      let host = peer_host.clone().unwrap_or_default();
      error!("Got a client connected from {}", host);
      ctx.peers.register_client(conn_id, host.clone(), writer.clone());
      ctx
        .peers
        .broadcast_clients(Message::ClientConnected { host: host.clone() }, Some(conn_id));
      ctx.scheduler.send(Event::ClientJoined);
    }
    Message::ClientConnected { host } => {
      debug!("A new client joined the network: {}", host);
      ctx.scheduler.send(Event::ClientJoined);
    }
    Message::JobAnnouncement { host, port } => {
      let host = if host.is_empty() {
        peer_host.clone().unwrap_or_default()
      } else {
        host
      };
      ctx.scheduler.send(Event::Announcement { host, port });
    }
    Message::ProxyJobAnnouncement { port } => {
      let host = peer_host.clone().unwrap_or_default();
      debug!("Sending proxy job announcement for {}", host);
      ctx.peers.broadcast_clients(
        Message::JobAnnouncement {
          host: host.clone(),
          port,
        },
        Some(conn_id),
      );
      ctx.scheduler.send(Event::Announcement { host, port });
    }
    Message::JobRequest { num_jobs } => {
      ctx.scheduler.send(Event::JobRequest {
        num_jobs,
        peer_host: peer_host.clone().unwrap_or_default(),
        writer: writer.clone(),
      });
    }
    Message::JobResponse(response) => {
      ctx.scheduler.send(Event::JobResponseReceived {
        host: peer_host.clone().unwrap_or_default(),
        response,
        conn: Some(conn_id),
      });
    }
    Message::Exit { code, forward } => {
      handle_exit(ctx, code, forward);
    }
    Message::Output { .. } | Message::Finish { .. } | Message::VisitFileResponse { .. } => {
      error!("Unexpected message on connection from {:?}", peer_host);
      send(writer, Message::Finish { code: 1 });
      return ControlFlow::Break(());
    }
  }
  ControlFlow::Continue(())
}

/// Exit-message semantics: record the code, propagate it (up to the
/// coordinator with the forward bit, or down to every connected client),
/// then quit after a grace period so the frames flush.
pub fn handle_exit(ctx: &ConnCtx, code: i32, forward: bool) {
  ctx.exit_code.store(code, Ordering::Relaxed);
  let forwarded = forward && ctx.peers.send_to_server(Message::Exit { code, forward: true });
  let notified = if forwarded {
    1
  } else {
    ctx.peers.broadcast_clients(Message::Exit { code, forward: false }, None)
  };
  if notified == 0 {
    ctx.shutdown.shutdown();
    return;
  }
  let shutdown = ctx.shutdown.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(1000)).await;
    shutdown.shutdown();
  });
}
