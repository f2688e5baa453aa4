//! Peer transport: multicast discovery, the coordinator connection, the peer
//! TCP listener and outbound job-request connections.
//!
//! Discovery is a two-byte `s?` probe on the multicast group. Whoever knows
//! where the coordinator lives (the coordinator itself, anyone connected to
//! it, or a daemon with a static address configured) replies with the
//! coordinator's `(host, port)`; the asker then dials it over TCP. A failed
//! or dropped coordinator connection reconnects with a linear backoff of
//! five seconds times the consecutive-failure count.

use crate::connection::{self, ConnCtx};
use crate::scheduler::Event;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use wire::Message;

pub type ConnId = u64;

/// One outgoing frame, with an optional send-finished acknowledgement.
pub struct Outbound {
  pub message: Message,
  pub done: Option<oneshot::Sender<bool>>,
}

pub type PeerWriter = mpsc::UnboundedSender<Outbound>;

const RECONNECT_BASE_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum PeerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("connect timed out")]
  Timeout,
  #[error("send failed")]
  SendFailed,
}

struct ClientPeer {
  host: String,
  writer: PeerWriter,
}

struct PeersInner {
  ctx: OnceLock<ConnCtx>,
  /// Peers that introduced themselves with a `Client` message; the
  /// coordinator broadcasts announcements and joins to these.
  clients: Mutex<HashMap<ConnId, ClientPeer>>,
  /// Live connection to the coordinator, when we are a leaf.
  server: Mutex<Option<(ConnId, PeerWriter)>>,
  /// Where the coordinator lives: static config or multicast discovery.
  server_target: Mutex<Option<(String, u16)>>,
  server_failures: AtomicU32,
  multicast: Mutex<Option<Arc<UdpSocket>>>,
  next_conn: AtomicU64,
}

#[derive(Clone)]
pub struct PeerHandle {
  inner: Arc<PeersInner>,
}

impl PeerHandle {
  pub fn new() -> PeerHandle {
    PeerHandle {
      inner: Arc::new(PeersInner {
        ctx: OnceLock::new(),
        clients: Mutex::new(HashMap::new()),
        server: Mutex::new(None),
        server_target: Mutex::new(None),
        server_failures: AtomicU32::new(0),
        multicast: Mutex::new(None),
        next_conn: AtomicU64::new(1),
      }),
    }
  }

  /// Wire in the connection context. Must happen before `start`.
  pub fn install_ctx(&self, ctx: ConnCtx) {
    let _ = self.inner.ctx.set(ctx);
  }

  fn ctx(&self) -> ConnCtx {
    self
      .inner
      .ctx
      .get()
      .cloned()
      .unwrap_or_else(|| panic!("peer context not installed"))
  }

  pub fn next_conn_id(&self) -> ConnId {
    self.inner.next_conn.fetch_add(1, Ordering::Relaxed)
  }

  /// Bring up the TCP listener, the multicast socket and (for leaves) the
  /// coordinator connection.
  pub async fn start(&self) -> Result<(), PeerError> {
    let ctx = self.ctx();
    let options = &ctx.options;

    if options.tcp_port != 0 {
      let listener = TcpListener::bind(("0.0.0.0", options.tcp_port)).await?;
      info!("Listening for peers on port {}", options.tcp_port);
      let this = self.clone();
      tokio::spawn(async move {
        loop {
          match listener.accept().await {
            Ok((stream, addr)) => {
              let ctx = this.ctx();
              let conn_id = this.next_conn_id();
              let host = addr.ip().to_string();
              tokio::spawn(connection::drive(stream, ctx, Some(host), conn_id, None));
            }
            Err(err) => {
              error!("Peer accept error: {}", err);
            }
          }
        }
      });
    }

    if options.multicast_port != 0 && !options.multicast_address.is_empty() {
      match bind_multicast(&options.multicast_address, options.multicast_port, options.multicast_ttl) {
        Ok(socket) => {
          let socket = Arc::new(socket);
          *self.inner.multicast.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&socket));
          let this = self.clone();
          tokio::spawn(async move {
            this.multicast_loop(socket).await;
          });
        }
        Err(err) => {
          error!(
            "Can't bind to multicast {}:{}: {}",
            options.multicast_address, options.multicast_port, err
          );
        }
      }
    }

    if let Some(ref addr) = options.job_server {
      *self.inner.server_target.lock().unwrap_or_else(|e| e.into_inner()) = Some((addr.host.clone(), addr.port));
    }
    if !options.job_server_mode && !options.no_job_server {
      self.spawn_connect(Duration::ZERO);
    }
    Ok(())
  }

  // Coordinator connection

  /// True when the peer network can take work off our hands.
  pub fn has_server(&self) -> bool {
    let Some(ctx) = self.inner.ctx.get() else {
      return false;
    };
    let options = &ctx.options;
    if options.job_server_mode {
      return true;
    }
    if options.no_job_server {
      return false;
    }
    self
      .inner
      .server
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .as_ref()
      .is_some_and(|(_, writer)| !writer.is_closed())
  }

  pub fn send_to_server(&self, message: Message) -> bool {
    let server = self.inner.server.lock().unwrap_or_else(|e| e.into_inner());
    match server.as_ref() {
      Some((_, writer)) => writer.send(Outbound { message, done: None }).is_ok(),
      None => false,
    }
  }

  fn spawn_connect(&self, delay: Duration) {
    let this = self.clone();
    tokio::spawn(async move {
      if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
      }
      this.connect_to_server().await;
    });
  }

  fn schedule_reconnect(&self) {
    let failures = self.inner.server_failures.fetch_add(1, Ordering::Relaxed) + 1;
    let delay = Duration::from_millis(RECONNECT_BASE_MS * failures as u64);
    debug!("connectToServer retry {} in {:?}", failures, delay);
    self.spawn_connect(delay);
  }

  async fn connect_to_server(&self) {
    let ctx = self.ctx();
    if ctx.options.job_server_mode || ctx.options.no_job_server {
      return;
    }
    if self.has_server() {
      return;
    }
    let target = self
      .inner
      .server_target
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    let Some((host, port)) = target else {
      // no coordinator known yet: ask the group and try again later
      self.multicast_probe().await;
      self.schedule_reconnect();
      return;
    };

    match connect_with_timeout(&host, port, ctx.options.connect_timeout_ms).await {
      Ok(stream) => {
        let conn_id = self.next_conn_id();
        let (writer, rx) = mpsc::unbounded_channel();
        if writer.send(Outbound { message: Message::Client, done: None }).is_err() {
          self.schedule_reconnect();
          return;
        }
        *self.inner.server.lock().unwrap_or_else(|e| e.into_inner()) = Some((conn_id, writer.clone()));
        self.inner.server_failures.store(0, Ordering::Relaxed);
        info!("Connected to server {}:{}", host, port);
        tokio::spawn(connection::drive(
          stream,
          ctx,
          Some(host),
          conn_id,
          Some((writer, rx)),
        ));
      }
      Err(err) => {
        error!("Failed to connect to server {}:{}: {}", host, port, err);
        self.schedule_reconnect();
      }
    }
  }

  /// Called by the connection driver when any connection closes; clears the
  /// coordinator slot and kicks off the reconnect backoff when it was ours.
  pub fn unregister(&self, conn_id: ConnId) {
    let removed_client = {
      let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
      clients.remove(&conn_id).map(|client| client.host)
    };
    if let Some(host) = removed_client {
      error!("Client disappeared {}", host);
    }

    let was_server = {
      let mut server = self.inner.server.lock().unwrap_or_else(|e| e.into_inner());
      if server.as_ref().is_some_and(|(id, _)| *id == conn_id) {
        *server = None;
        true
      } else {
        false
      }
    };
    if was_server {
      warn!("Disconnected from server");
      self.schedule_reconnect();
    }
  }

  // Coordinator role

  pub fn register_client(&self, conn_id: ConnId, host: String, writer: PeerWriter) {
    let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
    clients.insert(conn_id, ClientPeer { host, writer });
  }

  /// Send to every registered client except `except`. Returns the number of
  /// peers the message went to.
  pub fn broadcast_clients(&self, message: Message, except: Option<ConnId>) -> usize {
    let clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
    let mut sent = 0;
    for (conn_id, client) in clients.iter() {
      if Some(*conn_id) == except {
        continue;
      }
      if client
        .writer
        .send(Outbound {
          message: message.clone(),
          done: None,
        })
        .is_ok()
      {
        sent += 1;
      }
    }
    sent
  }

  // Outbound job requests

  /// Dial a peer and ask it for work. Resolves once the request frame is on
  /// the wire; the response comes back through the connection driver as a
  /// `JobResponseReceived` event carrying this connection id.
  pub async fn request_jobs(&self, host: &str, port: u16, num_jobs: u32) -> Result<ConnId, PeerError> {
    let ctx = self.ctx();
    let stream = connect_with_timeout(host, port, ctx.options.connect_timeout_ms).await?;
    let conn_id = self.next_conn_id();
    let (writer, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    writer
      .send(Outbound {
        message: Message::JobRequest { num_jobs },
        done: Some(done_tx),
      })
      .map_err(|_| PeerError::SendFailed)?;
    tokio::spawn(connection::drive(
      stream,
      ctx,
      Some(host.to_string()),
      conn_id,
      Some((writer, rx)),
    ));
    match done_rx.await {
      Ok(true) => Ok(conn_id),
      _ => Err(PeerError::SendFailed),
    }
  }

  // Multicast

  /// Broadcast the two-byte `s?` coordinator query.
  pub async fn multicast_probe(&self) {
    let socket = self
      .inner
      .multicast
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    let Some(socket) = socket else {
      return;
    };
    let ctx = self.ctx();
    let target = (ctx.options.multicast_address.as_str(), ctx.options.multicast_port);
    if let Err(err) = socket.send_to(b"s?", target).await {
      warn!("Multicast probe failed: {}", err);
    }
  }

  async fn multicast_loop(&self, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 1024];
    loop {
      let (len, src) = match socket.recv_from(&mut buf).await {
        Ok(received) => received,
        Err(err) => {
          error!("Multicast receive error: {}", err);
          return;
        }
      };
      self.handle_multicast(&buf[..len], src.ip().to_string(), &socket).await;
    }
  }

  async fn handle_multicast(&self, data: &[u8], src_ip: String, socket: &UdpSocket) {
    let ctx = self.ctx();
    let options = &ctx.options;
    debug!("Got {} bytes from multicast socket from {}", data.len(), src_ip);

    if data == b"s?" {
      // tell the asker where the coordinator is, if we know
      let reply = if self.has_server() && !options.job_server_mode {
        self
          .inner
          .server_target
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .clone()
      } else if let Some(ref addr) = options.job_server {
        Some((addr.host.clone(), addr.port))
      } else if options.job_server_mode {
        // empty host: the receiver uses the datagram's source address
        Some((String::new(), options.tcp_port))
      } else {
        None
      };
      if let Some(reply) = reply {
        match serde_cbor::to_vec(&reply) {
          Ok(bytes) => {
            let target = (options.multicast_address.as_str(), options.multicast_port);
            if let Err(err) = socket.send_to(&bytes, target).await {
              warn!("Multicast reply failed: {}", err);
            }
          }
          Err(err) => error!("Couldn't encode multicast reply: {}", err),
        }
      }
      return;
    }

    if options.job_server_mode || self.has_server() {
      return;
    }
    match serde_cbor::from_slice::<(String, u16)>(data) {
      Ok((mut host, port)) => {
        if host.is_empty() {
          host = src_ip.clone();
        }
        debug!("{} tells me the server is to be found at {}:{}", src_ip, host, port);
        *self.inner.server_target.lock().unwrap_or_else(|e| e.into_inner()) = Some((host, port));
        self.spawn_connect(Duration::ZERO);
      }
      Err(err) => {
        debug!("Undecodable multicast datagram from {}: {}", src_ip, err);
      }
    }
  }
}

impl Default for PeerHandle {
  fn default() -> Self {
    Self::new()
  }
}

async fn connect_with_timeout(host: &str, port: u16, timeout_ms: u64) -> Result<TcpStream, PeerError> {
  let connect = TcpStream::connect((host, port));
  if timeout_ms == 0 {
    return Ok(connect.await?);
  }
  match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
    Ok(result) => Ok(result?),
    Err(_) => Err(PeerError::Timeout),
  }
}

/// Bind the multicast socket: SO_REUSEADDR/SO_REUSEPORT so several daemons
/// on one machine can share the port, membership in the group, loopback off.
fn bind_multicast(group: &str, port: u16, ttl: u32) -> std::io::Result<UdpSocket> {
  use std::os::fd::FromRawFd;

  let group: Ipv4Addr = group
    .parse()
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad multicast address"))?;

  let std_socket = unsafe {
    let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    if fd < 0 {
      return Err(std::io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    libc::setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &one as *const _ as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    );
    #[cfg(not(target_os = "solaris"))]
    libc::setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEPORT,
      &one as *const _ as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    );
    let addr = libc::sockaddr_in {
      sin_family: libc::AF_INET as libc::sa_family_t,
      sin_port: port.to_be(),
      sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
      sin_zero: [0; 8],
      #[cfg(any(target_os = "macos", target_os = "freebsd"))]
      sin_len: 0,
    };
    if libc::bind(
      fd,
      &addr as *const _ as *const libc::sockaddr,
      std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ) < 0
    {
      let err = std::io::Error::last_os_error();
      libc::close(fd);
      return Err(err);
    }
    std::net::UdpSocket::from_raw_fd(fd)
  };
  std_socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
  std_socket.set_multicast_loop_v4(false)?;
  if ttl != 0 {
    std_socket.set_multicast_ttl_v4(ttl)?;
  }
  std_socket.set_nonblocking(true)?;
  UdpSocket::from_std(std_socket)
}

/// Tell the scheduler a connection went away.
pub fn notify_disconnect(ctx: &ConnCtx, conn_id: ConnId) {
  ctx.peers.unregister(conn_id);
  ctx.scheduler.send(Event::PeerDisconnected { conn: conn_id });
}
