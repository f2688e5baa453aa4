//! Two-daemon tests: a coordinator that can't index locally hands its work
//! to a connected peer over TCP and commits the remote result.

use cintel_core::{DaemonOptions, config::JobServerAddr};
use daemon::{Client, Daemon};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use wire::Method;

fn worker_binary() -> PathBuf {
  PathBuf::from(env!("CARGO_BIN_EXE_cintel-worker"))
}

fn free_port() -> u16 {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}

async fn connect(socket_path: &Path) -> Client {
  for _ in 0..250 {
    if let Ok(client) = Client::connect_to(socket_path).await {
      return client;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("daemon never came up at {:?}", socket_path);
}

/// Wait until nothing is indexing and no project is mid-load or mid-save.
async fn wait_until_idle(client: &mut Client, deadline: Duration) {
  let start = std::time::Instant::now();
  loop {
    let (lines, _) = client.query(Method::IsIndexing, serde_json::json!({})).await.unwrap();
    if lines == vec!["0"] {
      let (projects, _) = client.query(Method::Project, serde_json::json!({})).await.unwrap();
      if projects
        .iter()
        .all(|line| !line.contains("(loading)") && !line.contains("(syncing)"))
      {
        return;
      }
    }
    assert!(start.elapsed() < deadline, "indexing never finished");
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
}

#[tokio::test]
async fn test_remote_dispatch_through_coordinator() {
  let dir_a = TempDir::new().unwrap();
  let dir_b = TempDir::new().unwrap();
  let port_a = free_port();

  let root = dir_a.path().join("src");
  std::fs::create_dir_all(&root).unwrap();
  std::fs::write(
    root.join("a.c"),
    "int remote_answer(void) { return 42; }\nint main(void) { return remote_answer(); }\n",
  )
  .unwrap();
  let root = root.canonicalize().unwrap();

  // A: coordinator with zero local slots; everything it accepts must be
  // shipped out
  let options_a = DaemonOptions {
    data_dir: dir_a.path().join("data"),
    socket_path: dir_a.path().join("a.sock"),
    job_count: 0,
    tcp_port: port_a,
    job_server_mode: true,
    exclude_filters: Vec::new(),
    ..Default::default()
  };
  // B: a leaf with local slots, statically pointed at A
  let options_b = DaemonOptions {
    data_dir: dir_b.path().join("data"),
    socket_path: dir_b.path().join("b.sock"),
    job_count: 2,
    tcp_port: free_port(),
    job_server: Some(JobServerAddr {
      host: "127.0.0.1".into(),
      port: port_a,
    }),
    worker_path: Some(worker_binary()),
    exclude_filters: Vec::new(),
    ..Default::default()
  };

  let socket_a = options_a.socket_path.clone();
  let socket_b = options_b.socket_path.clone();
  let handle_a = tokio::spawn(async move { Daemon::new(options_a).run().await.expect("daemon A failed") });
  let handle_b = tokio::spawn(async move { Daemon::new(options_b).run().await.expect("daemon B failed") });

  let mut client_a = connect(&socket_a).await;
  let mut client_b = connect(&socket_b).await;

  // give B a moment to join A's peer network
  tokio::time::sleep(Duration::from_millis(500)).await;

  let code = client_a.compile("gcc -c a.c", &root, Some(&root)).await.unwrap();
  assert_eq!(code, 0, "compile command rejected");

  // A can't run anything itself; the only way this finishes is through B
  wait_until_idle(&mut client_a, Duration::from_secs(90)).await;

  let (symbols, code) = client_a
    .query(Method::ListSymbols, serde_json::json!({}))
    .await
    .unwrap();
  assert_eq!(code, 0);
  assert!(
    symbols.iter().any(|s| s == "remote_answer"),
    "remote result never committed: {symbols:?}"
  );

  let _ = client_a.query(Method::Shutdown, serde_json::json!({})).await;
  let _ = client_b.query(Method::Shutdown, serde_json::json!({})).await;
  let _ = tokio::time::timeout(Duration::from_secs(10), handle_a).await;
  let _ = tokio::time::timeout(Duration::from_secs(10), handle_b).await;
}
