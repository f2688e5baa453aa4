//! End-to-end tests against a real daemon on a temp socket, with the real
//! worker binary doing the indexing.

use cintel_core::DaemonOptions;
use daemon::{Client, Daemon};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use wire::Method;

fn worker_binary() -> PathBuf {
  PathBuf::from(env!("CARGO_BIN_EXE_cintel-worker"))
}

fn base_options(dir: &TempDir) -> DaemonOptions {
  DaemonOptions {
    data_dir: dir.path().join("data"),
    socket_path: dir.path().join("cintel.sock"),
    job_count: 2,
    worker_path: Some(worker_binary()),
    exclude_filters: Vec::new(),
    ..Default::default()
  }
}

async fn start_daemon(options: DaemonOptions) -> (tokio::task::JoinHandle<i32>, PathBuf) {
  let socket_path = options.socket_path.clone();
  let handle = tokio::spawn(async move {
    let daemon = Daemon::new(options);
    daemon.run().await.expect("daemon failed")
  });
  (handle, socket_path)
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

async fn shut_down(client: &mut Client, handle: tokio::task::JoinHandle<i32>) {
  let _ = client.query(Method::Shutdown, serde_json::json!({})).await;
  let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
}

fn write_project(dir: &TempDir) -> PathBuf {
  let root = dir.path().join("src");
  std::fs::create_dir_all(&root).unwrap();
  std::fs::write(
    root.join("a.c"),
    "int add(int a, int b) { return a + b; }\n\nint main(void) { return add(1, 2); }\n",
  )
  .unwrap();
  std::fs::write(root.join("b.c"), "static int mul(int a, int b) { return a * b; }\n").unwrap();
  root.canonicalize().unwrap()
}

#[tokio::test]
async fn test_single_node_index() {
  let dir = TempDir::new().unwrap();
  let root = write_project(&dir);
  let (handle, socket) = start_daemon(base_options(&dir)).await;
  let mut client = connect(&socket).await;

  let code = client.compile("gcc -c a.c b.c", &root, Some(&root)).await.unwrap();
  assert_eq!(code, 0, "compile command rejected");
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  let (symbols, code) = client
    .query(Method::ListSymbols, serde_json::json!({}))
    .await
    .unwrap();
  assert_eq!(code, 0);
  for expected in ["add", "main", "mul"] {
    assert!(symbols.iter().any(|s| s == expected), "missing {expected} in {symbols:?}");
  }

  let a_path = root.join("a.c").display().to_string();
  let (lines, _) = client
    .query(Method::IsIndexed, serde_json::json!({"path": a_path}))
    .await
    .unwrap();
  assert_eq!(lines, vec!["indexed"]);

  // references to add include the call site in main
  let (refs, code) = client
    .query(Method::ReferencesName, serde_json::json!({"name": "add"}))
    .await
    .unwrap();
  assert_eq!(code, 0);
  assert!(refs.len() >= 2, "expected definition + call site, got {refs:?}");

  shut_down(&mut client, handle).await;
}

#[tokio::test]
async fn test_resubmitting_same_command_is_dropped() {
  let dir = TempDir::new().unwrap();
  let root = write_project(&dir);
  let (handle, socket) = start_daemon(base_options(&dir)).await;
  let mut client = connect(&socket).await;

  assert_eq!(client.compile("gcc -c a.c", &root, Some(&root)).await.unwrap(), 0);
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  // identical command: recognized as already indexed, dropped up front
  assert_eq!(client.compile("gcc -c a.c", &root, Some(&root)).await.unwrap(), 1);

  // a different command line for the same file is new work
  assert_eq!(
    client.compile("gcc -c -DEXTRA a.c", &root, Some(&root)).await.unwrap(),
    0
  );
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  shut_down(&mut client, handle).await;
}

#[tokio::test]
async fn test_suspended_header_is_not_indexed_but_stays_a_dependency() {
  let dir = TempDir::new().unwrap();
  let root = dir.path().join("src");
  std::fs::create_dir_all(&root).unwrap();
  std::fs::write(root.join("x.h"), "int helper(int v);\n").unwrap();
  std::fs::write(
    root.join("a.c"),
    "#include \"x.h\"\nint main(void) { return helper(7); }\n",
  )
  .unwrap();
  std::fs::write(root.join("b.c"), "int standalone(void) { return 1; }\n").unwrap();
  let root = root.canonicalize().unwrap();

  let (handle, socket) = start_daemon(base_options(&dir)).await;
  let mut client = connect(&socket).await;

  // first index something so the project exists and is current
  assert_eq!(client.compile("gcc -c b.c", &root, Some(&root)).await.unwrap(), 0);
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  let header = root.join("x.h").display().to_string();
  let (lines, _) = client
    .query(Method::SuspendFile, serde_json::json!({"match": header}))
    .await
    .unwrap();
  assert!(lines[0].contains("now suspended"), "{lines:?}");

  assert_eq!(client.compile("gcc -c a.c", &root, Some(&root)).await.unwrap(), 0);
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  // nothing from the suspended header was committed
  let (symbols, _) = client
    .query(Method::ListSymbols, serde_json::json!({}))
    .await
    .unwrap();
  assert!(symbols.iter().any(|s| s == "main"));
  assert!(!symbols.iter().any(|s| s == "helper"), "{symbols:?}");

  // but a.c -> x.h survives as a dependency edge
  let (dependents, _) = client
    .query(Method::Dependencies, serde_json::json!({"path": header}))
    .await
    .unwrap();
  assert!(
    dependents.iter().any(|line| line.ends_with("a.c")),
    "expected a.c in {dependents:?}"
  );

  shut_down(&mut client, handle).await;
}

#[tokio::test]
async fn test_crashing_worker_retries_then_commits_empty() {
  let dir = TempDir::new().unwrap();
  let root = write_project(&dir);
  let mut options = base_options(&dir);
  // /bin/false ignores its stdin and exits 1: every attempt is a crash
  options.worker_path = Some(PathBuf::from("/bin/false"));
  options.max_crash_count = 2;
  let (handle, socket) = start_daemon(options).await;
  let mut client = connect(&socket).await;

  assert_eq!(client.compile("gcc -c a.c", &root, Some(&root)).await.unwrap(), 0);
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  // no symbols were committed
  let (symbols, _) = client
    .query(Method::ListSymbols, serde_json::json!({}))
    .await
    .unwrap();
  assert!(symbols.is_empty(), "{symbols:?}");

  // but the source is known and its self-dependency committed, so a
  // dirty re-index can still find it
  let a_path = root.join("a.c").display().to_string();
  let (lines, _) = client
    .query(Method::IsIndexed, serde_json::json!({"path": a_path}))
    .await
    .unwrap();
  assert_eq!(lines, vec!["indexed"]);

  shut_down(&mut client, handle).await;
}

#[tokio::test]
async fn test_project_listing_and_job_count() {
  let dir = TempDir::new().unwrap();
  let root = write_project(&dir);
  let (handle, socket) = start_daemon(base_options(&dir)).await;
  let mut client = connect(&socket).await;

  assert_eq!(client.compile("gcc -c a.c", &root, Some(&root)).await.unwrap(), 0);
  wait_until_idle(&mut client, Duration::from_secs(60)).await;

  let (projects, _) = client.query(Method::Project, serde_json::json!({})).await.unwrap();
  assert_eq!(projects.len(), 1);
  assert!(projects[0].contains("(loaded)"));
  assert!(projects[0].ends_with("<="));

  let (lines, _) = client.query(Method::JobCount, serde_json::json!({})).await.unwrap();
  assert_eq!(lines, vec!["Running with 2 jobs"]);
  let (lines, _) = client
    .query(Method::JobCount, serde_json::json!({"count": 4}))
    .await
    .unwrap();
  assert_eq!(lines, vec!["Changed jobs to 4"]);
  let (lines, _) = client.query(Method::JobCount, serde_json::json!({})).await.unwrap();
  assert_eq!(lines, vec!["Running with 4 jobs"]);

  shut_down(&mut client, handle).await;
}

#[tokio::test]
async fn test_query_without_projects() {
  let dir = TempDir::new().unwrap();
  let (handle, socket) = start_daemon(base_options(&dir)).await;
  let mut client = connect(&socket).await;

  let (lines, code) = client
    .query(
      Method::FollowLocation,
      serde_json::json!({"location": "/nowhere/a.c:1:1"}),
    )
    .await
    .unwrap();
  assert_eq!(code, 1);
  assert!(lines.is_empty() || lines == vec!["Not indexed"]);

  let (lines, _) = client.query(Method::IsIndexing, serde_json::json!({})).await.unwrap();
  assert_eq!(lines, vec!["0"]);

  shut_down(&mut client, handle).await;
}
