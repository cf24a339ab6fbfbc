//! End-to-end tests: host window, broker and cache against the
//! `capbridge-echo` worker binary.

use std::sync::Arc;
use std::time::Duration;

use capbridge::{
    BrokerConfig, DiskCache, HostWindow, SessionHandle, StaticRegistry, WorkerCommand,
};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;

const ECHO: &str = env!("CARGO_BIN_EXE_capbridge-echo");
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

fn window(cache_dir: &tempfile::TempDir) -> HostWindow {
    let registry = StaticRegistry::new()
        .with_service("echo", [WorkerCommand::new(ECHO).with_args(["echo"])])
        .with_service(
            "broken",
            [WorkerCommand::new(ECHO).with_args(["broken", "--unsupported"])],
        )
        .with_service(
            "fallback",
            [
                WorkerCommand::new("/nonexistent/capbridge-worker"),
                WorkerCommand::new(ECHO).with_args(["fallback"]),
            ],
        )
        .with_service("missing", [WorkerCommand::new("/nonexistent/capbridge-worker")]);
    HostWindow::new(
        BrokerConfig::default(),
        Arc::new(registry),
        Arc::new(DiskCache::new(cache_dir.path()).unwrap()),
    )
}

async fn next(handle: &mut SessionHandle) -> Value {
    let raw = tokio::time::timeout(RESPONSE_TIMEOUT, handle.recv())
        .await
        .expect("no response in time")
        .expect("session channel closed");
    serde_json::from_str(&raw).unwrap()
}

async fn submit(handle: &SessionHandle, cmd: Value) {
    handle.submit(&cmd.to_string()).await.unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn start_ping_stop() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "echo"})).await;
    submit(&session, json!({"action": "ping", "service": "echo", "text": "hi"})).await;

    let started = next(&mut session).await;
    assert_eq!(started["action"], "started-service");
    assert_eq!(started["service"], "echo");
    assert_eq!(started["extension"], "echo");

    let pong = next(&mut session).await;
    assert_eq!(pong["action"], "pong");
    assert_eq!(pong["text"], "hi");
    assert_eq!(pong["echoed"], "ping");

    submit(&session, json!({"action": "stop-service", "service": "echo"})).await;
    let stopped = next(&mut session).await;
    assert_eq!(stopped["action"], "stopped-service");
    assert!(!window.broker().is_active("echo"));

    window.shutdown().await;
}

#[tokio::test]
async fn unknown_action_gets_worker_error() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "echo"})).await;
    submit(&session, json!({"action": "sing", "service": "echo"})).await;

    assert_eq!(next(&mut session).await["action"], "started-service");
    let error = next(&mut session).await;
    assert_eq!(error["action"], "error");
    assert_eq!(error["description"], "Unknown action.");

    window.shutdown().await;
}

#[tokio::test]
async fn launch_failure_is_answered_locally() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "missing"})).await;
    let failed = next(&mut session).await;
    assert_eq!(failed["action"], "failed-service");
    assert_eq!(failed["service"], "missing");
    assert!(!window.broker().is_active("missing"));
}

#[tokio::test]
async fn later_executable_is_tried() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "fallback"})).await;
    let started = next(&mut session).await;
    assert_eq!(started["action"], "started-service");
    assert_eq!(started["service"], "fallback");

    window.shutdown().await;
}

#[tokio::test]
async fn sessions_share_and_release_worker() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut a = window.open_session("https://a.test/").unwrap();
    let mut b = window.open_session("https://b.test/").unwrap();

    submit(&a, json!({"action": "start-service", "service": "echo"})).await;
    assert_eq!(next(&mut a).await["action"], "started-service");
    let first = window.broker().connection("echo").unwrap();

    submit(&b, json!({"action": "start-service", "service": "echo"})).await;
    assert_eq!(next(&mut b).await["action"], "started-service");
    assert_eq!(window.broker().connection("echo").unwrap().id(), first.id());

    submit(&b, json!({"action": "ping", "service": "echo", "text": "only b"})).await;
    assert_eq!(next(&mut b).await["text"], "only b");
    assert!(a.try_recv().is_none());

    window.close_session(a.id()).await;
    assert!(window.broker().is_active("echo"));
    window.close_session(b.id()).await;
    assert!(!window.broker().is_active("echo"));

    let mut c = window.open_session("https://c.test/").unwrap();
    submit(&c, json!({"action": "start-service", "service": "echo"})).await;
    assert_eq!(next(&mut c).await["action"], "started-service");
    let second = window.broker().connection("echo").unwrap();
    assert_ne!(second.id(), first.id());

    window.shutdown().await;
}

#[tokio::test]
async fn unsupported_worker_fails_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "broken"})).await;
    let failed = next(&mut session).await;
    assert_eq!(failed["action"], "failed-service");
    assert_eq!(failed["service"], "broken");
    assert_eq!(failed["description"], "service not supported on this platform");

    let broker = window.broker().clone();
    assert!(eventually(|| !broker.is_active("broken")).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.try_recv().is_none());
}

#[tokio::test]
async fn worker_crash_is_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut a = window.open_session("https://a.test/").unwrap();
    let mut b = window.open_session("https://b.test/").unwrap();

    for session in [&a, &b] {
        submit(session, json!({"action": "start-service", "service": "echo"})).await;
    }
    assert_eq!(next(&mut a).await["action"], "started-service");
    assert_eq!(next(&mut b).await["action"], "started-service");

    submit(&a, json!({"action": "crash", "service": "echo"})).await;
    for session in [&mut a, &mut b] {
        let failed = next(session).await;
        assert_eq!(failed["action"], "failed-service");
        assert_eq!(failed["service"], "echo");
    }

    let broker = window.broker().clone();
    assert!(eventually(|| !broker.is_active("echo")).await);
}

#[tokio::test]
async fn second_worker_connection_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    submit(&session, json!({"action": "start-service", "service": "echo"})).await;
    assert_eq!(next(&mut session).await["action"], "started-service");

    let port = window.broker().connection("echo").unwrap().port().unwrap();
    let mut intruder = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(RESPONSE_TIMEOUT, intruder.read(&mut buf))
        .await
        .expect("extra connection left open");
    assert!(matches!(read, Ok(0) | Err(_)));

    submit(&session, json!({"action": "ping", "service": "echo", "text": "still here"})).await;
    assert_eq!(next(&mut session).await["text"], "still here");

    window.shutdown().await;
}

#[tokio::test]
async fn local_file_url_gets_filename() {
    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();

    let clip = dir.path().join("clip.wav");
    std::fs::write(&clip, b"RIFF").unwrap();
    let url = reqwest::Url::from_file_path(&clip).unwrap().to_string();

    submit(&session, json!({"action": "start-service", "service": "echo"})).await;
    submit(&session, json!({"action": "ping", "service": "echo", "url": url})).await;

    assert_eq!(next(&mut session).await["action"], "started-service");
    let pong = next(&mut session).await;
    assert_eq!(pong["filename"], clip.to_str().unwrap());
    assert!(pong.get("deferred").is_none());

    window.shutdown().await;
}

#[tokio::test]
async fn remote_url_is_deferred_then_resolved() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/sounds/a.mp3"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(b"ID3".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let window = window(&dir);
    let mut session = window.open_session("https://a.test/").unwrap();
    let url = format!("{}/sounds/a.mp3", server.uri());

    submit(&session, json!({"action": "start-service", "service": "echo"})).await;
    assert_eq!(next(&mut session).await["action"], "started-service");
    submit(&session, json!({"action": "ping", "service": "echo", "url": url})).await;

    let first = next(&mut session).await;
    let resolved = next(&mut session).await;

    assert_eq!(first["echoed"], "ping");
    assert!(first.get("filename").is_none());
    let deferred = first["deferred"].as_u64().unwrap();

    assert_eq!(resolved["echoed"], "deferred-result");
    assert_eq!(resolved["deferred"].as_u64(), Some(deferred));
    assert_eq!(resolved["invalid"], false);
    let filename = resolved["filename"].as_str().unwrap();
    assert!(filename.ends_with(".mp3"));
    assert_eq!(std::fs::read(filename).unwrap(), b"ID3");

    submit(&session, json!({"action": "ping", "service": "echo", "url": url})).await;
    let cached = next(&mut session).await;
    assert_eq!(cached["filename"], filename);
    assert!(cached.get("deferred").is_none());

    window.shutdown().await;
}
