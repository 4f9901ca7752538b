//! Local control channel tests over a real unix socket.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use clara_companion::control::{ControlCommand, ControlRequest, ControlServer};
use clara_companion::protocol::{
    ActivityRecord, AddServerPayload, LocalFrame, RemoveServerPayload, StatusPayload,
};

fn sample_status() -> StatusPayload {
    StatusPayload {
        version: "test".into(),
        connection: "idle".into(),
        cloud_url: "wss://example.invalid/ws".into(),
        device_id: None,
        auth_ok: false,
        providers: vec![],
        uptime_secs: 0,
    }
}

fn activity(summary: &str) -> ActivityRecord {
    ActivityRecord {
        call_id: "c1".into(),
        tool: "echo".into(),
        origin: "core".into(),
        args_summary: summary.into(),
        success: true,
        error: String::new(),
        latency_ms: 1,
        timestamp: Utc::now(),
    }
}

struct Harness {
    server: Arc<ControlServer>,
    commands_rx: Option<mpsc::Receiver<ControlCommand>>,
    #[allow(dead_code)]
    status_tx: watch::Sender<StatusPayload>,
    cancel: CancellationToken,
    dir: tempfile::TempDir,
}

impl Harness {
    fn socket_path(&self) -> std::path::PathBuf {
        self.dir.path().join("ctl.sock")
    }

    /// Auto-approve every supervisory command.
    fn approve_all(&mut self) {
        let mut rx = self.commands_rx.take().unwrap();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let _ = command.reply.send(Ok(()));
            }
        });
    }
}

fn start_server(write_deadline: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctl.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let (status_tx, status_rx) = watch::channel(sample_status());
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let server = Arc::new(ControlServer::with_write_deadline(
        status_rx,
        commands_tx,
        write_deadline,
    ));
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&server).run_on(listener, cancel.clone()));

    Harness {
        server,
        commands_rx: Some(commands_rx),
        status_tx,
        cancel,
        dir,
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let stream = tokio::net::UnixStream::connect(path).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, frame: &LocalFrame) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next(&mut self) -> LocalFrame {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("no frame within deadline")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn status_snapshot_pushed_on_connect() {
    let harness = start_server(Duration::from_secs(5));
    let mut client = TestClient::connect(&harness.socket_path()).await;

    let LocalFrame::Status(status) = client.next().await else {
        panic!("expected status first");
    };
    assert_eq!(status.version, "test");

    harness.cancel.cancel();
}

#[tokio::test]
async fn ping_yields_exactly_one_pong() {
    let harness = start_server(Duration::from_secs(5));
    let mut client = TestClient::connect(&harness.socket_path()).await;
    let _status = client.next().await;

    client.send(&LocalFrame::Ping {}).await;
    assert!(matches!(client.next().await, LocalFrame::Pong {}));

    // A second ping gets a second pong; nothing extra in between.
    client.send(&LocalFrame::Ping {}).await;
    assert!(matches!(client.next().await, LocalFrame::Pong {}));

    harness.cancel.cancel();
}

#[tokio::test]
async fn commands_route_to_the_orchestrator() {
    let mut harness = start_server(Duration::from_secs(5));
    let mut rx = harness.commands_rx.take().unwrap();

    // Approve adds, refuse removes.
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let outcome = match &command.request {
                ControlRequest::Add(payload) => {
                    assert_eq!(payload.name, "fs");
                    Ok(())
                }
                ControlRequest::Remove(name) => Err(clara_companion::Error::Config(format!(
                    "no such provider: {name}"
                ))),
                _ => Ok(()),
            };
            let _ = command.reply.send(outcome);
        }
    });

    let mut client = TestClient::connect(&harness.socket_path()).await;
    let _status = client.next().await;

    client
        .send(&LocalFrame::AddServer(AddServerPayload {
            request_id: String::new(),
            name: "fs".into(),
            description: String::new(),
            command: "fs-provider".into(),
            args: vec![],
            enabled: true,
        }))
        .await;
    assert!(matches!(client.next().await, LocalFrame::Ok {}));

    client
        .send(&LocalFrame::RemoveServer(RemoveServerPayload {
            request_id: String::new(),
            name: "ghost".into(),
        }))
        .await;
    let LocalFrame::Error(e) = client.next().await else {
        panic!("expected error");
    };
    assert!(e.message.contains("ghost"));

    harness.cancel.cancel();
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let harness = start_server(Duration::from_secs(5));
    let mut a = TestClient::connect(&harness.socket_path()).await;
    let mut b = TestClient::connect(&harness.socket_path()).await;
    let _ = a.next().await;
    let _ = b.next().await;

    harness
        .server
        .broadcast(LocalFrame::Activity(activity("{}")));

    let LocalFrame::Activity(from_a) = a.next().await else {
        panic!("expected activity on a");
    };
    let LocalFrame::Activity(from_b) = b.next().await else {
        panic!("expected activity on b");
    };
    assert_eq!(from_a.call_id, from_b.call_id);

    harness.cancel.cancel();
}

#[tokio::test]
async fn shutdown_replies_ok_before_stopping() {
    let mut harness = start_server(Duration::from_secs(5));
    let mut rx = harness.commands_rx.take().unwrap();

    let saw_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&saw_shutdown);
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if matches!(command.request, ControlRequest::Shutdown) {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            let _ = command.reply.send(Ok(()));
        }
    });

    let mut client = TestClient::connect(&harness.socket_path()).await;
    let _ = client.next().await;

    client.send(&LocalFrame::Shutdown {}).await;
    assert!(matches!(client.next().await, LocalFrame::Ok {}));

    tokio::time::timeout(Duration::from_secs(2), async {
        while !saw_shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    harness.cancel.cancel();
}

#[tokio::test]
async fn slow_client_is_evicted_others_unaffected() {
    let mut harness = start_server(Duration::from_millis(200));
    harness.approve_all();

    let mut responsive = TestClient::connect(&harness.socket_path()).await;
    let _slow = TestClient::connect(&harness.socket_path()).await;
    // The slow client never reads. The responsive one drains everything.
    let (drained_tx, mut drained_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let frame = responsive.next().await;
            if drained_tx.send(frame).is_err() {
                break;
            }
        }
    });

    // Wait until both sessions are up.
    tokio::time::timeout(Duration::from_secs(2), async {
        while harness.server.session_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Flood with large frames until the slow client's buffer fills and its
    // write deadline expires.
    let big = "x".repeat(64 * 1024);
    let server = Arc::clone(&harness.server);
    let flood = tokio::spawn(async move {
        for _ in 0..400 {
            server.broadcast(LocalFrame::Activity(activity(&big)));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while harness.server.session_count() > 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("slow session was not evicted");
    flood.abort();

    // The responsive client kept receiving frames the whole time.
    assert!(drained_rx.recv().await.is_some());

    harness.cancel.cancel();
}
