//! End-to-end bridge test: real config file, scripted provider, in-process
//! cloud server, local control socket.

#![cfg(unix)]

use std::collections::HashSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use clara_companion::bridge::Bridge;
use clara_companion::config::{Config, CredentialsConfig, ProviderConfig};
use clara_companion::control::client::LocalClient;
use clara_companion::protocol::{AddServerPayload, LocalFrame};

const PROVIDER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *list_tools*) printf '%s\n' '{"tools":[{"name":"read_file","description":"","input_schema":{}}]}' ;;
    *) printf '%s\n' '{"result":"hello"}' ;;
  esac
done
"#;

const SECOND_PROVIDER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *list_tools*) printf '%s\n' '{"tools":[{"name":"fetch_url","description":"","input_schema":{}}]}' ;;
    *) printf '%s\n' '{"result":"ok"}' ;;
  esac
done
"#;

#[derive(Debug)]
enum CloudEvent {
    Registered(Value),
    Result(Value),
}

/// Minimal control plane: ack announcements, forward a channel of frames to
/// send, surface everything interesting it receives.
async fn fake_cloud(
    listener: TcpListener,
    events: mpsc::UnboundedSender<CloudEvent>,
    mut to_send: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            continue;
        };
        loop {
            tokio::select! {
                outgoing = to_send.recv() => {
                    let Some(outgoing) = outgoing else { return };
                    if ws.send(Message::text(outgoing)).await.is_err() {
                        break;
                    }
                }
                incoming = ws.next() => {
                    let Some(Ok(message)) = incoming else { break };
                    let Message::Text(text) = message else { continue };
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    match value["type"].as_str() {
                        Some("register_tools") => {
                            let _ = events.send(CloudEvent::Registered(value));
                            let _ = ws
                                .send(Message::text(
                                    r#"{"type":"ack","payload":{"status":"ok","tools_registered":3}}"#,
                                ))
                                .await;
                        }
                        Some("tool_result") => {
                            let _ = events.send(CloudEvent::Result(value));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn cold_start_invoke_and_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (send_tx, send_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(fake_cloud(listener, events_tx, send_rx));

    // Persist a config pointing at the fake cloud with one enabled provider.
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp-config.yaml");
    let mut config = Config::default();
    config.cloud.ws_url = format!("ws://127.0.0.1:{port}/api/companion/ws");
    config.cloud.api_base = "http://127.0.0.1:1".to_string();
    config.auth = CredentialsConfig {
        access_token: "at".into(),
        refresh_token: "rt".into(),
        expires_at: i64::MAX,
        device_id: Some("dev-e2e".into()),
    };
    config.providers.push(ProviderConfig {
        name: "fs".into(),
        description: String::new(),
        command: "sh".into(),
        args: vec!["-c".into(), PROVIDER_SCRIPT.into()],
        transport: "stdio".into(),
        enabled: true,
    });
    config.save(&config_path).unwrap();

    let bridge = tokio::spawn(Bridge::run(config_path));

    // The announcement carries the core set plus the provider's tool.
    let CloudEvent::Registered(registered) =
        tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .expect("no register_tools within deadline")
            .unwrap()
    else {
        panic!("expected register_tools first");
    };
    let names: HashSet<String> = registered["payload"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    let expected: HashSet<String> = ["echo", "system_info", "read_file"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected);
    assert_eq!(registered["payload"]["servers"][0]["name"], "fs");
    assert_eq!(registered["payload"]["client_id"], "dev-e2e");

    // A remote invocation reaches the provider and yields one result.
    send_tx
        .send(
            r#"{"type":"tool_call","payload":{"call_id":"c1","tool_name":"read_file","arguments":{"path":"/tmp/x"}}}"#
                .to_string(),
        )
        .unwrap();
    let CloudEvent::Result(result) =
        tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .expect("no tool_result within deadline")
            .unwrap()
    else {
        panic!("expected tool_result");
    };
    assert_eq!(result["payload"]["call_id"], "c1");
    assert_eq!(result["payload"]["success"], true);
    assert_eq!(result["payload"]["result"], "hello");

    // The local channel answers: status converges on "connected", ping
    // yields a pong, and a live add is applied and visible.
    let mut client = LocalClient::connect().await.unwrap();
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = client.wait_status().await.unwrap();
            if status.connection == "connected" {
                return status;
            }
        }
    })
    .await
    .expect("status never reached connected");
    assert!(connected.auth_ok);
    assert_eq!(connected.providers.len(), 1);
    assert!(connected.providers[0].running);
    assert_eq!(connected.providers[0].tools, 1);

    client.ping().await.unwrap();

    client
        .request_ok(&LocalFrame::AddServer(AddServerPayload {
            request_id: String::new(),
            name: "web".into(),
            description: String::new(),
            command: "sh".into(),
            args: vec!["-c".into(), SECOND_PROVIDER_SCRIPT.into()],
            enabled: true,
        }))
        .await
        .unwrap();

    let with_web = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = client.wait_status().await.unwrap();
            if status.providers.len() == 2
                && status.providers.iter().any(|p| p.name == "web" && p.running)
            {
                return status;
            }
        }
    })
    .await
    .expect("added provider never appeared");
    assert!(with_web.providers.iter().any(|p| p.name == "fs"));

    // Graceful shutdown over the local channel.
    client.request_ok(&LocalFrame::Shutdown {}).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), bridge)
        .await
        .expect("bridge did not stop")
        .unwrap();
    assert!(outcome.is_ok());
}
