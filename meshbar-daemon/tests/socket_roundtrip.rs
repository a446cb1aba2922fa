use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use meshbar_core::{DaemonSettings, EventLog};
use meshbar_daemon::engine::{ScriptHandle, ScriptedEngine};
use meshbar_daemon::{CoreController, Daemon, DaemonState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(socket: &Path) -> Self {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(socket).await {
                let (reader, writer) = stream.into_split();
                return Self {
                    lines: BufReader::new(reader).lines(),
                    writer,
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon socket never came up at {}", socket.display());
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("newline");
        let reply = self
            .lines
            .next_line()
            .await
            .expect("read")
            .expect("response line");
        serde_json::from_str(&reply).expect("response json")
    }

    async fn call(&mut self, id: u64, cmd: Value) -> Value {
        let request = json!({ "id": id, "cmd": cmd });
        let response = self.send_raw(&request.to_string()).await;
        assert_eq!(response["id"], json!(id));
        response
    }
}

fn spawn_daemon(dir: &TempDir) -> (PathBuf, ScriptHandle, tokio::task::JoinHandle<()>) {
    let (engine, script) = ScriptedEngine::with_handle();
    let controller = CoreController::new(
        Box::new(engine),
        Arc::new(EventLog::new(50)),
        Arc::new(EventLog::new(50)),
        dir.path().join("logs").join("engine.log"),
        dir.path().join("run").join("engine.json"),
    );
    let settings = DaemonSettings {
        tail_interval_ms: 50,
        quit_grace_ms: 50,
        ..DaemonSettings::default()
    };
    let socket = dir.path().join("daemon.sock");
    let daemon = Daemon::new(socket.clone(), DaemonState::new(controller, settings, "1.2.3"));
    let task = tokio::spawn(async move {
        daemon.run().await.expect("daemon run");
    });
    (socket, script, task)
}

#[tokio::test]
async fn start_tail_and_stop_over_the_socket() {
    let dir = TempDir::new().expect("tempdir");
    let (socket, script, _daemon) = spawn_daemon(&dir);
    script.set_startup_lines([
        "\u{1b}[32mINFO\u{1b}[0m engine booting",
        r#"2024-05-01T10:00:00+00:00 INFO {"time":"2024-05-01T10:00:00+00:00","event":{"PeerAdded":{"peer_id":7}}}"#,
    ]);
    let config = dir.path().join("net.toml");
    std::fs::write(&config, "instance_name = \"test\"\n").expect("config");

    let mut client = Client::connect(&socket).await;

    let version = client.call(1, json!({"op": "version"})).await;
    assert_eq!(version["data"]["version"], "1.2.3");

    let started = client
        .call(
            2,
            json!({"op": "start", "config_path": config, "log_level": "info"}),
        )
        .await;
    assert_eq!(started["ok"], json!(true), "start failed: {started}");
    assert_eq!(script.last_config().as_deref(), Some("instance_name = \"test\"\n"));

    let status = client.call(3, json!({"op": "status"})).await;
    assert_eq!(status["data"], json!({"running": true, "identifier": 4242}));

    let start_time = client.call(4, json!({"op": "start_time"})).await;
    assert!(start_time["data"]["timestamp"].as_f64().expect("timestamp") > 0.0);

    let mut events = Value::Null;
    for attempt in 0..50u64 {
        events = client
            .call(10 + attempt, json!({"op": "recent_events", "since_index": 0}))
            .await;
        if events["data"]["next_index"] == json!(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(events["data"]["next_index"], json!(1), "events: {events}");
    assert_eq!(events["data"]["events"][0]["type"], "PeerAdded");

    let logs = client
        .call(100, json!({"op": "recent_logs", "since_index": 0}))
        .await;
    assert_eq!(logs["data"]["lines"], json!(["INFO engine booting"]));

    let info = client.call(101, json!({"op": "running_info"})).await;
    assert_eq!(info["data"]["json"], r#"{"running":true,"peers":[]}"#);

    // Passed through untouched, even when it is not valid JSON.
    script.set_running_info("{\"peers\": [truncated");
    let info = client.call(104, json!({"op": "running_info"})).await;
    assert_eq!(info["data"]["json"], "{\"peers\": [truncated");

    let stopped = client.call(102, json!({"op": "stop"})).await;
    assert_eq!(stopped["ok"], json!(true));
    assert!(!script.is_running());

    let status = client.call(103, json!({"op": "status"})).await;
    assert_eq!(status["data"], json!({"running": false, "identifier": 0}));
}

#[tokio::test]
async fn start_failure_is_reported_verbatim() {
    let dir = TempDir::new().expect("tempdir");
    let (socket, script, _daemon) = spawn_daemon(&dir);
    script.fail_next_starts(1, "failed to create tun device");
    let config = dir.path().join("net.toml");
    std::fs::write(&config, "").expect("config");

    let mut client = Client::connect(&socket).await;
    let response = client
        .call(
            1,
            json!({"op": "start", "config_path": config, "log_level": "info"}),
        )
        .await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"], "failed to create tun device");
}

#[tokio::test]
async fn malformed_request_gets_error_with_id_zero() {
    let dir = TempDir::new().expect("tempdir");
    let (socket, _script, _daemon) = spawn_daemon(&dir);

    let mut client = Client::connect(&socket).await;
    let response = client.send_raw("{not json").await;
    assert_eq!(response["id"], json!(0));
    assert_eq!(response["ok"], json!(false));

    // The connection survives a bad line.
    let version = client.call(5, json!({"op": "version"})).await;
    assert_eq!(version["ok"], json!(true));
}

#[tokio::test]
async fn quit_stops_engine_and_closes_connections() {
    let dir = TempDir::new().expect("tempdir");
    let (socket, script, daemon) = spawn_daemon(&dir);
    let config = dir.path().join("net.toml");
    std::fs::write(&config, "").expect("config");

    let mut client = Client::connect(&socket).await;
    client
        .call(
            1,
            json!({"op": "start", "config_path": config, "log_level": "info"}),
        )
        .await;
    let ack = client.call(2, json!({"op": "quit"})).await;
    assert_eq!(ack["data"], json!({"quitting": true}));
    assert!(!script.is_running());

    let eof = tokio::time::timeout(Duration::from_secs(5), client.lines.next_line())
        .await
        .expect("connection closes after quit")
        .expect("read");
    assert!(eof.is_none());

    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits")
        .expect("join");
    assert!(!socket.exists());
}
