//! End-to-end socket tests exercising the literal scenarios from spec §8
//! (S1 simple echo, S2 single-chunk OSC interception) over a real loopback
//! TCP connection and WebSocket handshake.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use termcore::config::Config;
use termcore::manager::ConnectionManager;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

async fn spawn_server() -> (std::sync::Arc<ConnectionManager>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = ConnectionManager::new(Config::default());

    let accept_manager = manager.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let manager = accept_manager.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    manager.accept(ws);
                }
            });
        }
    });

    (manager, format!("ws://{addr}/ws/terminal"))
}

async fn connect(url: &str) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let (ws, _) = connect_async(url).await.expect("client handshake failed");
    ws
}

async fn recv_json(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    timeout: Duration,
) -> Value {
    loop {
        let msg = tokio::time::timeout(timeout, ws.next())
            .await
            .expect("timed out waiting for a server frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server frame must be valid json");
        }
    }
}

/// Collects frames of a given `type` until `pred` is satisfied or the
/// overall deadline elapses, concatenating `output` payloads so debounce
/// batching boundaries don't matter to the assertion.
async fn collect_output_until(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    contains: &str,
    overall: Duration,
) -> String {
    let deadline = tokio::time::Instant::now() + overall;
    let mut acc = String::new();
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = recv_json(ws, remaining).await;
        if frame["type"] == "output" {
            if let Some(data) = frame["data"].as_str() {
                acc.push_str(data);
            }
            if acc.contains(contains) {
                return acc;
            }
        }
    }
    panic!("did not observe {contains:?} in output within {overall:?}, got {acc:?}");
}

#[tokio::test]
async fn s1_simple_echo_reaches_client_and_session_exits_cleanly() {
    let (_manager, url) = spawn_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text(
        serde_json::json!({"type":"start-session","cols":80,"rows":24,"shell":"/bin/sh"})
            .to_string(),
    ))
    .await
    .unwrap();

    let started = recv_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(started["type"], "session-started");

    ws.send(Message::Text(
        serde_json::json!({"type":"input","data":"echo hi\n"}).to_string(),
    ))
    .await
    .unwrap();

    let seen = collect_output_until(&mut ws, "hi\n", Duration::from_secs(5)).await;
    assert!(seen.contains("hi\n"));

    ws.send(Message::Text(
        serde_json::json!({"type":"input","data":"exit\n"}).to_string(),
    ))
    .await
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "never saw session-exit");
        let frame = recv_json(&mut ws, Duration::from_secs(5)).await;
        if frame["type"] == "control" && frame["event"] == "session-exit" {
            break;
        }
    }
}

#[tokio::test]
async fn s2_osc_image_envelope_emits_viewer_and_strips_bytes() {
    let (_manager, url) = spawn_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text(
        serde_json::json!({"type":"start-session","cols":80,"rows":24,"shell":"/bin/sh"})
            .to_string(),
    ))
    .await
    .unwrap();
    let _started = recv_json(&mut ws, Duration::from_secs(5)).await;

    // printf avoids shell interpretation of the escape bytes differing
    // across shells; %b expands \033 and \007.
    let cmd = "printf 'pre\\033]1337;ViewImage=/tmp/a.png\\007post\\n'\n";
    ws.send(Message::Text(
        serde_json::json!({"type":"input","data": cmd}).to_string(),
    ))
    .await
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_viewer = false;
    let mut clean = String::new();
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = recv_json(&mut ws, remaining).await;
        match frame["type"].as_str() {
            Some("output") => {
                if let Some(d) = frame["data"].as_str() {
                    clean.push_str(d);
                }
            }
            Some("viewer") => {
                assert_eq!(frame["kind"], "image");
                assert_eq!(frame["payload"]["path"], "/tmp/a.png");
                saw_viewer = true;
            }
            _ => {}
        }
        if saw_viewer && clean.contains("post") {
            break;
        }
    }

    assert!(saw_viewer, "expected a viewer message for the OSC 1337 envelope");
    assert!(clean.contains("pre"));
    assert!(clean.contains("post"));
    assert!(
        !clean.contains("ViewImage"),
        "envelope bytes must never reach client output: {clean:?}"
    );
}

#[tokio::test]
async fn s5_resize_during_session_is_accepted_without_error() {
    let (_manager, url) = spawn_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text(
        serde_json::json!({"type":"start-session","cols":80,"rows":24,"shell":"/bin/sh"})
            .to_string(),
    ))
    .await
    .unwrap();
    let started = recv_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(started["cols"], 80);

    ws.send(Message::Text(
        serde_json::json!({"type":"resize","cols":120,"rows":40}).to_string(),
    ))
    .await
    .unwrap();

    ws.send(Message::Text(
        serde_json::json!({"type":"input","data":"echo resized\n"}).to_string(),
    ))
    .await
    .unwrap();

    let seen = collect_output_until(&mut ws, "resized\n", Duration::from_secs(5)).await;
    assert!(seen.contains("resized\n"));
}

/// A shell sitting idle (no `exit` sent) never exits on its own; dropping
/// the client side of the socket must still drive the session to Closed
/// and reap the child, rather than leaking it forever.
#[tokio::test]
async fn client_disconnect_reaps_idle_child() {
    let (manager, url) = spawn_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text(
        serde_json::json!({"type":"start-session","cols":80,"rows":24,"shell":"/bin/sh"})
            .to_string(),
    ))
    .await
    .unwrap();
    let _started = recv_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(manager.all().len(), 1);

    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !manager.all().is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        manager.all().is_empty(),
        "session was not removed after client disconnect; idle child likely leaked"
    );
}
