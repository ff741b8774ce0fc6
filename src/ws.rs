//! WebSocket protocol framing, send/receive queues, and keepalive for one
//! connection (spec §4.4, §6.1). Generalizes the teacher's tagged
//! `ControlMessage` enum (`#[serde(tag = "cmd")]`) to the full wire
//! protocol and adds the bounded send queue and keepalive watchdog the
//! prototype didn't have.

use crate::base64;
use crate::error::WsError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

/// The full client<->server message set from spec §6.1, merged into one
/// tagged enum since both directions share the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "start-session")]
    StartSession {
        cols: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    #[serde(rename = "input")]
    Input {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(rename = "data_b64", skip_serializing_if = "Option::is_none")]
        data_b64: Option<String>,
    },
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
    #[serde(rename = "viewer")]
    Viewer {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        payload: Value,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "session-started")]
    SessionStarted { id: String, cols: u16, rows: u16 },
    #[serde(rename = "output")]
    Output {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(rename = "data_b64", skip_serializing_if = "Option::is_none")]
        data_b64: Option<String>,
    },
    #[serde(rename = "control")]
    Control {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl WsMessage {
    pub fn output_utf8(data: &str) -> Self {
        WsMessage::Output {
            data: Some(data.to_string()),
            data_b64: None,
        }
    }

    /// Build an `output` message from raw bytes, per spec §6.1: `data` when
    /// the bytes are valid UTF-8, `data_b64` otherwise. The debounce buffer
    /// flushes on a byte-count boundary, not a UTF-8 character boundary, so
    /// a chunk can legitimately split a multi-byte character — falling back
    /// to base64 rather than `from_utf8_lossy` avoids corrupting it with
    /// replacement characters.
    pub fn output_bytes(data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) => Self::output_utf8(text),
            Err(_) => WsMessage::Output {
                data: None,
                data_b64: Some(base64::encode(data)),
            },
        }
    }

    fn is_output(&self) -> bool {
        matches!(self, WsMessage::Output { .. })
    }

    /// Append `other`'s payload onto `self` in place, for send-queue
    /// coalescing. Only valid when both are `Output` with UTF-8 `data`.
    fn coalesce(&mut self, other: WsMessage) -> Result<(), WsMessage> {
        match (self, other) {
            (
                WsMessage::Output {
                    data: Some(existing),
                    ..
                },
                WsMessage::Output {
                    data: Some(incoming),
                    data_b64: None,
                },
            ) => {
                existing.push_str(&incoming);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }
}

/// Pure, synchronously-testable queue implementing spec §4.4's overflow
/// policy: `output` coalesces into the last queued output; everything
/// else fails with `BackpressureDropped` once at capacity.
pub struct SendQueue {
    items: VecDeque<WsMessage>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> Vec<WsMessage> {
        self.items.drain(..).collect()
    }

    /// Enqueue `msg`, applying the overflow policy if already at capacity.
    pub fn push(&mut self, msg: WsMessage) -> Result<(), WsError> {
        if self.items.len() < self.capacity {
            self.items.push_back(msg);
            return Ok(());
        }

        if msg.is_output() {
            if let Some(back) = self.items.back_mut() {
                if back.is_output() {
                    if back.coalesce(msg).is_ok() {
                        return Ok(());
                    }
                }
            }
            // No output at the tail to coalesce into: drop the new output
            // chunk rather than corrupt ordering by inserting elsewhere.
            return Err(WsError::BackpressureDropped);
        }

        Err(WsError::BackpressureDropped)
    }
}

/// Handle for sending messages on one WebSocket connection. Cheap to
/// clone; the actual socket write happens on a dedicated writer task.
#[derive(Clone)]
pub struct WsFramer {
    queue: Arc<StdMutex<SendQueue>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    last_frame_at: Arc<StdMutex<Instant>>,
}

pub struct WsFramerConfig {
    pub send_queue_len: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl WsFramer {
    /// Split `stream` and spawn the writer/keepalive task plus the reader
    /// task, returning the framer handle and a channel of inbound
    /// messages. The inbound channel closes when the peer disconnects or
    /// the keepalive watchdog fires.
    pub fn spawn(
        stream: WebSocketStream<TcpStream>,
        cfg: WsFramerConfig,
    ) -> (Self, mpsc::Receiver<WsMessage>) {
        let (mut sink, mut source) = stream.split();
        let queue = Arc::new(StdMutex::new(SendQueue::new(cfg.send_queue_len)));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let last_frame_at = Arc::new(StdMutex::new(Instant::now()));

        let framer = WsFramer {
            queue: queue.clone(),
            notify: notify.clone(),
            closed: closed.clone(),
            last_frame_at: last_frame_at.clone(),
        };

        let (in_tx, in_rx) = mpsc::channel(cfg.send_queue_len);

        // Writer task: drains the send queue and emits periodic pings.
        {
            let queue = queue.clone();
            let notify = notify.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut ping_tick = tokio::time::interval(cfg.ping_interval);
                ping_tick.tick().await; // first tick fires immediately; skip it
                loop {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = ping_tick.tick() => {
                            if sink.send(to_frame(&WsMessage::Ping)).await.is_err() {
                                break;
                            }
                        }
                    }
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let batch = { queue.lock().expect("send queue poisoned").drain() };
                    for msg in batch {
                        if sink.send(to_frame(&msg)).await.is_err() {
                            closed.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                let _ = sink.close().await;
            });
        }

        // Reader task + keepalive watchdog.
        {
            let closed = closed.clone();
            let last_frame_at = last_frame_at.clone();
            let window = cfg.ping_interval + cfg.ping_timeout;
            tokio::spawn(async move {
                loop {
                    let sleep_for = {
                        let last = *last_frame_at.lock().expect("last_frame_at poisoned");
                        window.saturating_sub(last.elapsed())
                    };
                    tokio::select! {
                        frame = source.next() => {
                            match frame {
                                Some(Ok(WsFrame::Text(text))) => {
                                    *last_frame_at.lock().unwrap() = Instant::now();
                                    match serde_json::from_str::<WsMessage>(&text) {
                                        Ok(msg) => {
                                            if in_tx.send(msg).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(_) => {
                                            let _ = in_tx
                                                .send(WsMessage::Error {
                                                    code: "protocol".to_string(),
                                                    message: "malformed frame".to_string(),
                                                })
                                                .await;
                                        }
                                    }
                                }
                                Some(Ok(WsFrame::Ping(_) | WsFrame::Pong(_))) => {
                                    *last_frame_at.lock().unwrap() = Instant::now();
                                }
                                Some(Ok(WsFrame::Close(_))) | None => break,
                                Some(Ok(_)) => {
                                    *last_frame_at.lock().unwrap() = Instant::now();
                                }
                                Some(Err(_)) => break,
                            }
                        }
                        _ = tokio::time::sleep(sleep_for) => {
                            let last = *last_frame_at.lock().unwrap();
                            if last.elapsed() >= window {
                                break;
                            }
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                drop(in_tx);
            });
        }

        (framer, in_rx)
    }

    /// Non-blocking enqueue. Never waits on the socket.
    pub fn send(&self, msg: WsMessage) -> Result<(), WsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WsError::Closed);
        }
        let result = self
            .queue
            .lock()
            .expect("send queue poisoned")
            .push(msg);
        self.notify.notify_one();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

fn to_frame(msg: &WsMessage) -> WsFrame {
    WsFrame::Text(serde_json::to_string(msg).expect("WsMessage always serializes"))
}
