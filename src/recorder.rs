//! Session recorder: a bounded, timestamped event log tapped off the I/O
//! pump with near-zero overhead (spec §4.6).

use crate::base64;
use crate::dispatch::ViewerEvent;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub type RecordingId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum RecordingEventKind {
    #[serde(rename = "o")]
    Output { d: String },
    #[serde(rename = "i")]
    Input { d: String },
    #[serde(rename = "r")]
    Resize { cols: u16, rows: u16 },
    #[serde(rename = "v")]
    Viewer { kind: String, payload: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub dt: u32,
    #[serde(flatten)]
    pub kind: RecordingEventKind,
}

/// Serialized recording document (spec §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub version: u32,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "startWall")]
    pub start_wall: String,
    pub events: Vec<RecordingEvent>,
}

impl Recording {
    pub fn new(cols: u16, rows: u16, start_wall: impl Into<String>, events: Vec<RecordingEvent>) -> Self {
        Self {
            version: 1,
            cols,
            rows,
            start_wall: start_wall.into(),
            events,
        }
    }

    /// Reconstruct the client-visible `output` byte stream by concatenating
    /// every `Output` event's payload in order, ignoring `dt` entirely —
    /// the "round-trip law" of spec §4.6/§8: this must equal the `output`
    /// bytes the session actually delivered to the client.
    pub fn replay_output_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for event in &self.events {
            if let RecordingEventKind::Output { d } = &event.kind {
                if let Some(bytes) = base64::decode(d) {
                    out.extend_from_slice(&bytes);
                }
            }
        }
        out
    }
}

/// Where recorded events end up. `append` must never block the caller for
/// long; disk-backed sinks do their blocking I/O on a dedicated task fed
/// through a bounded channel (spec §9's "I/O off the hot path" rule).
pub trait RecordingSink: Send + Sync {
    fn write(&self, event: &RecordingEvent);
    fn flush(&self) {}
}

/// Default sink: a bounded in-memory ring, oldest events dropped first.
pub struct MemorySink {
    events: Mutex<VecDeque<RecordingEvent>>,
    cap: usize,
}

impl MemorySink {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
        })
    }

    pub async fn snapshot(&self) -> Vec<RecordingEvent> {
        self.events.lock().await.iter().cloned().collect()
    }
}

impl RecordingSink for MemorySink {
    fn write(&self, event: &RecordingEvent) {
        if let Ok(mut guard) = self.events.try_lock() {
            if guard.len() >= self.cap {
                guard.pop_front();
            }
            guard.push_back(event.clone());
        }
        // If the lock is contended, this write is lossy by design: the
        // ring is advisory history, not an audit log.
    }
}

/// Append-only JSONL sink: the caller pushes onto a bounded channel and a
/// dedicated task performs the actual (potentially blocking) write.
pub struct ChannelSink {
    tx: mpsc::Sender<RecordingEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Spawn the background writer task and return the sink handle plus a
    /// dropped-event counter shared with it.
    pub fn spawn<W>(queue_len: usize, mut writer: W) -> Arc<Self>
    where
        W: FnMut(&RecordingEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(queue_len);
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                writer(&event);
            }
        });
        Arc::new(Self { tx, dropped })
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordingSink for ChannelSink {
    fn write(&self, event: &RecordingEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-session recorder. `start`/`stop` are idempotent.
pub struct Recorder {
    id: RecordingId,
    start_instant: Instant,
    last_event_at: Mutex<Instant>,
    sink: Arc<dyn RecordingSink>,
    started: std::sync::atomic::AtomicBool,
    stopped: std::sync::atomic::AtomicBool,
}

impl Recorder {
    pub fn new(sink: Arc<dyn RecordingSink>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: Uuid::new_v4(),
            start_instant: now,
            last_event_at: Mutex::new(now),
            sink,
            started: std::sync::atomic::AtomicBool::new(false),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> RecordingId {
        self.id
    }

    /// Attach to the session; idempotent, returns the same id every call.
    pub fn start(&self) -> RecordingId {
        self.started.store(true, Ordering::SeqCst);
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn delta_ms(&self) -> u32 {
        let now = Instant::now();
        let mut last = self.last_event_at.lock().await;
        let dt = now.duration_since(*last).as_millis().min(u32::MAX as u128) as u32;
        *last = now;
        dt
    }

    pub async fn append_output(&self, data: &[u8]) {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let dt = self.delta_ms().await;
        self.sink.write(&RecordingEvent {
            dt,
            kind: RecordingEventKind::Output {
                d: base64::encode(data),
            },
        });
    }

    pub async fn append_input(&self, data: &[u8]) {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let dt = self.delta_ms().await;
        self.sink.write(&RecordingEvent {
            dt,
            kind: RecordingEventKind::Input {
                d: base64::encode(data),
            },
        });
    }

    pub async fn append_resize(&self, cols: u16, rows: u16) {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let dt = self.delta_ms().await;
        self.sink.write(&RecordingEvent {
            dt,
            kind: RecordingEventKind::Resize { cols, rows },
        });
    }

    pub async fn append_viewer(&self, event: &ViewerEvent) {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let dt = self.delta_ms().await;
        self.sink.write(&RecordingEvent {
            dt,
            kind: RecordingEventKind::Viewer {
                kind: event.kind.clone(),
                payload: event.payload.clone(),
            },
        });
    }

    /// Idempotent; flushes the sink and marks the recorder stopped.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.sink.flush();
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_instant.elapsed()
    }
}
