//! Registry of live sessions; lifecycle, cleanup, broadcast of OSC-derived
//! events (spec §4.7). Generalizes the teacher's `main_complex.rs`
//! `Sessions = Arc<DashMap<SessionId, SessionState>>` plus its periodic
//! `cleanup_stale_sessions` sweep into the full accept/shutdown contract.

use crate::config::Config;
use crate::dispatch::{default_dispatcher, OscDispatcher, OscHandler};
use crate::pty::SessionId;
use crate::recorder::{MemorySink, Recorder};
use crate::session::SessionHandler;
use crate::ws::{WsFramer, WsFramerConfig};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::info;
use uuid::Uuid;

struct SessionRecord {
    accepted_at: Instant,
    framer: WsFramer,
}

#[derive(Default)]
pub struct ManagerStats {
    pub accepted_total: AtomicU64,
    pub active: AtomicU64,
    pub backpressure_dropped: AtomicU64,
    pub osc_unknown: AtomicU64,
}

/// Process-wide registry of live sessions plus the frozen OSC dispatcher.
pub struct ConnectionManager {
    sessions: DashMap<SessionId, SessionRecord>,
    dispatcher: std::sync::Mutex<Option<OscDispatcher>>,
    dispatcher_frozen: AtomicBool,
    frozen_dispatcher: std::sync::OnceLock<Arc<OscDispatcher>>,
    config: Arc<Config>,
    stats: Arc<ManagerStats>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            dispatcher: std::sync::Mutex::new(Some(default_dispatcher())),
            dispatcher_frozen: AtomicBool::new(false),
            frozen_dispatcher: std::sync::OnceLock::new(),
            config: Arc::new(config),
            stats: Arc::new(ManagerStats::default()),
        })
    }

    /// Register a collaborator's OSC handler. Only allowed before the
    /// first `accept` call (spec §4.7).
    pub fn register_osc(&self, code: u16, handler: OscHandler) {
        if self.dispatcher_frozen.load(Ordering::SeqCst) {
            panic!("cannot register OSC code {code} after the first accept");
        }
        let mut guard = self.dispatcher.lock().expect("dispatcher lock poisoned");
        guard
            .as_mut()
            .expect("dispatcher already frozen")
            .register(code, handler);
    }

    fn freeze_dispatcher(&self) -> Arc<OscDispatcher> {
        self.frozen_dispatcher
            .get_or_init(|| {
                self.dispatcher_frozen.store(true, Ordering::SeqCst);
                let mut guard = self.dispatcher.lock().expect("dispatcher lock poisoned");
                Arc::new(guard.take().expect("dispatcher already frozen"))
            })
            .clone()
    }

    /// Accept an already-upgraded WebSocket, spawn its `SessionHandler`,
    /// and register it for lifecycle tracking.
    pub fn accept(self: &Arc<Self>, stream: WebSocketStream<TcpStream>) -> SessionId {
        let dispatcher = self.freeze_dispatcher();
        let id = Uuid::new_v4();

        let (framer, inbound) = WsFramer::spawn(
            stream,
            WsFramerConfig {
                send_queue_len: self.config.send_queue_len,
                ping_interval: self.config.ping_interval,
                ping_timeout: self.config.ping_timeout,
            },
        );

        self.sessions.insert(
            id,
            SessionRecord {
                accepted_at: Instant::now(),
                framer: framer.clone(),
            },
        );
        self.stats.accepted_total.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let recorder = Recorder::new(MemorySink::new(4096));
        let handler = SessionHandler::new(id, framer, dispatcher, self.config.clone(), recorder);

        let manager = self.clone();
        tokio::spawn(async move {
            handler.run(inbound).await;
            manager.sessions.remove(&id);
            manager.stats.active.fetch_sub(1, Ordering::Relaxed);
            info!(session = %id, "removed from connection manager");
        });

        id
    }

    pub fn by_id(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Point-in-time snapshot of live session ids; never blocks writers.
    pub fn all(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn stats(&self) -> Arc<ManagerStats> {
        self.stats.clone()
    }

    /// Close every live session, waiting up to `grace` for each to finish,
    /// then force-close whatever remains.
    pub async fn shutdown(&self) {
        let framers: Vec<WsFramer> = self
            .sessions
            .iter()
            .map(|e| e.value().framer.clone())
            .collect();
        for framer in &framers {
            framer.close();
        }

        let deadline = Instant::now() + self.config.grace;
        while Instant::now() < deadline && !self.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for framer in &framers {
            framer.close();
        }
        self.sessions.clear();
    }

    pub fn uptime_since(&self, id: SessionId) -> Option<Duration> {
        self.sessions.get(&id).map(|r| r.accepted_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_id_and_all_reflect_empty_registry() {
        let manager = ConnectionManager::new(Config::default());
        assert!(!manager.by_id(Uuid::new_v4()));
        assert!(manager.all().is_empty());
    }

    #[test]
    fn register_osc_before_accept_succeeds() {
        let manager = ConnectionManager::new(Config::default());
        manager.register_osc(4242, std::sync::Arc::new(|_| None));
        let stats = manager.stats();
        assert_eq!(stats.accepted_total.load(Ordering::Relaxed), 0);
    }
}
