//! Owns one child process and its PTY master; runs the output debouncer
//! (spec §4.1). Generalizes `pty-sidecar`'s `PtySession` (open/resize/Drop)
//! into the full read-pump-with-debounce state machine.

use crate::error::PtyError;
use bytes::BytesMut;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

pub type SessionId = Uuid;

/// The four monotonic lifecycle states from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtyState {
    Starting = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

impl PtyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PtyState::Starting,
            1 => PtyState::Running,
            2 => PtyState::Terminating,
            _ => PtyState::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    IoError,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub reason: ExitReason,
    pub exit_code: Option<u32>,
    pub signal: Option<i32>,
}

/// Minimum/maximum terminal dimensions (spec §3).
pub const MIN_COLS: u16 = 20;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 200;

fn check_bounds(cols: u16, rows: u16) -> Result<(), PtyError> {
    if !(MIN_COLS..=MAX_COLS).contains(&cols) || !(MIN_ROWS..=MAX_ROWS).contains(&rows) {
        return Err(PtyError::Bounds { cols, rows });
    }
    Ok(())
}

enum RawEvent {
    Chunk(Vec<u8>),
    Eof,
    Error(std::io::Error),
}

struct DebounceConfig {
    max_buf: usize,
    debounce_window: Duration,
    idle_flush: Duration,
    child_kill_grace: Duration,
}

/// One child process + PTY master, exclusively owned by a SessionHandler.
pub struct PtySession {
    pub id: SessionId,
    cols: AtomicU16,
    rows: AtomicU16,
    pub cwd: String,
    pub shell: String,
    state: AtomicU8,
    master: Arc<std::sync::Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    output_rx: AsyncMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    exit_rx: AsyncMutex<Option<oneshot::Receiver<ExitInfo>>>,
    close_tx: AsyncMutex<Option<oneshot::Sender<()>>>,
}

impl PtySession {
    /// Fork the child under a new PTY with the given window size and
    /// working directory, and install the standard environment.
    pub fn open(
        cols: u16,
        rows: u16,
        cwd: &str,
        shell: &str,
        env: &HashMap<String, String>,
        max_buf: usize,
        debounce_window: Duration,
        idle_flush: Duration,
        child_kill_grace: Duration,
    ) -> Result<Self, PtyError> {
        check_bounds(cols, rows)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Create(anyhow::anyhow!(e)))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Create(anyhow::anyhow!(e)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Create(anyhow::anyhow!(e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Create(anyhow::anyhow!(e)))?;

        let master: Arc<std::sync::Mutex<Box<dyn MasterPty + Send>>> =
            Arc::new(std::sync::Mutex::new(pair.master));
        let writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>> =
            Arc::new(std::sync::Mutex::new(writer));

        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(64);
        spawn_reader_thread(reader, raw_tx);

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
        let (close_tx, close_rx) = oneshot::channel::<()>();

        let cfg = DebounceConfig {
            max_buf,
            debounce_window,
            idle_flush,
            child_kill_grace,
        };
        tokio::spawn(debounce_pump(raw_rx, out_tx, exit_tx, close_rx, cfg, child));

        Ok(Self {
            id: Uuid::new_v4(),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            cwd: cwd.to_string(),
            shell: shell.to_string(),
            state: AtomicU8::new(PtyState::Running as u8),
            master,
            writer,
            output_rx: AsyncMutex::new(Some(out_rx)),
            exit_rx: AsyncMutex::new(Some(exit_rx)),
            close_tx: AsyncMutex::new(Some(close_tx)),
        })
    }

    pub fn state(&self) -> PtyState {
        PtyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::SeqCst), self.rows.load(Ordering::SeqCst))
    }

    /// Enqueue bytes to the PTY master. Safe to call concurrently with the
    /// output pump.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if self.state() != PtyState::Running {
            return Err(PtyError::Closed);
        }
        let mut w = self.writer.lock().expect("pty writer lock poisoned");
        w.write_all(bytes)?;
        w.flush()?;
        Ok(())
    }

    /// Update the PTY window dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.state() != PtyState::Running {
            return Err(PtyError::Closed);
        }
        check_bounds(cols, rows)?;
        let m = self.master.lock().expect("pty master lock poisoned");
        m.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        drop(m);
        self.cols.store(cols, Ordering::SeqCst);
        self.rows.store(rows, Ordering::SeqCst);
        Ok(())
    }

    /// Take the single-consumer output stream. Returns `None` if already
    /// taken (not restartable).
    pub async fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().await.take()
    }

    /// Transition to Terminating and signal the debounce pump to begin
    /// shutdown; the pump performs the cleanup flush and kills the child.
    pub async fn close(&self) {
        let prev = self
            .state
            .swap(PtyState::Terminating as u8, Ordering::SeqCst);
        if PtyState::from_u8(prev) == PtyState::Terminated {
            self.state.store(PtyState::Terminated as u8, Ordering::SeqCst);
            return;
        }
        if let Some(tx) = self.close_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Completes once the session reaches Terminated, returning exit info.
    pub async fn wait_exit(&self) -> ExitInfo {
        let rx = self.exit_rx.lock().await.take();
        let info = match rx {
            Some(rx) => rx.await.unwrap_or(ExitInfo {
                reason: ExitReason::Closed,
                exit_code: None,
                signal: None,
            }),
            None => ExitInfo {
                reason: ExitReason::Closed,
                exit_code: None,
                signal: None,
            },
        };
        self.state.store(PtyState::Terminated as u8, Ordering::SeqCst);
        info
    }
}

fn spawn_reader_thread(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<RawEvent>) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(RawEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(RawEvent::Chunk(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(RawEvent::Error(e));
                    break;
                }
            }
        }
    });
}

/// The debounce algorithm from spec §4.1: size, idle, and deadline flush
/// triggers evaluated in that order around a channel of raw PTY reads.
async fn debounce_pump(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    out_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: oneshot::Sender<ExitInfo>,
    mut close_rx: oneshot::Receiver<()>,
    cfg: DebounceConfig,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
) {
    let mut buffer = BytesMut::new();
    let mut deadline: Option<Instant> = None;
    let exit_info;

    macro_rules! flush {
        () => {
            if !buffer.is_empty() {
                let chunk = buffer.split().freeze().to_vec();
                let _ = out_tx.send(chunk).await;
                deadline = None;
            }
        };
    }

    loop {
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                flush!();
            }
        }

        let wait: Option<Duration> = if buffer.is_empty() {
            None
        } else {
            let until_deadline = deadline.map(|dl| dl.saturating_duration_since(Instant::now()));
            Some(match until_deadline {
                Some(d) => d.min(cfg.idle_flush),
                None => cfg.idle_flush,
            })
        };

        tokio::select! {
            biased;
            _ = &mut close_rx => {
                flush!();
                exit_info = exit_info_from_kill(&mut child, ExitReason::Closed, cfg.child_kill_grace).await;
                break;
            }
            recv = recv_with_optional_timeout(&mut raw_rx, wait) => {
                match recv {
                    TimedRecv::Value(Some(RawEvent::Chunk(chunk))) => {
                        if buffer.len() + chunk.len() > cfg.max_buf {
                            flush!();
                        }
                        if buffer.is_empty() {
                            deadline = Some(Instant::now() + cfg.debounce_window);
                        }
                        buffer.extend_from_slice(&chunk);
                        if buffer.len() >= cfg.max_buf {
                            flush!();
                        }
                    }
                    TimedRecv::Value(Some(RawEvent::Eof)) => {
                        flush!();
                        exit_info = exit_info_from_wait(&mut child, ExitReason::Normal);
                        break;
                    }
                    TimedRecv::Value(Some(RawEvent::Error(_))) => {
                        flush!();
                        exit_info = exit_info_from_kill(&mut child, ExitReason::IoError, cfg.child_kill_grace).await;
                        break;
                    }
                    TimedRecv::Value(None) => {
                        flush!();
                        exit_info = exit_info_from_kill(&mut child, ExitReason::Closed, cfg.child_kill_grace).await;
                        break;
                    }
                    TimedRecv::TimedOut => {
                        flush!();
                    }
                }
            }
        }
    }

    let _ = exit_tx.send(exit_info);
}

/// The PTY master hit EOF, meaning the child has already exited (or is
/// about to). Reap it with `wait` to recover the real exit code.
fn exit_info_from_wait(
    child: &mut Box<dyn portable_pty::Child + Send + Sync>,
    reason: ExitReason,
) -> ExitInfo {
    match child.wait() {
        Ok(status) => ExitInfo {
            reason,
            exit_code: Some(status.exit_code()),
            signal: None,
        },
        Err(_) => ExitInfo {
            reason,
            exit_code: None,
            signal: None,
        },
    }
}

/// Close/error paths: the child may still be running. Request termination,
/// give it up to `grace` to exit on its own (polling `try_wait`), then
/// escalate to a second, blocking kill if it hasn't (spec §4.1/§5's
/// terminate-then-force-kill-after-grace shape).
async fn exit_info_from_kill(
    child: &mut Box<dyn portable_pty::Child + Send + Sync>,
    reason: ExitReason,
    grace: Duration,
) -> ExitInfo {
    let _ = child.kill();

    let poll_interval = Duration::from_millis(20).min(grace);
    let deadline = Instant::now() + grace;
    let mut status = None;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(s)) => {
                status = Some(s);
                break;
            }
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(_) => break,
        }
    }

    if status.is_none() {
        let _ = child.kill();
        status = child.wait().ok();
    }

    ExitInfo {
        reason,
        exit_code: status.map(|s| s.exit_code()),
        signal: None,
    }
}

enum TimedRecv {
    Value(Option<RawEvent>),
    TimedOut,
}

async fn recv_with_optional_timeout(
    rx: &mut mpsc::Receiver<RawEvent>,
    wait: Option<Duration>,
) -> TimedRecv {
    match wait {
        None => TimedRecv::Value(rx.recv().await),
        Some(dur) => match tokio::time::timeout(dur, rx.recv()).await {
            Ok(v) => TimedRecv::Value(v),
            Err(_) => TimedRecv::TimedOut,
        },
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dims", &self.dims())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_reject_out_of_range() {
        assert!(check_bounds(10, 24).is_err());
        assert!(check_bounds(80, 1).is_err());
        assert!(check_bounds(80, 24).is_ok());
        assert!(check_bounds(MIN_COLS, MIN_ROWS).is_ok());
        assert!(check_bounds(MAX_COLS, MAX_ROWS).is_ok());
    }

    #[tokio::test]
    async fn open_echo_shell_produces_output() {
        let env = HashMap::new();
        let session = PtySession::open(
            80,
            24,
            ".",
            "/bin/sh",
            &env,
            4096,
            Duration::from_millis(100),
            Duration::from_millis(25),
            Duration::from_secs(3),
        )
        .expect("pty open should succeed in test environment");

        session.write(b"echo hi\n").unwrap();

        let mut rx = session.take_output().await.unwrap();
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                seen.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&seen).contains("hi") {
                    break;
                }
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("hi"));
        session.close().await;
        let info = session.wait_exit().await;
        assert_eq!(session.state(), PtyState::Terminated);
        let _ = info;
    }

    /// A short-lived real child (rather than a hand-mocked `Child` trait
    /// object) so the debounce pump's reap-on-exit path has something
    /// genuine to kill/wait on.
    fn spawn_test_child() -> Box<dyn portable_pty::Child + Send + Sync> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .expect("openpty should succeed in test environment");
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg("sleep 30");
        let child = pair
            .slave
            .spawn_command(cmd)
            .expect("spawn should succeed in test environment");
        drop(pair.slave);
        child
    }

    #[tokio::test]
    async fn debounce_batches_rapid_chunks() {
        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, _exit_rx) = oneshot::channel::<ExitInfo>();
        let (_close_tx, close_rx) = oneshot::channel::<()>();

        let cfg = DebounceConfig {
            max_buf: 4096,
            debounce_window: Duration::from_millis(100),
            idle_flush: Duration::from_millis(25),
            child_kill_grace: Duration::from_secs(3),
        };

        tokio::spawn(debounce_pump(raw_rx, out_tx, exit_tx, close_rx, cfg, spawn_test_child()));

        for _ in 0..50 {
            raw_tx.send(RawEvent::Chunk(b"x".to_vec())).await.unwrap();
        }
        drop(raw_tx);

        let mut flushes = 0;
        let mut total = 0usize;
        while let Some(chunk) = out_rx.recv().await {
            flushes += 1;
            total += chunk.len();
        }
        assert_eq!(total, 50);
        assert!(flushes <= 3, "expected heavy batching, got {flushes} flushes");
    }

    #[tokio::test]
    async fn size_trigger_flushes_before_exceeding_max_buf() {
        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, _exit_rx) = oneshot::channel::<ExitInfo>();
        let (_close_tx, close_rx) = oneshot::channel::<()>();

        let cfg = DebounceConfig {
            max_buf: 16,
            debounce_window: Duration::from_secs(10),
            idle_flush: Duration::from_secs(10),
            child_kill_grace: Duration::from_secs(3),
        };
        tokio::spawn(debounce_pump(raw_rx, out_tx, exit_tx, close_rx, cfg, spawn_test_child()));

        raw_tx.send(RawEvent::Chunk(vec![b'a'; 10])).await.unwrap();
        raw_tx.send(RawEvent::Chunk(vec![b'b'; 10])).await.unwrap();
        drop(raw_tx);

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 10);
        let second = out_rx.recv().await.unwrap();
        assert_eq!(second.len(), 10);
    }
}
