//! Per-connection state machine: handshake, input→PTY, PTY→output,
//! resize, close (spec §4.5). Regroups the teacher's `handle_connection`
//! (reader task / writer task / inline receive loop) into the explicit
//! state machine and three concurrent roles the spec calls for.

use crate::base64;
use crate::config::Config;
use crate::dispatch::OscDispatcher;
use crate::osc::OscScanner;
use crate::pty::{ExitReason, PtySession, SessionId};
use crate::recorder::Recorder;
use crate::ws::{WsFramer, WsMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consecutive malformed frames before the connection is closed (spec §7).
const MAX_CONSECUTIVE_MALFORMED: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum HandlerState {
    Accepted,
    SessionStarting,
    Running,
    Closing,
    Closed,
}

pub struct SessionHandler {
    pub id: SessionId,
    framer: WsFramer,
    dispatcher: Arc<OscDispatcher>,
    config: Arc<Config>,
    recorder: Arc<Recorder>,
}

impl SessionHandler {
    pub fn new(
        id: SessionId,
        framer: WsFramer,
        dispatcher: Arc<OscDispatcher>,
        config: Arc<Config>,
        recorder: Arc<Recorder>,
    ) -> Self {
        Self {
            id,
            framer,
            dispatcher,
            config,
            recorder,
        }
    }

    /// Drive the connection to completion. Consumes inbound messages from
    /// `inbound` until a `start-session` is seen, opens the PTY, then runs
    /// the steady-state pumps until the socket closes or the child exits.
    pub async fn run(self, mut inbound: tokio::sync::mpsc::Receiver<WsMessage>) {
        let mut state = HandlerState::Accepted;
        let mut malformed_streak: u32 = 0;

        let pty = loop {
            let Some(msg) = inbound.recv().await else {
                info!(session = %self.id, "connection closed before session start");
                return;
            };
            match msg {
                WsMessage::StartSession { cols, rows, shell, cwd } => {
                    state = HandlerState::SessionStarting;
                    let shell = shell.unwrap_or_else(|| self.config.default_shell.clone());
                    let cwd = cwd.unwrap_or_else(|| ".".to_string());
                    let env: HashMap<String, String> = HashMap::new();
                    match PtySession::open(
                        cols,
                        rows,
                        &cwd,
                        &shell,
                        &env,
                        self.config.max_buf_bytes,
                        self.config.debounce_window,
                        self.config.idle_flush,
                        self.config.child_kill_grace,
                    ) {
                        Ok(session) => break session,
                        Err(e) => {
                            let _ = self.framer.send(WsMessage::Error {
                                code: "fatal".to_string(),
                                message: format!("failed to start session: {e}"),
                            });
                            warn!(session = %self.id, error = %e, "pty create failed");
                            return;
                        }
                    }
                }
                WsMessage::Ping => {
                    let _ = self.framer.send(WsMessage::Pong);
                }
                _ => {
                    malformed_streak += 1;
                    if malformed_streak >= MAX_CONSECUTIVE_MALFORMED {
                        warn!(session = %self.id, "too many malformed frames before session start");
                        return;
                    }
                }
            }
        };

        let (cols, rows) = pty.dims();
        let _ = self.framer.send(WsMessage::SessionStarted {
            id: self.id.to_string(),
            cols,
            rows,
        });
        self.recorder.start();
        state = HandlerState::Running;
        debug!(session = %self.id, ?state, "session running");

        let mut output_rx = pty
            .take_output()
            .await
            .expect("output stream not yet taken");
        let mut scanner = OscScanner::new(
            self.config.max_osc_payload_bytes,
            self.config.max_osc_partial_bytes,
        );

        let exit_info = loop {
            tokio::select! {
                biased;

                exit = pty.wait_exit() => {
                    break exit;
                }

                chunk = output_rx.recv() => {
                    let Some(chunk) = chunk else { continue };
                    let scan = scanner.feed(&chunk);
                    if !scan.clean.is_empty() {
                        self.recorder.append_output(&scan.clean).await;
                        let _ = self.framer.send(WsMessage::output_bytes(&scan.clean));
                    }
                    for envelope in scan.envelopes {
                        match self.dispatcher.dispatch(&envelope) {
                            Some(event) => {
                                self.recorder.append_viewer(&event).await;
                                let _ = self.framer.send(WsMessage::Viewer {
                                    event: None,
                                    kind: Some(event.kind),
                                    payload: event.payload,
                                });
                            }
                            None => {
                                debug!(session = %self.id, code = envelope.code, "unknown OSC code");
                            }
                        }
                    }
                }

                inbound_msg = inbound.recv() => {
                    let Some(msg) = inbound_msg else {
                        // Peer disconnected (or ConnectionManager::shutdown()
                        // closed the framer): drive the PTY to Terminating
                        // now rather than waiting on wait_exit() first, or an
                        // idle shell would never receive SIGHUP/SIGTERM and
                        // the session would never reach Closed.
                        pty.close().await;
                        break pty.wait_exit().await;
                    };
                    match msg {
                        WsMessage::Input { data, data_b64 } => {
                            let bytes = match (data, data_b64) {
                                (Some(text), _) => text.into_bytes(),
                                (None, Some(b64)) => match base64::decode(&b64) {
                                    Some(bytes) => bytes,
                                    None => {
                                        malformed_streak += 1;
                                        continue;
                                    }
                                },
                                (None, None) => continue,
                            };
                            self.recorder.append_input(&bytes).await;
                            if let Err(e) = pty.write(&bytes) {
                                warn!(session = %self.id, error = %e, "pty write failed");
                            }
                            malformed_streak = 0;
                        }
                        WsMessage::Resize { cols, rows } => {
                            match pty.resize(cols, rows) {
                                Ok(()) => {
                                    self.recorder.append_resize(cols, rows).await;
                                }
                                Err(e) => {
                                    let _ = self.framer.send(WsMessage::Error {
                                        code: "bounds".to_string(),
                                        message: e.to_string(),
                                    });
                                }
                            }
                            malformed_streak = 0;
                        }
                        WsMessage::Viewer { .. } => {
                            // Forwarded to an external collaborator; the
                            // core has no further action to take.
                            malformed_streak = 0;
                        }
                        WsMessage::Ping => {
                            let _ = self.framer.send(WsMessage::Pong);
                            malformed_streak = 0;
                        }
                        WsMessage::Error { .. } => {
                            malformed_streak += 1;
                        }
                        _ => {
                            malformed_streak += 1;
                        }
                    }
                    if malformed_streak >= MAX_CONSECUTIVE_MALFORMED {
                        warn!(session = %self.id, "too many malformed frames, closing");
                        break force_close_exit();
                    }
                }
            }
        };

        // Closing: drain any further buffered output, then announce exit.
        state = HandlerState::Closing;
        pty.close().await;
        while let Ok(Some(chunk)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), output_rx.recv()).await
        {
            let scan = scanner.feed(&chunk);
            if !scan.clean.is_empty() {
                self.recorder.append_output(&scan.clean).await;
                let _ = self.framer.send(WsMessage::output_bytes(&scan.clean));
            }
        }

        let payload = match exit_info.reason {
            ExitReason::Normal => serde_json::json!({
                "exitCode": exit_info.exit_code,
                "signal": exit_info.signal,
            }),
            ExitReason::IoError => serde_json::json!({
                "exitCode": null,
                "signal": null,
                "reason": "io-error",
            }),
            ExitReason::Closed => serde_json::json!({
                "exitCode": null,
                "signal": null,
                "reason": "closed",
            }),
        };
        let _ = self.framer.send(WsMessage::Control {
            event: "session-exit".to_string(),
            payload: Some(payload),
        });
        self.recorder.stop();
        self.framer.close();
        state = HandlerState::Closed;
        info!(session = %self.id, ?state, "session closed");
    }
}

fn force_close_exit() -> crate::pty::ExitInfo {
    crate::pty::ExitInfo {
        reason: ExitReason::IoError,
        exit_code: None,
        signal: None,
    }
}
