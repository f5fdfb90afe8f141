//! In-process stand-in for the prover, used by unit tests.
//!
//! `ScriptedProver` understands just enough of the protocol to drive the
//! orchestrator: every statement advances the sequence id by one and echoes a
//! marker, a statement containing `fail` yields an error without advancing
//! (and the rest of its submission is abandoned), a statement containing
//! `crash` kills the process, and `undo N.` restores sequence id `N`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::prompt::PromptMarker;
use crate::session::{ExitNotice, ProverProcess, SessionEvent, SessionStart};
use crate::statement::statements;

const TAG: &str = "check";

struct ProverState {
    running: bool,
    session_id: Uuid,
    state_id: u64,
    events: VecDeque<(Duration, SessionEvent)>,
    sent: Vec<String>,
    starts: usize,
    reject_undo: bool,
    lazy_startup: bool,
    replies: VecDeque<Vec<(Duration, SessionEvent)>>,
    exits: broadcast::Sender<ExitNotice>,
}

/// Shared handle for inspecting and steering a [`ScriptedProver`].
#[derive(Clone)]
pub struct ProverProbe(Arc<Mutex<ProverState>>);

impl ProverProbe {
    fn lock(&self) -> MutexGuard<'_, ProverState> {
        self.0.lock().unwrap()
    }

    /// Every command sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Undo commands sent, in order.
    pub fn undo_commands(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|c| c.starts_with("undo "))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Number of process starts.
    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn state_id(&self) -> u64 {
        self.lock().state_id
    }

    /// Answer every undo command with an error.
    pub fn reject_undo(&self, reject: bool) {
        self.lock().reject_undo = reject;
    }

    /// Print the startup prompt only after start returns.
    pub fn lazy_startup(&self, lazy: bool) {
        self.lock().lazy_startup = lazy;
    }

    /// Answer the next command with exactly these events.
    pub fn script_reply(&self, events: Vec<(Duration, SessionEvent)>) {
        self.lock().replies.push_back(events);
    }

    /// Kill the process from outside.
    pub fn crash(&self, code: i32) {
        let mut state = self.lock();
        state.running = false;
        state.events.push_back((
            Duration::ZERO,
            SessionEvent::Exited {
                code: Some(code),
                expected: false,
            },
        ));
        let _ = state.exits.send(ExitNotice {
            session_id: state.session_id,
            code: Some(code),
            expected: false,
        });
    }
}

/// Scripted [`ProverProcess`] implementation.
pub struct ScriptedProver {
    probe: ProverProbe,
}

impl ScriptedProver {
    /// A prover that has not been started.
    pub fn new() -> Self {
        let (exits, _) = broadcast::channel(16);
        Self {
            probe: ProverProbe(Arc::new(Mutex::new(ProverState {
                running: false,
                session_id: Uuid::new_v4(),
                state_id: 0,
                events: VecDeque::new(),
                sent: Vec::new(),
                starts: 0,
                reject_undo: false,
                lazy_startup: false,
                replies: VecDeque::new(),
                exits,
            }))),
        }
    }

    /// A prover that is already past its startup prompt.
    pub fn running() -> Self {
        let prover = Self::new();
        prover.probe.lock().running = true;
        prover
    }

    pub fn probe(&self) -> ProverProbe {
        self.probe.clone()
    }
}

fn marker_line(state_id: u64) -> String {
    format!("{}\n", PromptMarker::new(state_id, TAG))
}

fn respond(state: &mut ProverState, text: &str) {
    if let Some(target) = text
        .trim()
        .strip_prefix("undo ")
        .and_then(|rest| rest.trim_end_matches('.').trim().parse::<u64>().ok())
    {
        let reply = if state.reject_undo || target > state.state_id {
            format!("[error-0-0-0-4]cannot undo to {}\n", target)
        } else {
            state.state_id = target;
            String::new()
        };
        let chunk = reply + &marker_line(state.state_id);
        state.events.push_back((Duration::ZERO, SessionEvent::Output(chunk)));
        return;
    }

    let mut chunk = String::new();
    for stmt in statements(text) {
        if stmt.text.contains("crash") {
            state.running = false;
            if !chunk.is_empty() {
                state
                    .events
                    .push_back((Duration::ZERO, SessionEvent::Output(chunk)));
            }
            state.events.push_back((
                Duration::from_millis(1),
                SessionEvent::Exited {
                    code: Some(139),
                    expected: false,
                },
            ));
            let _ = state.exits.send(ExitNotice {
                session_id: state.session_id,
                code: Some(139),
                expected: false,
            });
            return;
        }
        if stmt.text.contains("fail") {
            chunk.push_str(&format!("[error-1-0-1-4]cannot prove: {}\n", stmt.text));
            chunk.push_str(&marker_line(state.state_id));
            break;
        }
        state.state_id += 1;
        chunk.push_str(&format!("+ {}\n", stmt.text));
        chunk.push_str(&marker_line(state.state_id));
    }
    state
        .events
        .push_back((Duration::ZERO, SessionEvent::Output(chunk)));
}

#[async_trait]
impl ProverProcess for ScriptedProver {
    async fn start(&mut self) -> Result<SessionStart> {
        let mut state = self.probe.lock();
        state.running = true;
        state.session_id = Uuid::new_v4();
        state.state_id = 0;
        state.starts += 1;
        state.events.clear();

        let startup_marker = if state.lazy_startup {
            let banner = format!("banner\n{}", marker_line(0));
            state
                .events
                .push_back((Duration::ZERO, SessionEvent::Output(banner)));
            None
        } else {
            Some(PromptMarker::new(0, TAG))
        };
        Ok(SessionStart {
            session_id: state.session_id,
            startup_marker,
            banner: String::new(),
        })
    }

    fn stop(&mut self) {
        let mut state = self.probe.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.events.clear();
        let _ = state.exits.send(ExitNotice {
            session_id: state.session_id,
            code: Some(0),
            expected: true,
        });
    }

    async fn stop_and_wait(&mut self, _timeout: Duration) -> Result<()> {
        self.stop();
        Ok(())
    }

    async fn restart(&mut self) -> Result<SessionStart> {
        self.stop();
        self.start().await
    }

    fn is_running(&mut self) -> bool {
        self.probe.lock().running
    }

    async fn send_command(&mut self, text: &str) -> Result<()> {
        let mut state = self.probe.lock();
        if !state.running {
            return Err(Error::NotRunning);
        }
        state.sent.push(text.to_string());
        if let Some(reply) = state.replies.pop_front() {
            state.events.extend(reply);
        } else {
            respond(&mut state, text);
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        let next = {
            let mut state = self.probe.lock();
            match state.events.pop_front() {
                Some(next) => Some(next),
                None if state.running => None,
                None => return None,
            }
        };
        match next {
            Some((delay, event)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some(event)
            }
            // Nothing more is coming from a live process until the next command.
            None => std::future::pending().await,
        }
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.probe
            .lock()
            .events
            .drain(..)
            .map(|(_, event)| event)
            .collect()
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ExitNotice> {
        self.probe.lock().exits.subscribe()
    }
}
