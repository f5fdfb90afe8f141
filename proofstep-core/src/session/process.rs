//! Prover subprocess management over tokio pipes.
//!
//! Three background tasks are spawned per process: a stdout pump that frames
//! output at marker lines, a stderr line pump, and a supervisor that owns the
//! child, waits for it to exit (or kills it on request), and reports the exit
//! both on the session's event queue and on the exit-notice broadcast.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use super::framer::OutputFramer;
use super::{ExitNotice, ProverProcess, SessionEvent, SessionStart};
use crate::config::ProverConfig;
use crate::error::{Error, Result};
use crate::prompt::{find_markers, strip_markers, PromptMarker};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const STDERR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// Handles to one spawned process.
struct RunningProcess {
    session_id: Uuid,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Receiver<ProcessState>,
    kill: Option<oneshot::Sender<()>>,
    stopping: Arc<AtomicBool>,
}

impl RunningProcess {
    /// Mark the exit as self-initiated and close the prover's input.
    fn begin_stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stdin.take();
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    fn has_exited(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Exited(_))
    }
}

async fn wait_exited(state: &mut watch::Receiver<ProcessState>) {
    // A closed channel means the supervisor is gone, i.e. the child is reaped.
    let _ = state
        .wait_for(|s| matches!(s, ProcessState::Exited(_)))
        .await;
}

/// Prover subprocess session.
pub struct ProcessSession {
    config: ProverConfig,
    exits: broadcast::Sender<ExitNotice>,
    running: Option<RunningProcess>,
}

impl ProcessSession {
    /// Create a session; the process is spawned by `start`.
    pub fn new(config: ProverConfig) -> Self {
        let (exits, _) = broadcast::channel(16);
        Self {
            config,
            exits,
            running: None,
        }
    }

    /// Configuration used to spawn the prover.
    pub fn config(&self) -> &ProverConfig {
        &self.config
    }

    /// Identifier of the current process, if one is attached.
    pub fn session_id(&self) -> Option<Uuid> {
        self.running.as_ref().map(|p| p.session_id)
    }

    fn startup_context(&self) -> String {
        format!(
            "program='{}', args={:?}, working_dir='{}'",
            self.config.resolved_program(),
            self.config.args,
            self.config
                .working_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "<inherited>".to_string())
        )
    }

    async fn recv_event(&mut self) -> Option<SessionEvent> {
        self.running.as_mut()?.events.recv().await
    }

    /// Read until the startup marker appears.
    async fn wait_for_startup(&mut self) -> Result<(PromptMarker, String)> {
        let deadline = Instant::now() + self.config.startup_timeout();
        let mut banner = String::new();
        let mut stderr = String::new();

        loop {
            let event = timeout_at(deadline, self.recv_event())
                .await
                .map_err(|_| Error::timeout(self.config.startup_timeout_ms))?;

            match event {
                Some(SessionEvent::Output(text)) => {
                    if let Some(marker) = find_markers(&text).into_iter().next() {
                        banner.push_str(&strip_markers(&text));
                        return Ok((marker, banner));
                    }
                    banner.push_str(&text);
                }
                Some(SessionEvent::Stderr(line)) => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                Some(SessionEvent::Exited { code, .. }) => {
                    return Err(Error::subprocess(format!(
                        "Prover exited before printing its startup prompt ({}, code: {:?}){}",
                        self.startup_context(),
                        code,
                        stderr_detail(&stderr)
                    )));
                }
                None => {
                    return Err(Error::subprocess(format!(
                        "Prover output closed before its startup prompt ({}){}",
                        self.startup_context(),
                        stderr_detail(&stderr)
                    )));
                }
            }
        }
    }
}

fn stderr_detail(stderr: &str) -> String {
    let stderr = stderr.trim();
    let excerpt: String = stderr.chars().take(STDERR_EXCERPT_CHARS).collect();
    if excerpt.is_empty() {
        String::new()
    } else if stderr.chars().count() > STDERR_EXCERPT_CHARS {
        format!("; stderr: {excerpt}...")
    } else {
        format!("; stderr: {excerpt}")
    }
}

#[async_trait]
impl ProverProcess for ProcessSession {
    async fn start(&mut self) -> Result<SessionStart> {
        if self.running.is_some() {
            self.stop();
        }

        let startup_context = self.startup_context();
        let mut cmd = Command::new(self.config.resolved_program());
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::subprocess(format!(
                "Failed to spawn prover subprocess ({startup_context}): {e}"
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::subprocess("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::subprocess("Failed to get stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::subprocess("Failed to get stderr handle"))?;

        let session_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump_stdout(stdout, events_tx.clone(), self.config.verbose));
        tokio::spawn(pump_stderr(stderr, events_tx.clone()));
        tokio::spawn(supervise(
            child,
            kill_rx,
            Supervision {
                session_id,
                stopping: Arc::clone(&stopping),
                events: events_tx,
                state: state_tx,
                exits: self.exits.clone(),
            },
        ));

        tracing::info!(%session_id, "Started prover subprocess ({})", startup_context);

        self.running = Some(RunningProcess {
            session_id,
            stdin: Some(stdin),
            events: events_rx,
            state: state_rx,
            kill: Some(kill_tx),
            stopping,
        });

        if !self.config.await_startup_prompt {
            return Ok(SessionStart {
                session_id,
                startup_marker: None,
                banner: String::new(),
            });
        }

        match self.wait_for_startup().await {
            Ok((marker, banner)) => {
                tracing::debug!(%session_id, %marker, "Prover ready");
                Ok(SessionStart {
                    session_id,
                    startup_marker: Some(marker),
                    banner,
                })
            }
            Err(err) => {
                // Ensure we do not leak a subprocess when startup fails.
                if let Some(mut process) = self.running.take() {
                    process.begin_stop();
                    process.kill();
                }
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        let Some(mut process) = self.running.take() else {
            return;
        };
        process.begin_stop();
        tracing::info!(session_id = %process.session_id, "Stopping prover subprocess");

        let grace = self.config.stop_grace();
        tokio::spawn(async move {
            if timeout(grace, wait_exited(&mut process.state)).await.is_err() {
                tracing::warn!(
                    session_id = %process.session_id,
                    "Prover still running after grace window; killing"
                );
                process.kill();
            }
        });
    }

    async fn stop_and_wait(&mut self, limit: Duration) -> Result<()> {
        let Some(mut process) = self.running.take() else {
            return Ok(());
        };
        process.begin_stop();

        if timeout(limit, wait_exited(&mut process.state)).await.is_ok() {
            tracing::debug!(session_id = %process.session_id, "Prover exited after input closed");
            return Ok(());
        }

        tracing::warn!(
            session_id = %process.session_id,
            "Prover did not exit within {:?}; killing",
            limit
        );
        process.kill();
        timeout(limit, wait_exited(&mut process.state))
            .await
            .map_err(|_| {
                Error::subprocess(format!(
                    "Prover process {} did not exit after kill",
                    process.session_id
                ))
            })
    }

    async fn restart(&mut self) -> Result<SessionStart> {
        let limit = self.config.stop_wait_timeout();
        self.stop_and_wait(limit).await?;
        self.start().await
    }

    fn is_running(&mut self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|p| p.stdin.is_some() && !p.has_exited())
    }

    async fn send_command(&mut self, text: &str) -> Result<()> {
        let verbose = self.config.verbose;
        let process = self.running.as_mut().ok_or(Error::NotRunning)?;
        if process.has_exited() {
            return Err(Error::NotRunning);
        }
        let stdin = process.stdin.as_mut().ok_or(Error::NotRunning)?;

        if verbose {
            tracing::debug!(session_id = %process.session_id, "Prover request: {}", text);
        }

        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| Error::subprocess(format!("Failed to send command to prover: {}", e)))?;
        if !text.ends_with('\n') {
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| Error::subprocess(format!("Failed to send command to prover: {}", e)))?;
        }
        stdin
            .flush()
            .await
            .map_err(|e| Error::subprocess(format!("Failed to flush prover stdin: {}", e)))
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.recv_event().await
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        if let Some(process) = self.running.as_mut() {
            while let Ok(event) = process.events.try_recv() {
                drained.push(event);
            }
        }
        drained
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ExitNotice> {
        self.exits.subscribe()
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if let Some(mut process) = self.running.take() {
            process.begin_stop();
            process.kill();
        }
    }
}

async fn pump_stdout(
    mut stdout: ChildStdout,
    events: mpsc::UnboundedSender<SessionEvent>,
    verbose: bool,
) {
    let mut framer = OutputFramer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(chunk) = framer.push(&buf[..n]) {
                    if verbose {
                        tracing::debug!("Prover output: {}", chunk);
                    }
                    if events.send(SessionEvent::Output(chunk)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read prover stdout: {}", e);
                break;
            }
        }
    }

    if let Some(rest) = framer.flush() {
        let _ = events.send(SessionEvent::Output(rest));
    }
}

async fn pump_stderr(stderr: ChildStderr, events: mpsc::UnboundedSender<SessionEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("Prover stderr: {}", line);
        if events.send(SessionEvent::Stderr(line)).is_err() {
            return;
        }
    }
}

struct Supervision {
    session_id: Uuid,
    stopping: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ProcessState>,
    exits: broadcast::Sender<ExitNotice>,
}

async fn supervise(mut child: Child, mut kill: oneshot::Receiver<()>, ctx: Supervision) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(session_id = %ctx.session_id, "Failed to wait for prover: {}", e);
            None
        }
    };
    let expected = ctx.stopping.load(Ordering::SeqCst);
    if expected {
        tracing::info!(session_id = %ctx.session_id, ?code, "Prover subprocess exited");
    } else {
        tracing::warn!(session_id = %ctx.session_id, ?code, "Prover subprocess exited unexpectedly");
    }

    let _ = ctx.events.send(SessionEvent::Exited { code, expected });
    let _ = ctx.state.send(ProcessState::Exited(code));
    let _ = ctx.exits.send(ExitNotice {
        session_id: ctx.session_id,
        code,
        expected,
    });
}
