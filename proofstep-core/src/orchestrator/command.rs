//! One command's round trip: send, count markers, debounce, resolve.
//!
//! A command expecting N markers resolves once N response markers have been
//! counted and no further output arrived during the debounce window. Every
//! new chunk inside the window restarts it. A response segment carrying a
//! prover error settles the command early. Until then the command is bounded
//! by an absolute deadline.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};

use super::types::StepperEvent;
use crate::config::ProtocolSyntax;
use crate::error::{Error, Result};
use crate::prompt::{
    find_markers, strip_markers, PromptCounter, PromptMarker, PromptTally, ResponseSegment,
};
use crate::session::{ProverProcess, SessionEvent};

/// State of the single outstanding command.
#[derive(Debug)]
pub struct PendingCommand {
    expected: usize,
    counter: PromptCounter,
    chunks: Vec<String>,
    debounce: Duration,
    timeout: Duration,
}

impl PendingCommand {
    /// Command expecting `expected` response markers.
    pub fn new(
        expected: usize,
        counter: PromptCounter,
        debounce: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            expected,
            counter,
            chunks: Vec::new(),
            debounce,
            timeout,
        }
    }

    /// Feed one framed chunk.
    pub fn ingest(&mut self, chunk: &str) -> PromptTally {
        self.chunks.push(chunk.to_string());
        self.counter.ingest_chunk(chunk)
    }

    /// Whether every expected response marker has arrived.
    pub fn is_satisfied(&self) -> bool {
        self.counter.tally().response_prompts >= self.expected
    }

    /// Whether a response segment already carries a prover error.
    ///
    /// The prover abandons the rest of a submission after an error, so the
    /// command settles without waiting for the remaining markers.
    pub fn saw_error(&self, protocol: &ProtocolSyntax) -> bool {
        self.counter
            .segments()
            .iter()
            .any(|seg| protocol.error_message(&seg.output).is_some())
    }

    /// Account for leftover output read before the command was sent.
    ///
    /// Markers in leftovers mean the session's startup prompt has already
    /// gone by, so this command must count its first marker.
    fn note_stale(&mut self, chunk: &str) {
        if !find_markers(chunk).is_empty() && !self.counter.observed_any() {
            self.counter = PromptCounter::new();
        }
    }

    fn into_response(self, protocol: &ProtocolSyntax) -> CommandResponse {
        let trailing = self.counter.trailing().to_string();
        let raw = self.chunks.concat();
        let segments = self.counter.into_segments();
        let error = segments
            .iter()
            .enumerate()
            .find_map(|(i, seg)| protocol.error_message(&seg.output).map(|msg| (i, msg)))
            .or_else(|| {
                protocol
                    .error_message(&trailing)
                    .map(|msg| (segments.len(), msg))
            });
        CommandResponse {
            segments,
            raw,
            error,
        }
    }
}

/// Completed command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// One segment per response marker, in order.
    pub segments: Vec<ResponseSegment>,
    /// Every chunk read for this command.
    pub raw: String,
    /// `(segment index, message)` of the first prover error.
    pub error: Option<(usize, String)>,
}

impl CommandResponse {
    /// Response markers, in order.
    pub fn markers(&self) -> Vec<PromptMarker> {
        self.segments.iter().map(|s| s.marker.clone()).collect()
    }

    /// Marker that closed the last response segment.
    pub fn last_marker(&self) -> Option<&PromptMarker> {
        self.segments.last().map(|s| &s.marker)
    }

    /// Whether the prover reported an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The prover's error text, verbatim.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, msg)| msg.as_str())
    }

    /// Text to publish: the erroring segment, else the last one.
    pub fn display_output(&self) -> String {
        let segment = match self.error {
            Some((i, ref msg)) => match self.segments.get(i) {
                Some(seg) => &seg.output,
                None => msg,
            },
            None => match self.segments.last() {
                Some(seg) => &seg.output,
                None => return String::new(),
            },
        };
        strip_markers(segment).trim().to_string()
    }
}

/// Enforces a single outstanding command.
///
/// The in-flight flag survives a dropped exchange and any failure that leaves
/// the prover's position unknown (timeout, exit, broken pipe): the prover may
/// still be computing, so the session must be restarted before reuse.
#[derive(Debug, Default)]
pub struct CommandGate {
    in_flight: bool,
}

impl CommandGate {
    /// Gate with no command outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a command is outstanding or was abandoned mid-flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Forget an abandoned or timed-out command once its session has been
    /// replaced.
    pub fn clear(&mut self) {
        self.in_flight = false;
    }

    /// Send `text` and wait for `pending`'s markers.
    ///
    /// Raw output and stderr are forwarded to `events` as they arrive.
    pub async fn submit<P: ProverProcess + ?Sized>(
        &mut self,
        session: &mut P,
        text: &str,
        mut pending: PendingCommand,
        protocol: &ProtocolSyntax,
        events: &broadcast::Sender<StepperEvent>,
    ) -> Result<CommandResponse> {
        if self.in_flight {
            return Err(Error::CommandInFlight);
        }

        for stale in session.drain_events() {
            match stale {
                SessionEvent::Output(chunk) => {
                    tracing::debug!("Discarding output received between commands");
                    pending.note_stale(&chunk);
                    forward_raw(events, chunk);
                }
                SessionEvent::Stderr(line) => forward_raw(events, line),
                SessionEvent::Exited { code, .. } => return Err(Error::ProcessExited { code }),
            }
        }

        self.in_flight = true;
        match exchange(session, text, &mut pending, protocol, events).await {
            Ok(()) => {
                self.in_flight = false;
                Ok(pending.into_response(protocol))
            }
            Err(err) => {
                // Keep the gate closed while the prover may still be busy.
                if !err.leaves_session_unknown() {
                    self.in_flight = false;
                }
                Err(err)
            }
        }
    }
}

async fn exchange<P: ProverProcess + ?Sized>(
    session: &mut P,
    text: &str,
    pending: &mut PendingCommand,
    protocol: &ProtocolSyntax,
    events: &broadcast::Sender<StepperEvent>,
) -> Result<()> {
    session.send_command(text).await?;

    let deadline = Instant::now() + pending.timeout;
    let mut quiet_until: Option<Instant> = None;

    loop {
        let settle = async move {
            match quiet_until {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            event = session.next_event() => match event {
                Some(SessionEvent::Output(chunk)) => {
                    pending.ingest(&chunk);
                    forward_raw(events, chunk);
                    if pending.is_satisfied() || pending.saw_error(protocol) {
                        quiet_until = Some(Instant::now() + pending.debounce);
                    }
                }
                Some(SessionEvent::Stderr(line)) => forward_raw(events, line),
                Some(SessionEvent::Exited { code, .. }) => {
                    return Err(Error::ProcessExited { code });
                }
                None => return Err(Error::NotRunning),
            },
            _ = settle => return Ok(()),
            _ = sleep_until(deadline), if quiet_until.is_none() => {
                let tally = pending.counter.tally();
                tracing::warn!(
                    expected = pending.expected,
                    received = tally.response_prompts,
                    "Timed out waiting for prompt markers"
                );
                return Err(Error::timeout(pending.timeout.as_millis() as u64));
            }
        }
    }
}

fn forward_raw(events: &broadcast::Sender<StepperEvent>, text: String) {
    let _ = events.send(StepperEvent::RawOutput { text });
}
