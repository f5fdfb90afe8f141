//! Prompt marker parsing and per-command response counting.
//!
//! The prover prints `[<sequenceId>|<modeTag>]>` after each processed
//! statement. Markers are the only reply framing the protocol offers: a
//! command submitting N statements is complete once N response markers have
//! been observed.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Regex source for one prompt marker.
pub const MARKER_PATTERN: &str = r"\[(\d+)\|([^\]\r\n]*)\]>";

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(MARKER_PATTERN).expect("marker pattern is a valid regex"))
}

/// A parsed prompt marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMarker {
    /// The prover's state-stack position after the command.
    pub sequence_id: u64,
    /// Mode tag (e.g. `check`).
    pub mode_tag: String,
}

impl PromptMarker {
    /// Marker with the given sequence id and mode tag.
    pub fn new(sequence_id: u64, mode_tag: impl Into<String>) -> Self {
        Self {
            sequence_id,
            mode_tag: mode_tag.into(),
        }
    }
}

impl std::fmt::Display for PromptMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}|{}]>", self.sequence_id, self.mode_tag)
    }
}

/// Parse every marker in `text`, in order.
///
/// Sequence ids that overflow `u64` are skipped.
pub fn find_markers(text: &str) -> Vec<PromptMarker> {
    marker_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let id = caps.get(1)?.as_str().parse().ok()?;
            Some(PromptMarker::new(id, caps.get(2)?.as_str()))
        })
        .collect()
}

/// Remove all markers from `text`.
pub fn strip_markers(text: &str) -> String {
    marker_re().replace_all(text, "").into_owned()
}

/// Output the prover produced for one statement, ending at its marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSegment {
    /// Text between the previous marker and this one.
    pub output: String,
    /// The marker closing this response.
    pub marker: PromptMarker,
}

/// Running counts after ingesting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTally {
    /// Response markers counted so far for this command.
    pub response_prompts: usize,
    /// All markers seen so far, including an ignored startup marker.
    pub total_prompts: usize,
}

/// Incremental marker counter for one logical command.
///
/// State persists across `ingest_chunk` calls, so markers and text split
/// over several reads are accounted for once.
#[derive(Debug, Clone)]
pub struct PromptCounter {
    /// Initial sequence id, if no marker has been seen in the session yet.
    startup_id: Option<u64>,
    ignored_startup_prompt: bool,
    total_response_prompts: usize,
    all_prompt_numbers: Vec<u64>,
    segments: Vec<ResponseSegment>,
    carry: String,
}

impl PromptCounter {
    /// Counter for a command in a session that has already shown a marker.
    pub fn new() -> Self {
        Self {
            startup_id: None,
            ignored_startup_prompt: false,
            total_response_prompts: 0,
            all_prompt_numbers: Vec::new(),
            segments: Vec::new(),
            carry: String::new(),
        }
    }

    /// Counter for the first command of a session whose startup marker has
    /// not been observed yet.
    ///
    /// The first marker this counter sees is discarded if its sequence id
    /// equals `initial_id`.
    pub fn awaiting_startup(initial_id: u64) -> Self {
        Self {
            startup_id: Some(initial_id),
            ..Self::new()
        }
    }

    /// Feed a chunk of output.
    pub fn ingest_chunk(&mut self, raw: &str) -> PromptTally {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(raw);

        let mut last_end = 0;
        for caps in marker_re().captures_iter(&text) {
            let (Some(whole), Some(id), Some(tag)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let preceding = &text[last_end..whole.start()];
            last_end = whole.end();

            let Ok(sequence_id) = id.as_str().parse::<u64>() else {
                tracing::warn!(marker = whole.as_str(), "Ignoring marker with oversized id");
                continue;
            };
            self.all_prompt_numbers.push(sequence_id);

            let first_in_session = self.startup_id.take();
            if first_in_session == Some(sequence_id) {
                self.ignored_startup_prompt = true;
                continue;
            }

            self.total_response_prompts += 1;
            self.segments.push(ResponseSegment {
                output: preceding.trim_matches(&['\r', '\n'][..]).to_string(),
                marker: PromptMarker::new(sequence_id, tag.as_str()),
            });
        }
        self.carry = text[last_end..].to_string();

        self.tally()
    }

    /// Counts seen so far.
    pub fn tally(&self) -> PromptTally {
        PromptTally {
            response_prompts: self.total_response_prompts,
            total_prompts: self.all_prompt_numbers.len(),
        }
    }

    /// Whether the session startup marker was seen and discarded.
    pub fn ignored_startup_prompt(&self) -> bool {
        self.ignored_startup_prompt
    }

    /// Whether any marker at all has been observed.
    pub fn observed_any(&self) -> bool {
        !self.all_prompt_numbers.is_empty()
    }

    /// Every sequence id seen, in order.
    pub fn all_prompt_numbers(&self) -> &[u64] {
        &self.all_prompt_numbers
    }

    /// Response segments seen so far, in order.
    pub fn segments(&self) -> &[ResponseSegment] {
        &self.segments
    }

    /// Output after the last marker.
    pub fn trailing(&self) -> &str {
        &self.carry
    }

    /// Consume the counter, returning the response segments.
    pub fn into_segments(self) -> Vec<ResponseSegment> {
        self.segments
    }
}

impl Default for PromptCounter {
    fn default() -> Self {
        Self::new()
    }
}
