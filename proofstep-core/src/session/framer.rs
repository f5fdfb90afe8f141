//! Framing of raw prover stdout into prompt-terminated chunks.

use std::sync::OnceLock;

use regex::bytes::Regex;

/// A prompt marker followed by a complete line terminator.
const MARKER_LINE_PATTERN: &str = r"\[\d+\|[^\]\r\n]*\]>[ \t]*\r?\n";

fn marker_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(MARKER_LINE_PATTERN).expect("marker line pattern is a valid regex")
    })
}

/// Accumulates stdout bytes and releases everything up to the last complete
/// marker line.
///
/// Consumers therefore never see a response cut in the middle of a prompt.
#[derive(Debug, Default)]
pub struct OutputFramer {
    buffer: Vec<u8>,
}

impl OutputFramer {
    /// Empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes`; return the framed prefix if a marker line completed.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buffer.extend_from_slice(bytes);
        let end = marker_line_re().find_iter(&self.buffer).last()?.end();
        let framed: Vec<u8> = self.buffer.drain(..end).collect();
        Some(String::from_utf8_lossy(&framed).into_owned())
    }

    /// Release whatever remains, e.g. once the stream has closed.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Bytes held back waiting for a marker line.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}
