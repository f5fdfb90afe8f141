//! Lexical statement boundary detection.
//!
//! A statement ends at a period that is outside any string literal or
//! (nestable) `(* ... *)` comment, is not the decimal point of a numeric
//! literal, and is followed by whitespace, end of input, or a comment opener.
//! Qualified names (`Module.ident`) and projections (`r.field`) therefore
//! never terminate a statement.
//!
//! `//` has no special meaning in this grammar and is scanned as plain text.
//!
//! Scanning never fails: unterminated comments or strings simply yield no
//! further statements.

use serde::{Deserialize, Serialize};

/// A maximal terminated unit of source text.
///
/// Offsets are byte offsets; `end_offset` is one past the terminating period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Source text from the first significant character to the period.
    pub text: String,
    /// Offset of the first non-whitespace, non-comment byte.
    pub start_offset: usize,
    /// Offset just past the terminating period.
    pub end_offset: usize,
}

impl Statement {
    /// Whether `offset` lies within `[start_offset, end_offset]`.
    pub fn contains(&self, offset: usize) -> bool {
        self.start_offset <= offset && offset <= self.end_offset
    }
}

/// Find the first statement that starts at or after `from`.
pub fn find_next_statement(text: &str, from: usize) -> Option<Statement> {
    let mut from = from;
    while from < text.len() && !text.is_char_boundary(from) {
        from += 1;
    }
    if from >= text.len() {
        return None;
    }

    let bytes = text.as_bytes();
    let mut i = from;
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut start: Option<usize> = None;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            match b {
                b'\\' => i += 2,
                b'"' => {
                    in_string = false;
                    i += 1;
                }
                _ => i += 1,
            }
            continue;
        }

        if depth > 0 {
            if opens_comment(bytes, i) {
                depth += 1;
                i += 2;
            } else if closes_comment(bytes, i) {
                depth = depth.saturating_sub(1);
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        if opens_comment(bytes, i) {
            depth = 1;
            i += 2;
            continue;
        }

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let begin = *start.get_or_insert(i);

        if b == b'"' {
            in_string = true;
        } else if b == b'.' && is_terminator(bytes, i) {
            let end = i + 1;
            return Some(Statement {
                text: text[begin..end].to_string(),
                start_offset: begin,
                end_offset: end,
            });
        }
        i += 1;
    }

    None
}

/// End offset of the last statement that ends strictly before `before`.
///
/// Recomputed by forward scanning from the start of the text.
pub fn find_previous_statement_end(text: &str, before: usize) -> Option<usize> {
    statements(text)
        .map(|s| s.end_offset)
        .take_while(|&end| end < before)
        .last()
}

/// Iterate over every statement in `text`, in order.
pub fn statements(text: &str) -> Statements<'_> {
    Statements { text, cursor: 0 }
}

/// Iterator over the statements of a text.
#[derive(Debug, Clone)]
pub struct Statements<'a> {
    text: &'a str,
    cursor: usize,
}

impl Iterator for Statements<'_> {
    type Item = Statement;

    fn next(&mut self) -> Option<Self::Item> {
        let statement = find_next_statement(self.text, self.cursor)?;
        self.cursor = statement.end_offset;
        Some(statement)
    }
}

fn opens_comment(bytes: &[u8], i: usize) -> bool {
    bytes.get(i) == Some(&b'(') && bytes.get(i + 1) == Some(&b'*')
}

fn closes_comment(bytes: &[u8], i: usize) -> bool {
    bytes.get(i) == Some(&b'*') && bytes.get(i + 1) == Some(&b')')
}

fn is_terminator(bytes: &[u8], i: usize) -> bool {
    let prev_digit = i > 0 && bytes[i - 1].is_ascii_digit();
    match bytes.get(i + 1) {
        None => true,
        Some(next) if next.is_ascii_digit() && prev_digit => false,
        Some(next) if next.is_ascii_whitespace() => true,
        Some(_) => opens_comment(bytes, i + 1),
    }
}
