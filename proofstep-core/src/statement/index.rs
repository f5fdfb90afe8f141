//! Cached statement boundaries for one document version.

use super::scanner::{statements, Statement};

/// Statements of one `(text, version)` pair.
///
/// Any change to the text length or version triggers a full rescan; there is
/// no incremental patching.
#[derive(Debug, Clone, Default)]
pub struct StatementIndex {
    statements: Vec<Statement>,
    key: Option<(usize, i64)>,
}

impl StatementIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescan `text` unless `(text.len(), version)` is unchanged.
    ///
    /// Returns `true` when a rescan happened.
    pub fn update(&mut self, text: &str, version: i64) -> bool {
        let key = (text.len(), version);
        if self.key == Some(key) {
            return false;
        }
        self.statements = statements(text).collect();
        self.key = Some(key);
        tracing::debug!(
            version,
            statements = self.statements.len(),
            "Rebuilt statement index"
        );
        true
    }

    /// Drop the cached statements.
    pub fn clear(&mut self) {
        self.statements.clear();
        self.key = None;
    }

    /// Number of indexed statements.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Whether the indexed text has no statements.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Indexed statements, in document order.
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Version of the indexed text, if any.
    pub fn version(&self) -> Option<i64> {
        self.key.map(|(_, version)| version)
    }

    /// Resolve a cursor to the statement boundary it selects.
    ///
    /// A cursor inside `[start, end]` of a statement selects that statement's
    /// end; otherwise the end of the nearest preceding statement, or 0.
    pub fn target_end_offset(&self, cursor: usize) -> usize {
        let idx = self.statements.partition_point(|s| s.end_offset < cursor);
        if let Some(stmt) = self.statements.get(idx) {
            if stmt.start_offset <= cursor {
                return stmt.end_offset;
            }
        }
        idx.checked_sub(1)
            .map(|prev| self.statements[prev].end_offset)
            .unwrap_or(0)
    }

    /// Statements ending at or before `offset`.
    pub fn statements_up_to(&self, offset: usize) -> Vec<Statement> {
        self.statements
            .iter()
            .filter(|s| s.end_offset <= offset)
            .cloned()
            .collect()
    }

    /// Statements lying entirely within `[start, end]`.
    pub fn statements_in_range(&self, start: usize, end: usize) -> Vec<Statement> {
        self.statements
            .iter()
            .filter(|s| s.start_offset >= start && s.end_offset <= end)
            .cloned()
            .collect()
    }

    /// Number of statements ending at or before `offset`.
    pub fn count_up_to(&self, offset: usize) -> usize {
        self.statements.partition_point(|s| s.end_offset <= offset)
    }

    /// First statement starting at or after `offset`.
    pub fn next_statement(&self, offset: usize) -> Option<&Statement> {
        let idx = self.statements.partition_point(|s| s.start_offset < offset);
        self.statements.get(idx)
    }

    /// End of the last statement ending strictly before `offset`, or 0.
    pub fn previous_end(&self, offset: usize) -> usize {
        let idx = self.statements.partition_point(|s| s.end_offset < offset);
        idx.checked_sub(1)
            .map(|prev| self.statements[prev].end_offset)
            .unwrap_or(0)
    }
}
