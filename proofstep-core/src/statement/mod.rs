//! Statement boundaries over prover source text.
//!
//! ## Components
//!
//! - **scanner**: pure lexical scan for statement terminators
//! - **index**: per-version cache with offset lookups

pub mod index;
pub mod scanner;

pub use index::StatementIndex;
pub use scanner::{find_next_statement, find_previous_statement_end, statements, Statement};
