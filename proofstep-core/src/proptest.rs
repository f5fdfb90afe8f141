//! Property-based tests for the stepping protocol using proptest.
//!
//! These tests check the invariants the orchestrator relies on:
//!
//! - The undo tracker maps every executed statement to the state before it
//! - Any sequence-id violation disables the tracker until it is reset
//! - Statement scanning is insensitive to separators, comments and
//!   qualified names
//! - Prompt counting does not depend on where output is split into chunks

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::prompt::{PromptCounter, PromptMarker};
    use crate::statement::{find_previous_statement_end, statements, StatementIndex};
    use crate::undo::UndoStateTracker;

    // Strictly increasing sequence ids, occasionally skipping.
    fn increasing_ids() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(1u64..4, 1..30).prop_map(|steps| {
            steps
                .into_iter()
                .scan(0u64, |id, step| {
                    *id += step;
                    Some(*id)
                })
                .collect()
        })
    }

    fn executed(ids: &[u64]) -> UndoStateTracker {
        let mut tracker = UndoStateTracker::new();
        for (i, id) in ids.iter().enumerate() {
            tracker.before_statement_send(i);
            tracker.after_statement_processed(i, &PromptMarker::new(*id, "check"));
        }
        tracker
    }

    fn pre_states(ids: &[u64]) -> Vec<u64> {
        std::iter::once(0).chain(ids.iter().copied()).take(ids.len()).collect()
    }

    // =========================================================================
    // Undo Tracker Properties
    // =========================================================================

    proptest! {
        /// Every executed statement's undo target is the state before it.
        #[test]
        fn undo_target_is_pre_state(ids in increasing_ids()) {
            let tracker = executed(&ids);
            prop_assert!(tracker.is_valid());
            prop_assert_eq!(tracker.current_state_id(), *ids.last().unwrap());

            let expected = pre_states(&ids);
            for (k, pre) in expected.iter().enumerate() {
                prop_assert_eq!(
                    tracker.undo_target_for_backward_jump(ids.len(), k as i64),
                    Some(*pre)
                );
            }
        }

        /// Backward jump targets: none for forward, initial for negative.
        #[test]
        fn undo_target_edges(ids in increasing_ids(), extra in 0usize..5, below in 1i64..5) {
            let tracker = executed(&ids);
            let n = ids.len();
            prop_assert_eq!(tracker.undo_target_for_backward_jump(n, (n + extra) as i64), None);
            prop_assert_eq!(tracker.undo_target_for_backward_jump(n, -below), Some(0));
        }

        /// A repeated or decreasing id invalidates until reset.
        #[test]
        fn non_increasing_id_is_sticky(
            ids in increasing_ids(),
            back in 0u64..3,
            more in increasing_ids()
        ) {
            let mut tracker = executed(&ids);
            let n = ids.len();
            let bad = ids[n - 1].saturating_sub(back);
            tracker.before_statement_send(n);
            prop_assert!(!tracker.after_statement_processed(n, &PromptMarker::new(bad, "check")));
            prop_assert!(!tracker.is_valid());

            let top = *ids.last().unwrap();
            for (j, id) in more.iter().enumerate() {
                tracker.before_statement_send(n + j);
                tracker.after_statement_processed(n + j, &PromptMarker::new(top + id, "check"));
            }
            prop_assert!(!tracker.is_valid());
            prop_assert_eq!(tracker.undo_target_for_backward_jump(n, 0), None);

            tracker.reset();
            prop_assert!(tracker.is_valid());
            prop_assert!(tracker.is_empty());
        }

        /// A statement index that does not extend the mapping invalidates.
        #[test]
        fn index_mismatch_invalidates(ids in increasing_ids(), offset in 1usize..4) {
            let mut tracker = executed(&ids);
            let index = ids.len() + offset;
            tracker.before_statement_send(index);
            let next = PromptMarker::new(ids.last().unwrap() + 1, "check");
            prop_assert!(!tracker.after_statement_processed(index, &next));
            prop_assert!(!tracker.is_valid());
        }

        /// A batch with the wrong marker count changes nothing but validity.
        #[test]
        fn batch_count_mismatch_is_atomic(
            ids in increasing_ids(),
            count in 2usize..6
        ) {
            let mut tracker = executed(&ids);
            let before = tracker.snapshot().pre_state_id_by_statement_index;
            let top = *ids.last().unwrap();
            let markers: Vec<PromptMarker> = (1..count as u64)
                .map(|i| PromptMarker::new(top + i, "check"))
                .collect();

            prop_assert!(!tracker.after_batch_processed(ids.len(), count, &markers));
            prop_assert!(!tracker.is_valid());
            prop_assert_eq!(tracker.snapshot().pre_state_id_by_statement_index, before);
            prop_assert_eq!(tracker.current_state_id(), top);
        }

        /// A well-formed batch records the same mapping as single steps.
        #[test]
        fn batch_matches_sequential(ids in increasing_ids()) {
            let mut tracker = UndoStateTracker::new();
            let markers: Vec<PromptMarker> =
                ids.iter().map(|id| PromptMarker::new(*id, "check")).collect();
            prop_assert!(tracker.after_batch_processed(0, ids.len(), &markers));
            prop_assert_eq!(tracker.snapshot(), executed(&ids).snapshot());
        }

        /// Undoing to k keeps the first k entries untouched.
        #[test]
        fn undo_round_trip_truncates(ids in increasing_ids(), pick in any::<prop::sample::Index>()) {
            let mut tracker = executed(&ids);
            let full = tracker.snapshot().pre_state_id_by_statement_index;
            let k = pick.index(ids.len() + 1);
            let state = full.get(k).copied().unwrap_or_else(|| tracker.current_state_id());

            tracker.after_undo_succeeded(k, state);
            prop_assert!(tracker.is_valid());
            prop_assert_eq!(tracker.len(), k);
            prop_assert_eq!(tracker.current_state_id(), state);
            prop_assert_eq!(&tracker.snapshot().pre_state_id_by_statement_index[..], &full[..k]);
        }
    }

    // =========================================================================
    // Statement Scanner Properties
    // =========================================================================

    fn statement_text() -> impl Strategy<Value = String> {
        (
            "[a-z][a-z0-9_]{0,6}",
            prop::option::of("[A-Z][a-z]{0,4}\\.[a-z]{1,4}"),
            prop::option::of((0u32..100, 0u32..100)),
        )
            .prop_map(|(head, qualified, number)| {
                let mut text = head;
                if let Some(q) = qualified {
                    text.push(' ');
                    text.push_str(&q);
                }
                if let Some((whole, frac)) = number {
                    text.push_str(&format!(" {}.{}", whole, frac));
                }
                text.push('.');
                text
            })
    }

    fn separator() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just(" "),
            Just("\n"),
            Just("\n\n"),
            Just("\t"),
            Just("\n(* note. *)\n"),
            Just("(* a (* b. *) c *)"),
        ]
    }

    proptest! {
        /// Joined statements are recovered exactly, in order.
        #[test]
        fn scanner_recovers_statements(
            parts in prop::collection::vec((statement_text(), separator()), 1..12)
        ) {
            let mut doc = String::new();
            for (text, sep) in &parts {
                doc.push_str(text);
                doc.push_str(sep);
            }

            let found: Vec<_> = statements(&doc).collect();
            prop_assert_eq!(found.len(), parts.len());
            let mut previous_end = 0;
            for (stmt, (text, _)) in found.iter().zip(&parts) {
                prop_assert_eq!(&stmt.text, text);
                prop_assert!(stmt.start_offset >= previous_end);
                prop_assert_eq!(&doc[stmt.start_offset..stmt.end_offset], text.as_str());
                prop_assert_eq!(
                    find_previous_statement_end(&doc, stmt.end_offset + 1),
                    Some(stmt.end_offset)
                );
                previous_end = stmt.end_offset;
            }
        }

        /// Cursor resolution always lands on a boundary at or after the
        /// preceding statement's end.
        #[test]
        fn index_target_is_a_boundary(
            parts in prop::collection::vec((statement_text(), separator()), 1..8),
            cursor in 0usize..400
        ) {
            let doc: String = parts.iter().map(|(t, s)| format!("{}{}", t, s)).collect();
            let mut index = StatementIndex::new();
            index.update(&doc, 1);

            let target = index.target_end_offset(cursor);
            let is_boundary = target == 0 || index.statements().iter().any(|s| s.end_offset == target);
            prop_assert!(is_boundary);
            prop_assert!(target >= index.previous_end(cursor));
            prop_assert_eq!(index.count_up_to(target), index.statements_up_to(target).len());
        }
    }

    // =========================================================================
    // Prompt Counter Properties
    // =========================================================================

    fn response_stream(n: usize) -> String {
        (1..=n)
            .map(|i| format!("goal {}\n[{}|check]>\n", i, i))
            .collect()
    }

    proptest! {
        /// Chunk boundaries never change counts or segments.
        #[test]
        fn counting_is_split_invariant(n in 1usize..10, split in any::<prop::sample::Index>()) {
            let stream = response_stream(n);
            let at = split.index(stream.len() + 1);

            let mut whole = PromptCounter::new();
            whole.ingest_chunk(&stream);

            let mut parts = PromptCounter::new();
            parts.ingest_chunk(&stream[..at]);
            let tally = parts.ingest_chunk(&stream[at..]);

            prop_assert_eq!(tally.response_prompts, n);
            prop_assert_eq!(tally, whole.tally());
            prop_assert_eq!(parts.segments(), whole.segments());
        }

        /// The startup marker is never counted, wherever the split falls.
        #[test]
        fn startup_marker_never_counts(n in 0usize..6, split in any::<prop::sample::Index>()) {
            let stream = format!("banner\n[0|check]>\n{}", response_stream(n));
            let at = split.index(stream.len() + 1);

            let mut counter = PromptCounter::awaiting_startup(0);
            counter.ingest_chunk(&stream[..at]);
            let tally = counter.ingest_chunk(&stream[at..]);

            prop_assert_eq!(tally.response_prompts, n);
            prop_assert_eq!(tally.total_prompts, n + 1);
            prop_assert!(counter.ignored_startup_prompt());
        }
    }
}
