//! Approximate line-diff statistics.
//!
//! Counts are a set-difference per unique line, not a true sequence
//! alignment: repeated or reordered lines under- or over-count. The
//! numbers are display statistics only; revert and accept never depend
//! on them.

use std::collections::HashSet;

use crate::session::ChangeKind;

/// Added/removed unique-line counts between two contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

/// Compute approximate line stats between original and modified content.
#[must_use]
pub fn line_stats(original: &str, modified: &str) -> DiffStats {
    let before: HashSet<&str> = original.lines().collect();
    let after: HashSet<&str> = modified.lines().collect();
    DiffStats {
        added: after.difference(&before).count(),
        removed: before.difference(&after).count(),
    }
}

/// Derive the change kind from before/after content.
#[must_use]
pub fn change_kind(original: &str, modified: &str) -> ChangeKind {
    if original.is_empty() {
        ChangeKind::Created
    } else if modified.is_empty() {
        ChangeKind::Deleted
    } else {
        ChangeKind::Modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_has_no_stats() {
        let stats = line_stats("a\nb\nc", "a\nb\nc");
        assert_eq!(stats, DiffStats::default());
    }

    #[test]
    fn counts_added_and_removed_lines() {
        let stats = line_stats("a\nb", "a\nc\nd");
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 1);
    }

    #[test]
    fn repeated_lines_count_once() {
        // The unique-line heuristic: a duplicated addition counts once.
        let stats = line_stats("a", "a\nx\nx");
        assert_eq!(stats.added, 1);
    }

    #[test]
    fn derives_change_kind() {
        assert_eq!(change_kind("", "new"), ChangeKind::Created);
        assert_eq!(change_kind("old", ""), ChangeKind::Deleted);
        assert_eq!(change_kind("old", "new"), ChangeKind::Modified);
    }
}
