//! Character-level Myers diff.
//!
//! The search itself is `similar`'s linear-space Myers with a deadline, so
//! large or unrelated texts cost bounded memory and time. Runs of deletions
//! and insertions that meet at the same point are reported as a single
//! modification.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices_deadline, Algorithm, DiffOp, DiffTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifferenceKind {
    Insert,
    Delete,
    Modify,
}

/// One changed region. Positions count chars in the old and new text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difference {
    pub kind: DifferenceKind,
    pub old_position: usize,
    pub old_length: usize,
    pub new_position: usize,
    pub new_length: usize,
    pub old_text: String,
    pub new_text: String,
}

/// Upper bound on time spent searching for a minimal diff. Past it the
/// remaining region is reported as one coarse change.
const DIFF_DEADLINE: Duration = Duration::from_millis(250);

/// Differences turning `old` into `new`, in text order.
pub fn diff(old: &str, new: &str) -> Vec<Difference> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    if a == b {
        return Vec::new();
    }

    let deadline = Instant::now() + DIFF_DEADLINE;
    let ops = capture_diff_slices_deadline(Algorithm::Myers, &a, &b, Some(deadline));
    collect_hunks(&ops, &a, &b)
}

/// Merge consecutive non-equal ops into one hunk each.
fn collect_hunks(ops: &[DiffOp], a: &[char], b: &[char]) -> Vec<Difference> {
    let mut out = Vec::new();
    let mut hunk: Option<(usize, usize, usize, usize)> = None;

    for op in ops {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            if let Some(h) = hunk.take() {
                out.push(make_difference(h, a, b));
            }
            continue;
        }
        let h = hunk.get_or_insert((old_range.start, 0, new_range.start, 0));
        h.1 += old_range.len();
        h.3 += new_range.len();
    }
    if let Some(h) = hunk {
        out.push(make_difference(h, a, b));
    }
    out
}

fn make_difference(
    (old_position, old_length, new_position, new_length): (usize, usize, usize, usize),
    a: &[char],
    b: &[char],
) -> Difference {
    let kind = match (old_length, new_length) {
        (0, _) => DifferenceKind::Insert,
        (_, 0) => DifferenceKind::Delete,
        _ => DifferenceKind::Modify,
    };
    Difference {
        kind,
        old_position,
        old_length,
        new_position,
        new_length,
        old_text: a[old_position..old_position + old_length].iter().collect(),
        new_text: b[new_position..new_position + new_length].iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild `new` from `old` by applying the differences back to front.
    fn patch(old: &str, diffs: &[Difference]) -> String {
        let mut chars: Vec<char> = old.chars().collect();
        for d in diffs.iter().rev() {
            chars.splice(
                d.old_position..d.old_position + d.old_length,
                d.new_text.chars(),
            );
        }
        chars.into_iter().collect()
    }

    #[test]
    fn test_identical_texts_have_no_differences() {
        assert!(diff("same text", "same text").is_empty());
        assert!(diff("", "").is_empty());
    }

    #[test]
    fn test_pure_insert() {
        let d = diff("Hello world", "Hello brave world");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Insert);
        assert_eq!(d[0].new_text, "brave ");
        assert_eq!(d[0].old_position, 6);
    }

    #[test]
    fn test_pure_delete() {
        let d = diff("Hello brave world", "Hello world");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Delete);
        assert_eq!(d[0].old_text, "brave ");
    }

    #[test]
    fn test_modify() {
        let d = diff("The cat sat", "The dog sat");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Modify);
        assert_eq!(d[0].old_text, "cat");
        assert_eq!(d[0].new_text, "dog");
    }

    #[test]
    fn test_from_and_to_empty() {
        let d = diff("", "abc");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Insert);
        let d = diff("abc", "");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Delete);
    }

    #[test]
    fn test_unrelated_texts_are_one_modification() {
        let old = "a".repeat(6000);
        let new = "b".repeat(6000);
        let started = Instant::now();
        let d = diff(&old, &new);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, DifferenceKind::Modify);
        assert_eq!((d[0].old_length, d[0].new_length), (6000, 6000));
        assert_eq!(patch(&old, &d), new);
    }

    #[test]
    fn test_large_text_with_scattered_edits() {
        let old = "It was the best of times. ".repeat(2000);
        let new = old.replacen("best", "finest", 2).replacen("times", "days", 1);
        let d = diff(&old, &new);
        assert!(!d.is_empty());
        assert_eq!(patch(&old, &d), new);
    }

    #[test]
    fn test_patch_reproduces_target() {
        let pairs = [
            ("Hello world", "Hello!  "),
            ("abcabba", "cbabac"),
            ("the quick brown fox", "a quick brown dog jumps"),
            ("naïve café", "naive cafés"),
        ];
        for (old, new) in pairs {
            let d = diff(old, new);
            assert_eq!(patch(old, &d), new, "{old:?} -> {new:?}");
        }
    }
}
