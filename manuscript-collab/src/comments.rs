//! Threaded comments anchored to text ranges.
//!
//! ```text
//!   content:  The quick brown fox jumps
//!                       ^^^^^          anchor (position 10, length 5)
//!   insert "very " at 4  -> anchor moves to 15
//!   insert "ish" at 12   -> anchor grows to length 8
//!   delete [8, 20)       -> anchor covered: length 0, orphaned
//! ```
//!
//! Anchors of every comment follow every applied edit, whatever its status,
//! so a resolved comment that is reopened still points at its text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};
use crate::ids::{CommentId, ManuscriptId, UserId};
use crate::operation::{EditOperation, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Open,
    Resolved,
    Archived,
}

/// A reply in a comment thread. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThread {
    pub id: CommentId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub mentions: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub manuscript_id: ManuscriptId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub anchor_position: usize,
    pub anchor_length: usize,
    pub status: CommentStatus,
    /// Set once the anchored text has been deleted entirely.
    pub orphaned: bool,
    pub replies: Vec<CommentThread>,
    pub mentions: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manuscript_id: ManuscriptId,
        author_id: UserId,
        author_name: impl Into<String>,
        content: impl Into<String>,
        anchor_position: usize,
        anchor_length: usize,
        mentions: Vec<UserId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CommentId::new(),
            manuscript_id,
            author_id,
            author_name: author_name.into(),
            content: content.into(),
            anchor_position,
            anchor_length,
            status: CommentStatus::Open,
            orphaned: false,
            replies: Vec::new(),
            mentions,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn anchor_end(&self) -> usize {
        self.anchor_position.saturating_add(self.anchor_length)
    }

    pub fn is_open(&self) -> bool {
        self.status == CommentStatus::Open
    }

    /// Move the anchor to follow an applied operation. Returns whether it changed.
    ///
    /// `op` is expressed against the content the anchor currently refers to.
    pub fn adjust_anchor(&mut self, op: &EditOperation) -> bool {
        let before = (self.anchor_position, self.anchor_length, self.orphaned);
        match op.kind {
            OperationKind::Insert => self.shift_for_insert(op.position, op.inserted_len()),
            OperationKind::Delete => self.shift_for_delete(op.position, op.length),
            OperationKind::Replace => {
                self.shift_for_delete(op.position, op.length);
                self.shift_for_insert(op.position, op.inserted_len());
            }
            OperationKind::Format => {}
        }
        let changed = before != (self.anchor_position, self.anchor_length, self.orphaned);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    fn shift_for_insert(&mut self, at: usize, n: usize) {
        if n == 0 {
            return;
        }
        if at <= self.anchor_position {
            self.anchor_position = self.anchor_position.saturating_add(n);
        } else if at < self.anchor_end() {
            self.anchor_length = self.anchor_length.saturating_add(n);
        }
    }

    fn shift_for_delete(&mut self, at: usize, n: usize) {
        let del_end = at.saturating_add(n);
        let (start, end) = (self.anchor_position, self.anchor_end());

        if del_end <= start {
            self.anchor_position -= n;
            return;
        }
        if at >= end {
            return;
        }
        if self.anchor_length > 0 && at <= start && del_end >= end {
            self.anchor_position = at;
            self.anchor_length = 0;
            self.orphaned = true;
            return;
        }
        // Partial overlap; a point anchor inside the range lands on its start.
        let overlap = del_end.min(end) - at.max(start);
        self.anchor_length -= overlap;
        self.anchor_position = start.min(at);
    }

    pub fn add_reply(&mut self, reply: CommentThread) -> Result<()> {
        if self.status == CommentStatus::Archived {
            return Err(CollabError::InvalidOperation(format!(
                "comment {} is archived",
                self.id
            )));
        }
        self.replies.push(reply);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `target`, enforcing open -> resolved -> open and anything -> archived.
    pub fn transition(&mut self, target: CommentStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, target),
            (CommentStatus::Open, CommentStatus::Resolved)
                | (CommentStatus::Resolved, CommentStatus::Open)
                | (CommentStatus::Open, CommentStatus::Archived)
                | (CommentStatus::Resolved, CommentStatus::Archived)
        );
        if !allowed {
            return Err(CollabError::InvalidOperation(format!(
                "comment {} cannot move from {:?} to {:?}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// All comments of one manuscript, in creation order.
#[derive(Debug, Default, Clone)]
pub struct CommentBook {
    comments: Vec<Comment>,
}

impl CommentBook {
    pub fn new(mut comments: Vec<Comment>) -> Self {
        comments.sort_by_key(|c| c.created_at);
        Self { comments }
    }

    pub fn get(&self, id: CommentId) -> Result<&Comment> {
        self.comments
            .iter()
            .find(|c| c.id == id)
            .ok_or(CollabError::CommentNotFound(id))
    }

    /// Check that a new anchor lies inside content of `content_len` chars.
    pub fn check_anchor(position: usize, length: usize, content_len: usize) -> Result<()> {
        match position.checked_add(length) {
            Some(end) if end <= content_len => Ok(()),
            _ => Err(CollabError::OutOfBounds {
                position,
                length,
                content_len,
            }),
        }
    }

    /// Insert or replace a comment by id.
    pub fn upsert(&mut self, comment: Comment) {
        match self.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment,
            None => self.comments.push(comment),
        }
    }

    /// Copy of a comment with `reply` appended, for persisting before commit.
    pub fn draft_reply(&self, id: CommentId, reply: CommentThread) -> Result<Comment> {
        let mut comment = self.get(id)?.clone();
        comment.add_reply(reply)?;
        Ok(comment)
    }

    /// Copy of a comment moved to `target`, for persisting before commit.
    pub fn draft_transition(&self, id: CommentId, target: CommentStatus) -> Result<Comment> {
        let mut comment = self.get(id)?.clone();
        comment.transition(target)?;
        Ok(comment)
    }

    /// Copies of the comments whose anchors move when `ops` are applied in
    /// order, for persisting before commit. The book itself is untouched.
    pub fn draft_anchors(&self, ops: &[EditOperation]) -> Vec<Comment> {
        self.comments
            .iter()
            .filter_map(|c| {
                let mut draft = c.clone();
                let mut moved = false;
                for op in ops {
                    moved |= draft.adjust_anchor(op);
                }
                moved.then_some(draft)
            })
            .collect()
    }

    pub fn list(&self, status: Option<CommentStatus>) -> Vec<Comment> {
        self.comments
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect()
    }

    pub fn open(&self) -> Vec<Comment> {
        self.list(Some(CommentStatus::Open))
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(pos: usize, len: usize) -> Comment {
        Comment::new(
            ManuscriptId::new("ms"),
            UserId::new("alice"),
            "Alice",
            "check this",
            pos,
            len,
            Vec::new(),
        )
    }

    fn anchor(c: &Comment) -> (usize, usize, bool) {
        (c.anchor_position, c.anchor_length, c.orphaned)
    }

    #[test]
    fn test_insert_before_shifts() {
        let mut c = comment(10, 5);
        assert!(c.adjust_anchor(&EditOperation::insert(4, "very ")));
        assert_eq!(anchor(&c), (15, 5, false));
    }

    #[test]
    fn test_insert_at_anchor_start_shifts() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::insert(10, "ab"));
        assert_eq!(anchor(&c), (12, 5, false));
    }

    #[test]
    fn test_insert_inside_grows() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::insert(12, "ish"));
        assert_eq!(anchor(&c), (10, 8, false));
    }

    #[test]
    fn test_insert_at_end_is_outside() {
        let mut c = comment(10, 5);
        assert!(!c.adjust_anchor(&EditOperation::insert(15, "x")));
        assert_eq!(anchor(&c), (10, 5, false));
    }

    #[test]
    fn test_delete_before_shifts_back() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::delete(2, 3));
        assert_eq!(anchor(&c), (7, 5, false));
    }

    #[test]
    fn test_delete_overlapping_start_shrinks() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::delete(8, 4));
        assert_eq!(anchor(&c), (8, 3, false));
    }

    #[test]
    fn test_delete_overlapping_end_shrinks() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::delete(13, 6));
        assert_eq!(anchor(&c), (10, 3, false));
    }

    #[test]
    fn test_delete_inside_shrinks() {
        let mut c = comment(10, 5);
        c.adjust_anchor(&EditOperation::delete(11, 2));
        assert_eq!(anchor(&c), (10, 3, false));
    }

    #[test]
    fn test_covering_delete_orphans_without_removing() {
        let mut book = CommentBook::default();
        let c = comment(10, 5);
        let id = c.id;
        book.upsert(c);

        let moved = book.draft_anchors(&[EditOperation::delete(8, 12)]);
        assert_eq!(moved.len(), 1);
        assert_eq!(anchor(&moved[0]), (8, 0, true));
        assert_eq!(anchor(book.get(id).unwrap()), (10, 5, false));

        book.upsert(moved[0].clone());
        assert_eq!(anchor(book.get(id).unwrap()), (8, 0, true));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_delete_after_is_ignored() {
        let mut c = comment(10, 5);
        assert!(!c.adjust_anchor(&EditOperation::delete(15, 3)));
    }

    #[test]
    fn test_point_anchor_inside_delete_moves_to_start() {
        let mut c = comment(10, 0);
        c.adjust_anchor(&EditOperation::delete(8, 4));
        assert_eq!(anchor(&c), (8, 0, false));
    }

    #[test]
    fn test_replace_covering_anchor() {
        let mut c = comment(4, 3);
        c.adjust_anchor(&EditOperation::replace(4, 3, "xy"));
        assert_eq!(anchor(&c), (6, 0, true));
    }

    #[test]
    fn test_format_never_moves_anchor() {
        let mut c = comment(4, 3);
        assert!(!c.adjust_anchor(&EditOperation::format(0, 10, Default::default())));
    }

    #[test]
    fn test_resolved_and_archived_comments_follow_edits() {
        let mut book = CommentBook::default();
        let mut resolved = comment(10, 5);
        resolved.transition(CommentStatus::Resolved).unwrap();
        let mut archived = comment(2, 3);
        archived.transition(CommentStatus::Archived).unwrap();
        book.upsert(resolved);
        book.upsert(archived);

        let moved = book.draft_anchors(&[EditOperation::insert(0, "abc")]);
        let mut positions: Vec<usize> = moved.iter().map(|c| c.anchor_position).collect();
        positions.sort_unstable();
        assert_eq!(positions, vec![5, 13]);
    }

    #[test]
    fn test_draft_anchors_folds_ops_in_order() {
        let mut book = CommentBook::default();
        book.upsert(comment(10, 5));
        let ops = [EditOperation::delete(12, 2), EditOperation::insert(0, "ab")];
        let moved = book.draft_anchors(&ops);
        assert_eq!(anchor(&moved[0]), (12, 3, false));
        assert!(book.draft_anchors(&[EditOperation::insert(20, "x")]).is_empty());
    }

    #[test]
    fn test_status_transitions() {
        let mut c = comment(0, 1);
        c.transition(CommentStatus::Resolved).unwrap();
        assert!(c.transition(CommentStatus::Resolved).is_err());
        c.transition(CommentStatus::Open).unwrap();
        c.transition(CommentStatus::Archived).unwrap();
        assert!(c.transition(CommentStatus::Open).is_err());
        assert!(c.transition(CommentStatus::Archived).is_err());
    }

    #[test]
    fn test_replies_are_appended_and_blocked_when_archived() {
        let mut book = CommentBook::default();
        let c = comment(0, 1);
        let id = c.id;
        book.upsert(c);

        let reply = CommentThread {
            id: CommentId::new(),
            author_id: UserId::new("bob"),
            author_name: "Bob".into(),
            content: "agreed".into(),
            mentions: vec![UserId::new("alice")],
            created_at: Utc::now(),
        };
        let drafted = book.draft_reply(id, reply.clone()).unwrap();
        assert!(book.get(id).unwrap().replies.is_empty());
        book.upsert(drafted);
        assert_eq!(book.get(id).unwrap().replies.len(), 1);

        let archived = book.draft_transition(id, CommentStatus::Archived).unwrap();
        book.upsert(archived);
        assert!(book.draft_reply(id, reply).is_err());
    }

    #[test]
    fn test_check_anchor_bounds() {
        assert!(CommentBook::check_anchor(3, 2, 5).is_ok());
        assert!(CommentBook::check_anchor(5, 0, 5).is_ok());
        assert!(matches!(
            CommentBook::check_anchor(4, 2, 5),
            Err(CollabError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unknown_comment() {
        let book = CommentBook::default();
        assert!(matches!(
            book.get(CommentId::new()),
            Err(CollabError::CommentNotFound(_))
        ));
    }
}
