//! Operational transform engine.
//!
//! Rewrites a pending operation, authored against `client_version`, so that it
//! applies to the document at `server_version`. The pending op is folded
//! through every committed edit in `(client_version, server_version]` in
//! version order.
//!
//! ```text
//!   client_version                           server_version
//!        │   edit v+1    edit v+2    edit v+3      │
//!   op ──┴──► T(op,e1) ─► T(·,e2) ──► T(·,e3) ─────┴──► pieces
//! ```
//!
//! Rules, per intervening step:
//! - insert at `p <= pos` shifts the op forward by the inserted length
//!   (same-position inserts: the smaller session id goes first);
//! - delete before `pos` shifts it back, clamped to the delete's start;
//!   ranged ops lose whatever part of their range was deleted;
//! - replace acts on ranged ops as a delete followed by an insert at the same
//!   position. A pending insert at the start of or inside the replaced range
//!   lands before the replacement text; one at its end lands after it;
//! - format steps are ignored.
//!
//! Text inserted at the start of or inside a pending delete/replace range
//! always survives and ends up before any replacement text: the range is
//! shifted, or split into a lower delete and an upper piece that keeps the
//! replacement. Pieces are returned in current-version coordinates, ordered by
//! descending position, so applying them in order never disturbs the ones
//! still pending.
//!
//! Positions saturate instead of wrapping, so a position that was out of range
//! stays out of range and the bounds check rejects it.

use std::sync::Arc;

use crate::ids::SessionId;
use crate::operation::{CollaborativeEdit, EditOperation, OperationKind};

/// Result of transforming a pending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Operations to apply in order, already in current-version coordinates.
    Transformed(Vec<EditOperation>),
    /// The op's target was removed by the listed intervening edits.
    Conflict { competing: Vec<CollaborativeEdit> },
}

/// Committed operation reduced to its effect on positions.
#[derive(Debug, Clone, Copy)]
enum Step {
    Insert { at: usize, len: usize },
    Delete { at: usize, len: usize },
    Replace { at: usize, del: usize, ins: usize },
}

fn step(op: &EditOperation) -> Option<Step> {
    match op.kind {
        OperationKind::Insert => Some(Step::Insert {
            at: op.position,
            len: op.inserted_len(),
        }),
        OperationKind::Delete => Some(Step::Delete {
            at: op.position,
            len: op.length,
        }),
        OperationKind::Replace => match op.inserted_len() {
            0 => Some(Step::Delete {
                at: op.position,
                len: op.length,
            }),
            ins => Some(Step::Replace {
                at: op.position,
                del: op.length,
                ins,
            }),
        },
        OperationKind::Format => None,
    }
}

/// What happened to one piece of the pending op under one step.
enum PieceResult {
    Kept(Vec<EditOperation>),
    /// Entire target range was deleted.
    Lost,
}

/// Transform `op`, authored by `author` at `client_version`, through the
/// committed `intervening` edits up to `server_version`.
///
/// `intervening` must hold exactly the edits with version in
/// `(client_version, server_version]`, ordered by version.
pub fn transform(
    op: EditOperation,
    author: SessionId,
    client_version: u64,
    server_version: u64,
    intervening: &[Arc<CollaborativeEdit>],
) -> TransformOutcome {
    if client_version == server_version {
        return TransformOutcome::Transformed(vec![op]);
    }
    debug_assert!(intervening
        .windows(2)
        .all(|w| w[0].version < w[1].version));

    let destructive = op.is_destructive();
    let mut pieces = vec![op];
    let mut competing: Vec<CollaborativeEdit> = Vec::new();

    for edit in intervening {
        let Some(step) = step(&edit.operation) else {
            continue;
        };
        let prior_first = edit.session_id <= author;
        let removes = !matches!(step, Step::Insert { .. });
        let mut touched = false;

        let mut next = Vec::with_capacity(pieces.len() + 1);
        for piece in pieces {
            let before = piece.clone();
            match transform_piece(piece, step, prior_first) {
                PieceResult::Kept(ops) => {
                    let remaining: usize = ops.iter().map(|o| o.length).sum();
                    if removes && remaining < before.length {
                        touched = true;
                    }
                    next.extend(ops);
                }
                PieceResult::Lost => {
                    touched = true;
                    if before.kind == OperationKind::Replace {
                        competing.push((**edit).clone());
                        log::debug!(
                            "Replace at {} lost its target to edit v{}",
                            before.position,
                            edit.version
                        );
                        return TransformOutcome::Conflict { competing };
                    }
                }
            }
        }
        pieces = next;

        if touched && destructive {
            competing.push((**edit).clone());
        }
        if destructive && pieces.is_empty() {
            log::debug!(
                "Delete fully removed by intervening edits up to v{}",
                edit.version
            );
            return TransformOutcome::Conflict { competing };
        }
    }

    pieces.sort_by(|a, b| b.position.cmp(&a.position));
    TransformOutcome::Transformed(pieces)
}

/// Transform a single piece against one step.
fn transform_piece(piece: EditOperation, step: Step, prior_first: bool) -> PieceResult {
    match step {
        Step::Insert { at, len } => against_insert(piece, at, len, prior_first),
        Step::Delete { at, len } => against_delete(piece, at, len),
        Step::Replace { at, del, ins } => {
            if piece.kind == OperationKind::Insert {
                let moved = insert_against_replace(piece, at, del, ins);
                return PieceResult::Kept(vec![moved]);
            }
            match against_delete(piece, at, del) {
                PieceResult::Kept(ops) => {
                    let mut out = Vec::with_capacity(ops.len() + 1);
                    for op in ops {
                        if let PieceResult::Kept(split) =
                            against_insert(op, at, ins, prior_first)
                        {
                            out.extend(split);
                        }
                    }
                    PieceResult::Kept(out)
                }
                PieceResult::Lost => PieceResult::Lost,
            }
        }
    }
}

fn against_insert(
    mut piece: EditOperation,
    at: usize,
    len: usize,
    prior_first: bool,
) -> PieceResult {
    if len == 0 {
        return PieceResult::Kept(vec![piece]);
    }
    let q = piece.position;
    match piece.kind {
        OperationKind::Insert => {
            if at < q || (at == q && prior_first) {
                piece.position = q.saturating_add(len);
            }
            PieceResult::Kept(vec![piece])
        }
        OperationKind::Format => {
            if at <= q {
                piece.position = q.saturating_add(len);
            } else if at < q.saturating_add(piece.length) {
                piece.length = piece.length.saturating_add(len);
            }
            PieceResult::Kept(vec![piece])
        }
        OperationKind::Delete | OperationKind::Replace => {
            let end = q.saturating_add(piece.length);
            if at <= q {
                piece.position = q.saturating_add(len);
                PieceResult::Kept(vec![piece])
            } else if at < end {
                // Split around the inserted text. The upper piece keeps any
                // replacement content so it lands after the inserted text.
                let lower = EditOperation {
                    kind: OperationKind::Delete,
                    position: q,
                    content: String::new(),
                    length: at - q,
                    attributes: None,
                    section: piece.section.clone(),
                };
                piece.position = at.saturating_add(len);
                piece.length = end - at;
                PieceResult::Kept(vec![piece, lower])
            } else {
                PieceResult::Kept(vec![piece])
            }
        }
    }
}

fn against_delete(mut piece: EditOperation, at: usize, len: usize) -> PieceResult {
    if len == 0 {
        return PieceResult::Kept(vec![piece]);
    }
    let del_end = at.saturating_add(len);
    let q = piece.position;
    if piece.kind == OperationKind::Insert {
        if q > at {
            piece.position = if q >= del_end { q - len } else { at };
        }
        return PieceResult::Kept(vec![piece]);
    }

    let end = q.saturating_add(piece.length);
    let overlap = end.min(del_end).saturating_sub(q.max(at));
    let new_start = if q <= at {
        q
    } else if q >= del_end {
        q - len
    } else {
        at
    };

    if overlap > 0 && overlap == piece.length && piece.is_destructive() {
        return PieceResult::Lost;
    }
    piece.position = new_start;
    piece.length -= overlap;
    PieceResult::Kept(vec![piece])
}

/// A pending insert meeting a committed replace of `[at, at + del)`.
fn insert_against_replace(
    mut piece: EditOperation,
    at: usize,
    del: usize,
    ins: usize,
) -> EditOperation {
    let q = piece.position;
    if q < at {
        return piece;
    }
    piece.position = if q >= at.saturating_add(del) {
        (q - del).saturating_add(ins)
    } else {
        at
    };
    piece
}
