//! Property tests for the edit pipeline.
//!
//! Random interleavings of stale and current edits from several authors must
//! leave the room, the persisted log and an independent replica in agreement.
//! Two concurrent edits must produce the same text whichever arrives first.

use manuscript_collab::operation::EditOperation;
use manuscript_collab::room::{Author, EditOutcome, EditPolicy, ManuscriptRoom};
use manuscript_collab::storage::{DocumentStore, MemoryStore};
use manuscript_collab::{ManuscriptId, SessionId, UserId};
use proptest::prelude::*;
use uuid::Uuid;

const POLICY: EditPolicy = EditPolicy {
    max_transform_distance: 16,
    auto_snapshot_interval: 5,
};

#[derive(Debug, Clone)]
enum Kind {
    Insert(String),
    Delete(usize),
    Replace(usize, String),
}

#[derive(Debug, Clone)]
struct Step {
    author: usize,
    kind: Kind,
    /// Fraction of the current length, in percent.
    at: usize,
    /// How many versions behind the head the author is.
    lag: u64,
}

fn step() -> impl Strategy<Value = Step> {
    let kind = prop_oneof![
        "[a-z ]{1,6}".prop_map(Kind::Insert),
        (1usize..6).prop_map(Kind::Delete),
        ((1usize..4), "[A-Z]{1,3}").prop_map(|(n, s)| Kind::Replace(n, s)),
    ];
    (0usize..3, kind, 0usize..=100, 0u64..4).prop_map(|(author, kind, at, lag)| Step {
        author,
        kind,
        at,
        lag,
    })
}

fn authors() -> Vec<Author> {
    ["alice", "bob", "carol"]
        .iter()
        .enumerate()
        .map(|(i, name)| Author {
            session_id: SessionId(Uuid::from_u128(i as u128 + 1)),
            user_id: UserId::new(*name),
            user_name: name.to_string(),
        })
        .collect()
}

/// Feed the steps to a fresh room. Returns the room, its store and the
/// number of committed log entries.
async fn run(initial: &str, steps: &[Step]) -> (ManuscriptRoom, MemoryStore, u64) {
    let id = ManuscriptId::new("prop");
    let store = MemoryStore::new();
    store.create_document(&id, initial).unwrap();
    let room = ManuscriptRoom::load(&store, &id).unwrap();
    let authors = authors();
    let mut committed = 0;

    for step in steps {
        let head = room.version().await;
        let len = room.content().await.chars().count();
        let position = len * step.at / 100;
        let op = match &step.kind {
            Kind::Insert(text) => EditOperation::insert(position, text.as_str()),
            Kind::Delete(n) => EditOperation::delete(position, *n),
            Kind::Replace(n, text) => EditOperation::replace(position, *n, text.as_str()),
        };
        let base = head.saturating_sub(step.lag);
        // Rejections (bounds, conflicts) are part of the property: they must
        // leave no trace.
        if let Ok(EditOutcome::Applied { edits, .. }) =
            room.submit_edit(&store, &authors[step.author], op, base, POLICY).await
        {
            committed += edits.len() as u64;
        }
    }
    (room, store, committed)
}

/// An in-bounds edit on a text of `len` chars.
fn pair_edit() -> impl Strategy<Value = (Kind, usize)> {
    let kind = prop_oneof![
        "[A-M]{1,3}".prop_map(Kind::Insert),
        (1usize..5).prop_map(Kind::Delete),
        ((1usize..5), "[N-Z]{0,3}").prop_map(|(n, s)| Kind::Replace(n, s)),
    ];
    (kind, 0usize..=100)
}

fn pair_op(kind: &Kind, at: usize, len: usize) -> EditOperation {
    match kind {
        Kind::Insert(text) => EditOperation::insert(len * at / 100, text.as_str()),
        Kind::Delete(n) | Kind::Replace(n, _) => {
            let n = (*n).min(len).max(1);
            let position = (len - n) * at / 100;
            match kind {
                Kind::Replace(_, text) => EditOperation::replace(position, n, text.as_str()),
                _ => EditOperation::delete(position, n),
            }
        }
    }
}

/// Submit `first` then `second`, both authored against v0. `None` when
/// either is rejected or ends in a conflict.
async fn apply_concurrent(
    initial: &str,
    first: (&Author, EditOperation),
    second: (&Author, EditOperation),
) -> Option<String> {
    let id = ManuscriptId::new("pair");
    let store = MemoryStore::new();
    store.create_document(&id, initial).unwrap();
    let room = ManuscriptRoom::load(&store, &id).unwrap();
    for (author, op) in [first, second] {
        match room.submit_edit(&store, author, op, 0, POLICY).await {
            Ok(EditOutcome::Applied { .. }) => {}
            _ => return None,
        }
    }
    Some(room.content().await)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_persisted_log_replays_to_live_state(
        initial in "[a-z ]{0,24}",
        steps in proptest::collection::vec(step(), 0..40),
    ) {
        block_on(async {
            let (room, store, committed) = run(&initial, &steps).await;
            let version = room.version().await;
            prop_assert_eq!(version, committed);

            let reloaded = ManuscriptRoom::load(&store, room.manuscript_id()).unwrap();
            prop_assert_eq!(reloaded.content().await, room.content().await);
            prop_assert_eq!(reloaded.version().await, version);
            Ok(())
        })?;
    }

    #[test]
    fn test_replicas_fed_the_same_edits_agree(
        initial in "[a-z ]{0,24}",
        steps in proptest::collection::vec(step(), 0..40),
    ) {
        block_on(async {
            let (first, _, _) = run(&initial, &steps).await;
            let (second, _, _) = run(&initial, &steps).await;
            prop_assert_eq!(first.content().await, second.content().await);
            prop_assert_eq!(first.version().await, second.version().await);
            Ok(())
        })?;
    }

    #[test]
    fn test_concurrent_inserts_keep_both_texts(
        initial in "[a-z]{0,16}",
        a in "[A-M]{1,4}",
        b in "[N-Z]{1,4}",
        pa in 0usize..=100,
        pb in 0usize..=100,
    ) {
        block_on(async {
            let id = ManuscriptId::new("pair");
            let store = MemoryStore::new();
            store.create_document(&id, &initial).unwrap();
            let room = ManuscriptRoom::load(&store, &id).unwrap();
            let authors = authors();
            let len = initial.chars().count();

            let first = EditOperation::insert(len * pa / 100, a.as_str());
            let second = EditOperation::insert(len * pb / 100, b.as_str());
            room.submit_edit(&store, &authors[0], first, 0, POLICY).await.unwrap();
            room.submit_edit(&store, &authors[1], second, 0, POLICY).await.unwrap();

            let content = room.content().await;
            prop_assert!(content.contains(a.as_str()));
            prop_assert!(content.contains(b.as_str()));
            prop_assert_eq!(content.chars().count(), len + a.len() + b.len());
            prop_assert_eq!(room.version().await, 2);
            Ok(())
        })?;
    }

    #[test]
    fn test_concurrent_pair_converges_in_either_order(
        initial in "[a-z]{1,12}",
        (ka, pa) in pair_edit(),
        (kb, pb) in pair_edit(),
        swap_sessions in any::<bool>(),
    ) {
        block_on(async {
            let authors = authors();
            let (x, y) = if swap_sessions {
                (&authors[1], &authors[0])
            } else {
                (&authors[0], &authors[1])
            };
            let len = initial.chars().count();
            let a = pair_op(&ka, pa, len);
            let b = pair_op(&kb, pb, len);

            let ab = apply_concurrent(&initial, (x, a.clone()), (y, b.clone())).await;
            let ba = apply_concurrent(&initial, (y, b), (x, a)).await;
            if let (Some(ab), Some(ba)) = (ab, ba) {
                prop_assert_eq!(ab, ba);
            }
            Ok(())
        })?;
    }
}
