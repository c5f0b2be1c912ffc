//! Persistence integration tests.
//!
//! Verifies:
//! - Manuscripts, comments and snapshots survive a server restart
//! - Edits persisted after the last snapshot are replayed on load
//! - Snapshots fold covered edits into the stored base
//! - Multi-manuscript isolation under persistence

use manuscript_collab::config::ServerConfig;
use manuscript_collab::operation::EditOperation;
use manuscript_collab::protocol::{CommentAction, EditRequest, JoinRequest};
use manuscript_collab::room::EditOutcome;
use manuscript_collab::service::CollabService;
use manuscript_collab::session::{ConnectionHandle, Frame, Role};
use manuscript_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use manuscript_collab::{CommentStatus, ManuscriptId, SessionId, UserId};

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::mpsc;

// ─── Helpers ─────────────────────────────────────────────────────────────────

type Outbox = (ConnectionHandle, mpsc::Receiver<Frame>);

fn open_service(path: &Path) -> (Arc<CollabService>, Arc<RocksStore>) {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap());
    let config = ServerConfig {
        auto_snapshot_interval: 0,
        ..ServerConfig::default()
    };
    let service = Arc::new(CollabService::with_store(config, store.clone()));
    (service, store)
}

/// Join over a detached connection. The outbox is returned so it stays open.
async fn join(service: &CollabService, manuscript: &str, user: &str) -> (SessionId, Outbox) {
    let (conn, rx) = ConnectionHandle::new(64);
    let ack = service
        .join(
            &conn,
            JoinRequest {
                manuscript_id: ManuscriptId::new(manuscript),
                user_id: UserId::new(user),
                user_name: None,
                role: Some(Role::Author),
            },
        )
        .await
        .unwrap();
    (ack.session.session_id, (conn, rx))
}

async fn edit(service: &CollabService, session: SessionId, op: EditOperation, base: u64) -> u64 {
    match service
        .submit_edit(session, EditRequest { operation: op, base_version: base })
        .await
        .unwrap()
    {
        EditOutcome::Applied { version, .. } => version,
        other => panic!("expected applied edit, got {other:?}"),
    }
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_edits_survive_restart() {
    let dir = tempdir().unwrap();
    let ms = ManuscriptId::new("novel");
    {
        let (service, _store) = open_service(dir.path());
        service.create_manuscript(&ms, "Chapter one.").unwrap();
        let (session, _conn) = join(&service, "novel", "alice").await;
        edit(&service, session, EditOperation::insert(12, " It rained."), 0).await;
        edit(&service, session, EditOperation::replace(0, 7, "Part"), 1).await;
    }

    let (service, store) = open_service(dir.path());
    assert_eq!(store.pending_edits(&ms).unwrap(), 2);
    let (content, version) = service.document(&ms).await.unwrap();
    assert_eq!(content, "Part one. It rained.");
    assert_eq!(version, 2);
}

#[tokio::test]
async fn test_snapshot_compacts_and_survives_restart() {
    let dir = tempdir().unwrap();
    let ms = ManuscriptId::new("paper");
    {
        let (service, store) = open_service(dir.path());
        service.create_manuscript(&ms, "Abstract").unwrap();
        let (session, _conn) = join(&service, "paper", "alice").await;
        edit(&service, session, EditOperation::insert(8, ": TBD"), 0).await;

        let snapshot = service
            .snapshot(&ms, UserId::new("alice"), Some("first draft".into()))
            .await
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(store.pending_edits(&ms).unwrap(), 0);

        edit(&service, session, EditOperation::delete(8, 5), 1).await;
        assert_eq!(store.pending_edits(&ms).unwrap(), 1);
    }

    let (service, _store) = open_service(dir.path());
    let (content, version) = service.document(&ms).await.unwrap();
    assert_eq!(content, "Abstract");
    assert_eq!(version, 2);

    let versions = service.versions(&ms).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
    assert_eq!(versions[0].description.as_deref(), Some("first draft"));

    let diff = service.diff(&ms, 1, 2).await.unwrap();
    assert_eq!(diff.summary.chars_removed, 5);
}

#[tokio::test]
async fn test_comments_survive_restart() {
    let dir = tempdir().unwrap();
    let ms = ManuscriptId::new("essay");
    {
        let (service, _store) = open_service(dir.path());
        service.create_manuscript(&ms, "The thesis is here.").unwrap();
        let (session, _conn) = join(&service, "essay", "bob").await;
        let added = service
            .comment(
                session,
                CommentAction::Add {
                    content: "Be specific".into(),
                    anchor_position: 4,
                    anchor_length: 6,
                    mentions: Vec::new(),
                },
            )
            .await
            .unwrap();
        service
            .comment(session, CommentAction::Resolve { comment_id: added.comment.id })
            .await
            .unwrap();

        // Resolved comments still follow edits made ahead of them.
        edit(&service, session, EditOperation::insert(0, ">> "), 0).await;
    }

    let (service, _store) = open_service(dir.path());
    let comments = service.comments(&ms, None).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].status, CommentStatus::Resolved);
    assert_eq!(comments[0].anchor_position, 7);
    assert_eq!(comments[0].anchor_length, 6);
    assert_eq!(comments[0].content, "Be specific");
}

#[tokio::test]
async fn test_open_comment_anchor_persisted_after_edit() {
    let dir = tempdir().unwrap();
    let ms = ManuscriptId::new("memo");
    {
        let (service, _store) = open_service(dir.path());
        service.create_manuscript(&ms, "Budget is final.").unwrap();
        let (session, _conn) = join(&service, "memo", "carol").await;
        service
            .comment(
                session,
                CommentAction::Add {
                    content: "Is it?".into(),
                    anchor_position: 10,
                    anchor_length: 5,
                    mentions: Vec::new(),
                },
            )
            .await
            .unwrap();
        edit(&service, session, EditOperation::insert(0, "The "), 0).await;
    }

    let (service, _store) = open_service(dir.path());
    let comments = service.comments(&ms, Some(CommentStatus::Open)).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].anchor_position, 14);
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_multi_manuscript_isolation() {
    let dir = tempdir().unwrap();
    {
        let (service, _store) = open_service(dir.path());
        for name in ["a", "ab", "b"] {
            service.create_manuscript(&ManuscriptId::new(name), name).unwrap();
        }
        let (session, _conn) = join(&service, "a", "alice").await;
        for v in 0..10 {
            edit(&service, session, EditOperation::insert(0, "x"), v).await;
        }
    }

    let (service, store) = open_service(dir.path());
    assert_eq!(store.pending_edits(&ManuscriptId::new("a")).unwrap(), 10);
    assert_eq!(store.pending_edits(&ManuscriptId::new("ab")).unwrap(), 0);

    let listed = service.list_manuscripts().unwrap();
    assert_eq!(listed.len(), 3);

    let (a, _) = service.document(&ManuscriptId::new("a")).await.unwrap();
    let (ab, _) = service.document(&ManuscriptId::new("ab")).await.unwrap();
    assert_eq!(a, format!("{}a", "x".repeat(10)));
    assert_eq!(ab, "ab");
}

#[test]
fn test_large_manuscript_roundtrip() {
    let dir = tempdir().unwrap();
    let ms = ManuscriptId::new("tome");
    let content = "All work and no play makes Jack a dull boy. ".repeat(20_000);
    {
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.create_document(&ms, &content).unwrap();
        store.flush().unwrap();
    }

    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let loaded = store.load_document(&ms).unwrap();
    assert_eq!(loaded.content, content);
    assert_eq!(loaded.version, 0);
}
