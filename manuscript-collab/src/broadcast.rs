//! Fan-out of pre-encoded frames to the sessions of a manuscript.
//!
//! ```text
//!                      ┌──► outbox A (bounded) ──► socket A
//!   ServerMessage ─ encode once ─ Frame ─┼──► outbox B (full: drop, mark lagged)
//!                      └──► outbox C ──────────► socket C
//! ```
//!
//! Every message is serialized once and the resulting `Arc<str>` is shared by
//! all recipients. Delivery never waits: a full outbox drops the frame for that
//! peer only, and the peer's connection task catches it up with a fresh sync
//! state once it drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ids::SessionId;
use crate::session::{Delivery, Frame, Session};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames queued on a peer's outbox
    pub messages_sent: u64,
    /// Frames dropped because a peer's outbox was full
    pub messages_dropped: u64,
    /// Broadcast calls
    pub broadcasts: u64,
}

/// Lock-free counters, read through [`Broadcaster::stats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    broadcasts: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    stats: AtomicBroadcastStats,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for one session.
    pub fn send_to(&self, session: &Session, frame: Frame) -> Delivery {
        let delivery = session.connection().try_deliver(frame);
        self.record(session, delivery);
        delivery
    }

    /// Queue a frame for every session except `exclude`.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn fan_out(
        &self,
        sessions: &[Arc<Session>],
        frame: Frame,
        exclude: Option<SessionId>,
    ) -> usize {
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut queued = 0;
        for session in sessions {
            if Some(session.id) == exclude || !session.is_active() {
                continue;
            }
            if self.send_to(session, frame.clone()) == Delivery::Queued {
                queued += 1;
            }
        }
        queued
    }

    fn record(&self, session: &Session, delivery: Delivery) {
        match delivery {
            Delivery::Queued => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Dropped => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Session {} ({}) is lagging; frame dropped",
                    session.id,
                    session.user_id
                );
            }
            Delivery::Closed => {
                log::debug!("Session {} outbox closed", session.id);
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
        }
    }
}
