//! Broadcast hub: registry of live sessions and event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use crate::event::Event;
use crate::filter::{self, Filter};

pub type SessionId = u64;

/// The hub's view of one live session.
///
/// The subscription table is owned and mutated by the session's reader task;
/// the hub only reads it. The session's lifecycle strictly precedes the hub
/// entry: teardown unregisters before the tasks exit.
#[derive(Clone)]
pub struct SessionHandle {
    /// Bounded queue of serialized frames to the session's writer task.
    pub outbound: mpsc::Sender<String>,
    /// Active subscriptions keyed by subscription id.
    pub subscriptions: Arc<RwLock<HashMap<String, Vec<Filter>>>>,
    closing: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        SessionHandle {
            outbound,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(Notify::new()),
        }
    }

    /// Mark the session closing and wake its writer to send a Close frame.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close_signal.notify_one();
    }

    /// Enqueue a frame without blocking; a full queue closes the session.
    pub fn try_send(&self, frame: String) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.begin_close(),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once `begin_close` has been called.
    pub async fn closed(&self) {
        if self.is_closing() {
            return;
        }
        self.close_signal.notified().await;
    }
}

/// Shared registry of sessions; `publish` fans accepted events out.
pub struct Hub {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn register(&self, handle: SessionHandle) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(id, handle);
        id
    }

    /// Remove a session; its subscriptions go with it.
    pub async fn unregister(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Deliver an accepted event to every matching subscription.
    ///
    /// Never blocks on a slow consumer: a full queue marks that session
    /// closing and skips it. FIFO per session comes from the queue itself.
    pub async fn publish(&self, ev: &Event) {
        let sessions = self.sessions.read().await;
        for (id, handle) in sessions.iter() {
            if handle.is_closing() {
                continue;
            }
            let subs = handle.subscriptions.read().await;
            for (sub_id, filters) in subs.iter() {
                if !filter::matches_any(ev, filters) {
                    continue;
                }
                let frame = serde_json::json!(["EVENT", sub_id, ev]).to_string();
                handle.try_send(frame);
                if handle.is_closing() {
                    debug!(session = id, "outbound queue full, closing session");
                    break;
                }
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
