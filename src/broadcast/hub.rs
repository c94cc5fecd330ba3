// =============================================================================
// Broadcast hub — client sessions, per-session queues, fan-out
// =============================================================================
//
// Fan-out never blocks the broadcaster: each session owns a bounded queue
// with drop-oldest overflow, drained by that session's writer task. A session
// may narrow its trade-aggregate stream to one page of the current ranking;
// metadata and deviation messages always pass.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::broadcast::messages::OutboundMessage;
use crate::errors::PipelineCounters;

/// Default per-session outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A client's page subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSelection {
    pub page: usize,
    pub page_size: usize,
}

/// One connected client.
pub struct ClientSession {
    pub id: Uuid,
    queue: Mutex<VecDeque<Arc<OutboundMessage>>>,
    notify: Notify,
    capacity: usize,
    /// Messages discarded from this session's queue under overflow.
    drops: AtomicU64,
    page: RwLock<Option<PageSelection>>,
}

impl ClientSession {
    fn new(capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            drops: AtomicU64::new(0),
            page: RwLock::new(None),
        }
    }

    /// Non-blocking enqueue; discards the oldest message on overflow.
    fn push(&self, msg: Arc<OutboundMessage>, counters: &PipelineCounters) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.drops.fetch_add(1, Ordering::Relaxed);
                PipelineCounters::incr(&counters.client_overflows);
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Await the next batch of queued messages. Drains the whole queue so one
    /// wakeup flushes a burst.
    pub async fn recv_batch(&self) -> Vec<Arc<OutboundMessage>> {
        loop {
            {
                let mut queue = self.queue.lock();
                if !queue.is_empty() {
                    return queue.drain(..).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn set_page(&self, selection: PageSelection) {
        *self.page.write() = Some(selection);
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct BroadcastHub {
    sessions: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
    /// Latest ranking order, for resolving page subscriptions.
    ranked_symbols: RwLock<Vec<String>>,
    counters: Arc<PipelineCounters>,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(counters: Arc<PipelineCounters>, queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ranked_symbols: RwLock::new(Vec::new()),
            counters,
            queue_capacity,
        }
    }

    pub fn register(&self) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(self.queue_capacity));
        self.sessions.write().insert(session.id, session.clone());
        info!(session = %session.id, total = self.session_count(), "client session registered");
        session
    }

    pub fn unregister(&self, id: Uuid) {
        if let Some(session) = self.sessions.write().remove(&id) {
            info!(
                session = %id,
                dropped = session.drop_count(),
                total = self.session_count(),
                "client session removed"
            );
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Refresh the ranking order used to resolve page subscriptions.
    pub fn update_ranking(&self, symbols: Vec<String>) {
        *self.ranked_symbols.write() = symbols;
    }

    /// Push `msg` to every session whose filter admits it.
    pub fn broadcast(&self, msg: OutboundMessage) {
        let msg = Arc::new(msg);
        let sessions = self.sessions.read();
        if sessions.is_empty() {
            return;
        }
        let ranking = self.ranked_symbols.read();
        for session in sessions.values() {
            if self.admits(session, &msg, &ranking) {
                session.push(msg.clone(), &self.counters);
            }
        }
    }

    /// Page filtering applies to per-symbol aggregates only; ranking and
    /// deviation messages are page-independent.
    fn admits(
        &self,
        session: &ClientSession,
        msg: &OutboundMessage,
        ranking: &[String],
    ) -> bool {
        let OutboundMessage::TradeAggregate { symbol, .. } = msg else {
            return true;
        };
        let Some(selection) = *session.page.read() else {
            return true;
        };
        let start = selection.page.saturating_mul(selection.page_size);
        let end = start.saturating_add(selection.page_size).min(ranking.len());
        if start >= end {
            return false;
        }
        ranking[start..end].iter().any(|s| s == symbol)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
