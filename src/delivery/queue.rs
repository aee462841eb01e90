//! Per-listener caption queue
//!
//! Bounded queue between the translation fan-out and one listener's
//! socket. A slow listener sheds interim revisions first: a fresh
//! interim replaces the queued interim of the same utterance in place,
//! overflow evicts the oldest queued interim, and when only protected
//! events remain the incoming interim is the one discarded. Protected
//! events (finals and unavailability notices) may overshoot capacity,
//! but a listener that never drains loses oldest-first once the
//! overshoot ceiling is hit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::CaptionEvent;

/// Protected events may overshoot capacity, but never past this
/// multiple of it. The queue stays bounded even for a listener that
/// never drains.
const PROTECTED_OVERSHOOT_LIMIT: usize = 4;

/// What happened to a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Took the place of a queued interim for the same utterance
    Replaced,
    /// Enqueued after evicting the oldest queued interim
    DisplacedInterim,
    /// Overshoot ceiling reached; enqueued after dropping the oldest
    /// protected event
    DisplacedProtected,
    /// Queue held only protected events; the interim was discarded
    Rejected,
    /// Listener is gone
    Closed,
}

#[derive(Debug)]
pub struct CaptionQueue {
    items: Mutex<VecDeque<CaptionEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
    superseded: AtomicU64,
}

impl CaptionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            dropped: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
        })
    }

    pub fn push(&self, event: CaptionEvent) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let mut items = self.items.lock();

        // An interim supersedes the queued interim of its utterance,
        // keeping the original position
        if !event.is_protected() {
            if let Some(utterance) = event.utterance_id() {
                if let Some(slot) = items
                    .iter_mut()
                    .find(|queued| !queued.is_protected() && queued.utterance_id() == Some(utterance))
                {
                    *slot = event;
                    self.superseded.fetch_add(1, Ordering::Relaxed);
                    drop(items);
                    self.notify.notify_one();
                    return PushOutcome::Replaced;
                }
            }
        }

        if items.len() < self.capacity {
            items.push_back(event);
            drop(items);
            self.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        // Full: evict the oldest interim if there is one
        if let Some(pos) = items.iter().position(|queued| !queued.is_protected()) {
            items.remove(pos);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            items.push_back(event);
            drop(items);
            self.notify.notify_one();
            return PushOutcome::DisplacedInterim;
        }

        // Only protected events queued
        if event.is_protected() {
            let ceiling = self.capacity * PROTECTED_OVERSHOOT_LIMIT;
            if items.len() >= ceiling {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                items.push_back(event);
                drop(items);
                self.notify.notify_one();
                return PushOutcome::DisplacedProtected;
            }
            items.push_back(event);
            drop(items);
            self.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        PushOutcome::Rejected
    }

    /// Wait for the next event. Returns `None` once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<CaptionEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.items.lock().pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<CaptionEvent> {
        self.items.lock().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}

/// Consuming handle to one listener's queue.
#[derive(Debug)]
pub struct CaptionReceiver {
    queue: Arc<CaptionQueue>,
}

impl CaptionReceiver {
    pub(crate) fn new(queue: Arc<CaptionQueue>) -> Self {
        Self { queue }
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<CaptionEvent> {
        self.queue.recv().await
    }

    /// Adapt to a stream for socket forwarding.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = CaptionEvent> + Send {
        futures_util::stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}
