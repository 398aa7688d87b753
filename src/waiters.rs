//! Process-wide rendezvous between timed workflows and the event stream.
//!
//! A workflow registers interest in `(order_id?, uic, kinds)` and awaits; the
//! streaming client dispatches every normalized event through here. Events
//! nobody is waiting for yet go to a bounded backlog so a waiter registering
//! moments late still gets its event.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::ens::{EnsEvent, EnsEventKind};

/// Backlog capacity; oldest events are evicted first.
const BACKLOG_CAPACITY: usize = 100;

/// Statuses that prove a fill when waiting for [`EnsEventKind::OrderFill`].
const FILL_STATUSES: [&str; 3] = ["filled", "fill", "finalfill"];

#[derive(Debug)]
struct Waiter {
    id: u64,
    order_id: Option<String>,
    uic: u64,
    expected: Vec<EnsEventKind>,
    tx: oneshot::Sender<EnsEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    waiters: Vec<Waiter>,
    backlog: VecDeque<EnsEvent>,
    next_id: u64,
}

/// A registered waiter, resolved by [`WaiterRegistry::dispatch`] or dropped
/// by the timeout path.
#[derive(Debug)]
pub struct WaiterTicket {
    id: u64,
    rx: oneshot::Receiver<EnsEvent>,
}

/// The registry. One instance per process, shared by the streaming client
/// and every confirmation task.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    inner: Mutex<Inner>,
}

impl WaiterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in events of the given kinds on the given
    /// instrument (and order, for order-scoped kinds).
    ///
    /// The backlog is drained first: when a matching event is already
    /// buffered, the ticket resolves immediately and the event leaves the
    /// backlog.
    pub async fn register(
        &self,
        order_id: Option<String>,
        uic: u64,
        expected: Vec<EnsEventKind>,
    ) -> WaiterTicket {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            id: inner.next_id,
            order_id,
            uic,
            expected,
            tx,
        };

        if let Some(index) = inner
            .backlog
            .iter()
            .position(|event| matches(&waiter, event))
        {
            let event = inner.backlog.remove(index).expect("index just found");
            let id = waiter.id;
            // Receiver is alive in this scope, the send cannot fail.
            let _ = waiter.tx.send(event);
            return WaiterTicket { id, rx };
        }

        let id = waiter.id;
        inner.waiters.push(waiter);

        WaiterTicket { id, rx }
    }

    /// Deliver one event: every matching waiter is resolved exactly once and
    /// removed. With no match, the event is pushed to the backlog, evicting
    /// the oldest entry beyond capacity.
    pub async fn dispatch(&self, event: EnsEvent) {
        let mut inner = self.inner.lock().await;

        let mut resolved = 0;
        let mut index = 0;
        while index < inner.waiters.len() {
            if matches(&inner.waiters[index], &event) {
                let waiter = inner.waiters.swap_remove(index);
                // A dropped receiver only means the waiter timed out first.
                let _ = waiter.tx.send(event.clone());
                resolved += 1;
            } else {
                index += 1;
            }
        }

        if resolved == 0 {
            if inner.backlog.len() >= BACKLOG_CAPACITY {
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(event);
        } else {
            log::debug!("event resolved {resolved} waiter(s)");
        }
    }

    /// Remove a waiter that will no longer be awaited. Safe to call after
    /// resolution; a resolved waiter is already gone.
    pub async fn unregister(&self, ticket: &WaiterTicket) {
        let mut inner = self.inner.lock().await;
        inner.waiters.retain(|waiter| waiter.id != ticket.id);
    }

    /// Register and await in one step, with the timeout/unregister pairing
    /// every call site needs: on timeout or a dropped sender the waiter is
    /// unregistered before returning `None`.
    pub async fn wait_for(
        &self,
        order_id: Option<String>,
        uic: u64,
        expected: Vec<EnsEventKind>,
        timeout: Duration,
    ) -> Option<EnsEvent> {
        let mut ticket = self.register(order_id, uic, expected).await;

        match tokio::time::timeout(timeout, &mut ticket.rx).await {
            Ok(Ok(event)) => Some(event),
            Ok(Err(_)) | Err(_) => {
                self.unregister(&ticket).await;
                None
            }
        }
    }

    /// Number of buffered events nobody has claimed yet.
    pub async fn backlog_len(&self) -> usize {
        self.inner.lock().await.backlog.len()
    }
}

/// The match rule: kind and instrument always; order identity for the
/// order-scoped kinds; fill-proving status for fills.
fn matches(waiter: &Waiter, event: &EnsEvent) -> bool {
    if !waiter.expected.contains(&event.kind) || waiter.uic != event.uic {
        return false;
    }

    match event.kind {
        EnsEventKind::OrderFill => {
            waiter.order_id.is_some()
                && waiter.order_id == event.order_id
                && FILL_STATUSES.contains(&event.status.as_str())
        }
        EnsEventKind::OrderStatusChange => {
            waiter.order_id.is_some() && waiter.order_id == event.order_id
        }
        EnsEventKind::PositionClosed => true,
    }
}
