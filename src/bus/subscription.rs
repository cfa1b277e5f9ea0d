//! Subscription registry and lifecycle
//!
//! Every subscription owns an unbounded queue feeding a single worker task,
//! which preserves per-subscription delivery order while allowing
//! cross-subscription parallelism. The registry routes published messages to
//! matching subscriptions, load-balancing queue groups round-robin, and
//! tracks the `Active -> Draining -> Closed` lifecycle of each entry.

use super::connection::DRAIN_TIMEOUT;
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::middleware::MessageHandler;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Lifecycle state of a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Accepting deliveries.
    Active,
    /// No longer accepting deliveries; queued and in-flight work finishing.
    Draining,
    /// Fully stopped.
    Closed,
}

struct Entry {
    subject: String,
    group: Option<String>,
    state: SubscriptionState,
    tx: Option<mpsc::UnboundedSender<Message>>,
    cancel: Option<watch::Sender<bool>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    round_robin: HashMap<(String, String), usize>,
}

/// Routes published messages to registered subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `subject`, returning the subscription id and the
    /// delivery queue receiver.
    pub fn register(
        &self,
        subject: &str,
        group: Option<&str>,
    ) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                subject: subject.to_string(),
                group: group.map(str::to_string),
                state: SubscriptionState::Active,
                tx: Some(tx),
                cancel: None,
            },
        );
        (id, rx)
    }

    /// Attach the worker cancellation handle for a push subscription.
    pub fn attach_cancel(&self, id: u64, cancel: watch::Sender<bool>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.cancel = Some(cancel);
        }
    }

    /// Current state of a subscription, `None` once removed.
    pub fn state(&self, id: u64) -> Option<SubscriptionState> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&id).map(|entry| entry.state)
    }

    /// Transition `Active -> Draining`: stop accepting deliveries and close
    /// the queue so the worker finishes the backlog and exits.
    pub fn begin_drain(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.state == SubscriptionState::Active => {
                entry.state = SubscriptionState::Draining;
                entry.tx = None;
                true
            }
            _ => false,
        }
    }

    /// Close a subscription: signal its worker and remove the entry.
    /// Delivery attempts after this point find no match and are rejected.
    pub fn close(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.remove(&id) {
            Some(entry) => {
                if let Some(cancel) = entry.cancel {
                    let _ = cancel.send(true);
                }
                true
            }
            None => false,
        }
    }

    /// Close every subscription; used when the owning connection closes.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, entry) in inner.entries.drain() {
            if let Some(cancel) = entry.cancel {
                let _ = cancel.send(true);
            }
        }
        inner.round_robin.clear();
    }

    /// Subjects and groups of currently active subscriptions, for
    /// re-registration with the broker after a reconnect.
    pub fn active_subscriptions(&self) -> Vec<(String, Option<String>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|entry| entry.state == SubscriptionState::Active)
            .map(|entry| (entry.subject.clone(), entry.group.clone()))
            .collect()
    }

    /// Deliver `msg` to matching subscriptions: every active ungrouped match
    /// receives a copy; each queue group on the subject receives exactly one
    /// copy, rotated round-robin across its members. Returns the delivery
    /// count.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            entries,
            round_robin,
            ..
        } = &mut *inner;

        let mut ungrouped = Vec::new();
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, entry) in entries.iter() {
            if entry.state != SubscriptionState::Active || entry.subject != msg.subject {
                continue;
            }
            match &entry.group {
                None => ungrouped.push(*id),
                Some(group) => groups.entry(group.clone()).or_default().push(*id),
            }
        }

        let mut delivered = 0;
        for id in ungrouped {
            if let Some(tx) = entries.get(&id).and_then(|entry| entry.tx.as_ref()) {
                if tx.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        for (group, mut members) in groups {
            members.sort_unstable();
            let counter = round_robin
                .entry((msg.subject.clone(), group))
                .or_insert(0);
            let chosen = members[*counter % members.len()];
            *counter = counter.wrapping_add(1);
            if let Some(tx) = entries.get(&chosen).and_then(|entry| entry.tx.as_ref()) {
                if tx.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }
}

/// Spawn the single consumer task for a push subscription. The worker invokes
/// the handler for one message at a time, preserving delivery order. A cancel
/// signal stops it before the next message; the in-flight invocation always
/// completes. When the queue closes the worker finishes the backlog and exits.
pub(crate) fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Message>,
    handler: MessageHandler,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let worker = tokio::spawn(async move {
        let mut control_gone = false;
        loop {
            if control_gone {
                match rx.recv().await {
                    Some(msg) => handler(msg).await,
                    None => break,
                }
                continue;
            }
            tokio::select! {
                biased;
                changed = cancel_rx.changed() => match changed {
                    Ok(()) => {
                        if *cancel_rx.borrow_and_update() {
                            break;
                        }
                    }
                    Err(_) => control_gone = true,
                },
                next = rx.recv() => match next {
                    Some(msg) => handler(msg).await,
                    None => break,
                },
            }
        }
    });
    (cancel_tx, worker)
}

/// Handle to a push-mode subscription.
///
/// Dropping the handle leaves the subscription delivering; stop it explicitly
/// with [`Subscription::unsubscribe`] or [`Subscription::drain`].
pub struct Subscription {
    id: u64,
    subject: String,
    group: Option<String>,
    registry: Arc<SubscriptionRegistry>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        subject: String,
        group: Option<String>,
        registry: Arc<SubscriptionRegistry>,
        worker: JoinHandle<()>,
    ) -> Self {
        Subscription {
            id,
            subject,
            group,
            registry,
            worker: Some(worker),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.registry.state(self.id) == Some(SubscriptionState::Active)
    }

    /// Stop delivery immediately, discarding queued messages. A handler
    /// invocation already in flight completes on its own.
    pub fn unsubscribe(mut self) -> BusResult<()> {
        self.worker.take();
        if self.registry.close(self.id) {
            Ok(())
        } else {
            Err(BusError::Unsubscribe(
                "subscription already closed".to_string(),
            ))
        }
    }

    /// Drain with the default timeout. See [`Subscription::drain_with_timeout`].
    pub async fn drain(self) -> BusResult<()> {
        self.drain_with_timeout(DRAIN_TIMEOUT).await
    }

    /// Stop accepting new deliveries, wait until queued and in-flight handler
    /// invocations finish, then close. On timeout the subscription is closed
    /// anyway and [`BusError::DrainTimedOut`] is returned for the caller to
    /// log; drain failures are never escalated by shutdown paths.
    pub async fn drain_with_timeout(mut self, timeout: Duration) -> BusResult<()> {
        self.registry.begin_drain(self.id);
        let result = match self.worker.take() {
            Some(worker) => match tokio::time::timeout(timeout, worker).await {
                Ok(_) => Ok(()),
                Err(_) => Err(BusError::DrainTimedOut(timeout)),
            },
            None => Ok(()),
        };
        self.registry.close(self.id);
        result
    }
}

/// Handle to a pull-mode subscription: the caller reads messages explicitly.
pub struct SyncSubscription {
    id: u64,
    subject: String,
    group: Option<String>,
    registry: Arc<SubscriptionRegistry>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl SyncSubscription {
    pub(crate) fn new(
        id: u64,
        subject: String,
        group: Option<String>,
        registry: Arc<SubscriptionRegistry>,
        rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        SyncSubscription {
            id,
            subject,
            group,
            registry,
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Read the next message, waiting at most `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> BusResult<Message> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::SubscriptionClosed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Read the next message, returning [`BusError::Cancelled`] as soon as
    /// the external cancellation signal fires.
    pub async fn next_or_cancelled(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> BusResult<Message> {
        if *cancel.borrow() {
            return Err(BusError::Cancelled);
        }
        tokio::select! {
            _ = cancel.changed() => Err(BusError::Cancelled),
            next = self.rx.recv() => match next {
                Some(msg) => Ok(msg),
                None => Err(BusError::SubscriptionClosed),
            },
        }
    }

    /// Stop delivery immediately, discarding queued messages.
    pub fn unsubscribe(self) -> BusResult<()> {
        if self.registry.close(self.id) {
            Ok(())
        } else {
            Err(BusError::Unsubscribe(
                "subscription already closed".to_string(),
            ))
        }
    }

    /// Stop accepting new deliveries and close. Pull subscriptions have no
    /// in-flight handler work to wait for.
    pub fn drain(self) -> BusResult<()> {
        self.registry.begin_drain(self.id);
        self.registry.close(self.id);
        Ok(())
    }
}
