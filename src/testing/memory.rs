//! In-process bus double
//!
//! `MemoryBus` implements [`MessageBus`] against the same subscription
//! registry, reconnect buffer, and drain machinery as the production client,
//! delivering messages in-process instead of over a transport. Disconnect and
//! reconnect can be simulated to exercise buffering and failure paths.

use crate::bus::connection::{BufferPush, ConnectionState, ReconnectBuffer};
use crate::bus::subscription::{self, Subscription, SubscriptionRegistry, SyncSubscription};
use crate::bus::MessageBus;
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::middleware::MessageHandler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

struct Inner {
    registry: Arc<SubscriptionRegistry>,
    state_tx: tokio::sync::watch::Sender<ConnectionState>,
    state_rx: tokio::sync::watch::Receiver<ConnectionState>,
    buffer: Mutex<ReconnectBuffer>,
    headers_supported: bool,
    published: AtomicU64,
}

/// In-process [`MessageBus`] double.
///
/// Cloning yields another handle onto the same bus, so handlers can publish
/// replies through a clone of the handle they were registered on.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Bus with the default reconnect buffer and header support.
    pub fn new() -> Self {
        Self::build(0, true)
    }

    /// Bus with the given configured reconnect buffer size (zero selects the
    /// default, negative disables buffering).
    pub fn with_reconnect_buf_size(size: i64) -> Self {
        Self::build(size, true)
    }

    /// Bus reporting no header support, for exercising the capability
    /// precondition.
    pub fn without_headers() -> Self {
        Self::build(0, false)
    }

    fn build(buf_size: i64, headers_supported: bool) -> Self {
        let (state_tx, state_rx) = tokio::sync::watch::channel(ConnectionState::Disconnected);
        MemoryBus {
            inner: Arc::new(Inner {
                registry: Arc::new(SubscriptionRegistry::new()),
                state_tx,
                state_rx,
                buffer: Mutex::new(ReconnectBuffer::from_config_size(buf_size)),
                headers_supported,
                published: AtomicU64::new(0),
            }),
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.inner.state_rx.borrow().clone()
    }

    /// Simulate the transport observing a lost session.
    pub fn simulate_disconnect(&self) {
        let _ = self.inner.state_tx.send(ConnectionState::Reconnecting(1));
    }

    /// Simulate the transport re-establishing the session; buffered messages
    /// are replayed in publish order.
    pub fn simulate_reconnect(&self) {
        let _ = self.inner.state_tx.send(ConnectionState::Connected);
        let pending = {
            let mut buffer = self.inner.buffer.lock().unwrap();
            buffer.drain_pending()
        };
        for msg in pending {
            self.deliver(msg);
        }
    }

    /// Number of successful publishes accepted by this bus.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    fn deliver(&self, msg: Message) {
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        let delivered = self.inner.registry.dispatch(&msg);
        debug!(subject = %msg.subject, delivered, "memory bus delivered");
    }

    fn ensure_open(&self) -> BusResult<()> {
        match self.current_state() {
            ConnectionState::Closed => Err(BusError::NotConnected {
                state: ConnectionState::Closed,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&mut self) -> BusResult<()> {
        match self.current_state() {
            ConnectionState::Closed => Err(BusError::Connect("client closed".to_string())),
            _ => {
                let _ = self.inner.state_tx.send(ConnectionState::Connected);
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        self.current_state()
    }

    fn headers_supported(&self) -> bool {
        self.current_state().is_connected() && self.inner.headers_supported
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        self.publish_msg(Message::with_payload(subject, payload.to_vec()))
            .await
    }

    async fn publish_msg(&self, msg: Message) -> BusResult<()> {
        match self.current_state() {
            ConnectionState::Connected => {
                self.deliver(msg);
                Ok(())
            }
            state if state.allows_buffering() => {
                let outcome = {
                    let mut buffer = self.inner.buffer.lock().unwrap();
                    buffer.push(msg)
                };
                match outcome {
                    BufferPush::Buffered => Ok(()),
                    BufferPush::Disabled => Err(BusError::NotConnected { state }),
                    BufferPush::Exceeded { capacity } => Err(BusError::Publish(format!(
                        "reconnect buffer exceeded ({capacity} bytes)"
                    ))),
                }
            }
            state => Err(BusError::NotConnected { state }),
        }
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> BusResult<Subscription> {
        self.ensure_open()?;
        let (id, rx) = self.inner.registry.register(subject, None);
        let (cancel, worker) = subscription::spawn_worker(rx, handler);
        self.inner.registry.attach_cancel(id, cancel);
        Ok(Subscription::new(
            id,
            subject.to_string(),
            None,
            self.inner.registry.clone(),
            worker,
        ))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: MessageHandler,
    ) -> BusResult<Subscription> {
        self.ensure_open()?;
        let (id, rx) = self.inner.registry.register(subject, Some(group));
        let (cancel, worker) = subscription::spawn_worker(rx, handler);
        self.inner.registry.attach_cancel(id, cancel);
        Ok(Subscription::new(
            id,
            subject.to_string(),
            Some(group.to_string()),
            self.inner.registry.clone(),
            worker,
        ))
    }

    async fn subscribe_sync(&self, subject: &str) -> BusResult<SyncSubscription> {
        self.ensure_open()?;
        let (id, rx) = self.inner.registry.register(subject, None);
        Ok(SyncSubscription::new(
            id,
            subject.to_string(),
            None,
            self.inner.registry.clone(),
            rx,
        ))
    }

    async fn queue_subscribe_sync(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<SyncSubscription> {
        self.ensure_open()?;
        let (id, rx) = self.inner.registry.register(subject, Some(group));
        Ok(SyncSubscription::new(
            id,
            subject.to_string(),
            Some(group.to_string()),
            self.inner.registry.clone(),
            rx,
        ))
    }

    async fn close(&mut self) {
        self.inner.registry.close_all();
        self.inner.buffer.lock().unwrap().clear();
        let _ = self.inner.state_tx.send(ConnectionState::Closed);
    }
}
