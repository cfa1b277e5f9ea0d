//! Bus abstraction and client machinery
//!
//! [`MessageBus`] is the capability interface over the broker session:
//! connect, publish, request, subscribe, close. Production code has exactly
//! one implementer ([`broker::BrokerClient`]); tests use the in-process
//! double in [`crate::testing`]. Retry wrappers and request/reply correlation
//! are default trait methods so every implementer shares the same tested
//! logic.

use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::middleware::MessageHandler;
use crate::retry::{self, RetryPolicy};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub mod broker;
pub mod connection;
pub mod subscription;

pub use connection::{ConnectionState, ReconnectBuffer};
pub use subscription::{Subscription, SubscriptionState, SyncSubscription};

/// Capability interface over one logical broker session.
///
/// A client value is safe for concurrent use by multiple callers once
/// connected; subscriptions are owned by whichever component registered them.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establish the session. Fails with [`BusError::Connect`] when the dial
    /// fails or TLS material is invalid.
    async fn connect(&mut self) -> BusResult<()>;

    /// Whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Current session state.
    fn connection_state(&self) -> ConnectionState;

    /// Whether the broker session supports message headers. Services relying
    /// on header-based error propagation must refuse to start when this is
    /// false.
    fn headers_supported(&self) -> bool;

    /// Fire-and-forget send of raw payload bytes to `subject`.
    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()>;

    /// Fire-and-forget send of a full message (subject, reply, headers,
    /// payload).
    async fn publish_msg(&self, msg: Message) -> BusResult<()>;

    /// Push-mode subscription: each delivered message invokes `handler` on
    /// the subscription's worker task.
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> BusResult<Subscription>;

    /// Push-mode subscription sharing deliveries across `group` members.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: MessageHandler,
    ) -> BusResult<Subscription>;

    /// Pull-mode subscription: the caller reads messages explicitly.
    async fn subscribe_sync(&self, subject: &str) -> BusResult<SyncSubscription>;

    /// Pull-mode subscription sharing deliveries across `group` members.
    async fn queue_subscribe_sync(&self, subject: &str, group: &str)
        -> BusResult<SyncSubscription>;

    /// Flush buffered outbound messages best-effort and release the session.
    /// Subsequent operations fail with [`BusError::NotConnected`].
    async fn close(&mut self);

    /// [`MessageBus::publish`] wrapped in the retry executor. Returns the
    /// number of failed attempts consumed before success.
    async fn publish_with_retries(
        &self,
        subject: &str,
        payload: &[u8],
        max_attempts: u32,
    ) -> BusResult<u32> {
        let policy = RetryPolicy::new(max_attempts);
        let (attempts, result) =
            retry::with_retries(&policy, || self.publish(subject, payload)).await;
        result.map(|()| attempts)
    }

    /// [`MessageBus::publish_msg`] wrapped in the retry executor.
    async fn publish_msg_with_retries(&self, msg: Message, max_attempts: u32) -> BusResult<u32> {
        let policy = RetryPolicy::new(max_attempts);
        let (attempts, result) =
            retry::with_retries(&policy, || self.publish_msg(msg.clone())).await;
        result.map(|()| attempts)
    }

    /// Send `msg` and await the correlated reply, waiting at most `timeout`.
    ///
    /// A unique inbox subject is subscribed before the send; the reply is
    /// whatever arrives there first. Fails with [`BusError::Timeout`] on
    /// expiry.
    async fn request(&self, msg: Message, timeout: Duration) -> BusResult<Message> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut sub = self.subscribe_sync(&inbox).await?;

        let request = Message {
            reply: Some(inbox),
            ..msg
        };
        if let Err(err) = self.publish_msg(request).await {
            let _ = sub.unsubscribe();
            return Err(err);
        }

        let result = sub.next(timeout).await;
        if let Err(err) = sub.unsubscribe() {
            debug!(error = %err, "reply inbox unsubscribe failed");
        }
        match result {
            Ok(reply) => Ok(reply),
            Err(BusError::Timeout(elapsed)) => Err(BusError::Timeout(elapsed)),
            Err(other) => Err(BusError::Request(other.to_string())),
        }
    }

    /// [`MessageBus::request`] wrapped in the retry executor. Every retry
    /// re-sends the request and re-waits the full timeout, so worst-case
    /// latency is `max_attempts x timeout` plus cumulative backoff.
    async fn request_with_retries(
        &self,
        msg: Message,
        timeout: Duration,
        max_attempts: u32,
    ) -> BusResult<(Message, u32)> {
        let policy = RetryPolicy::new(max_attempts);
        let (attempts, result) =
            retry::with_retries(&policy, || self.request(msg.clone(), timeout)).await;
        result.map(|reply| (reply, attempts))
    }
}
