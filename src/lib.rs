//! wirebus - resilient publish/subscribe messaging client
//!
//! A client layer that owns a single session to a message broker and exposes
//! synchronous and asynchronous subscribe, publish, and request operations
//! with configurable retry-with-backoff, middleware-wrapped message handling,
//! and graceful shutdown with subscription draining.
//!
//! # Overview
//!
//! - [`MessageBus`] is the capability interface over the broker session, with
//!   one production implementer ([`BrokerClient`], MQTT v5 via rumqttc) and an
//!   in-process double ([`testing::MemoryBus`]) for tests.
//! - Publish and request failures can be retried through the shared linear
//!   backoff executor in [`retry`].
//! - Handlers are wrapped by [`middleware`] layers; the built-in
//!   [`LogMiddleware`] logs subjects and headers at debug verbosity.
//! - Subscriptions drain gracefully: in-flight handler work finishes before
//!   delivery stops.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wirebus::{
//!     compose, handler_fn, BrokerClient, BusConfig, LogMiddleware, Message, MessageBus,
//! };
//!
//! # async fn run() -> wirebus::BusResult<()> {
//! let mut client = BrokerClient::new(BusConfig::new("mqtt://localhost:1883", "adder"))?;
//! client.connect().await?;
//! let client = Arc::new(client);
//!
//! let worker = {
//!     let client = client.clone();
//!     handler_fn(move |msg: Message| {
//!         let client = client.clone();
//!         async move {
//!             if let Some(reply) = msg.reply_message(&b"5"[..]) {
//!                 let _ = client.publish_msg(reply).await;
//!             }
//!         }
//!     })
//! };
//! let logging = LogMiddleware::new("adder", "production");
//! let sub = client
//!     .queue_subscribe("math.add", "workers", compose(worker, &[&logging]))
//!     .await?;
//!
//! let reply = client
//!     .request(
//!         Message::with_payload("math.add", &b"{\"a\":2,\"b\":3}"[..]),
//!         Duration::from_secs(2),
//!     )
//!     .await?;
//! assert_eq!(&reply.payload[..], b"5");
//!
//! sub.drain().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod middleware;
pub mod retry;
pub mod testing;

pub use bus::broker::BrokerClient;
pub use bus::{ConnectionState, MessageBus, Subscription, SubscriptionState, SyncSubscription};
pub use config::{BusConfig, TlsConfig};
pub use error::{BusError, BusResult};
pub use message::{Headers, Message, ERROR_HEADER};
pub use middleware::{compose, handler_fn, LogMiddleware, MessageHandler, Middleware};
pub use retry::{with_retries, RetryPolicy};
