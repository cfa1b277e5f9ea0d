//! Broker client: impure I/O over the MQTT v5 transport
//!
//! Owns the single session to the broker. A supervisor task polls the
//! transport event loop, observes connection acknowledgements, disconnects
//! and transport errors, republishes session state, re-subscribes active
//! filters after a reconnect, and replays messages buffered while the
//! session was down. Reconnection runs indefinitely once a session has been
//! established; the initial connect fails fast.

use super::options;
use crate::bus::connection::{
    BufferPush, ConnectionState, ReconnectBuffer, DIAL_TIMEOUT, FLUSH_TIMEOUT, RECONNECT_DELAY,
};
use crate::bus::subscription::{self, Subscription, SubscriptionRegistry, SyncSubscription};
use crate::bus::MessageBus;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::middleware::MessageHandler;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The production [`MessageBus`] implementation.
pub struct BrokerClient {
    config: BusConfig,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: StdMutex<Option<EventLoop>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
    registry: Arc<SubscriptionRegistry>,
    buffer: Arc<StdMutex<ReconnectBuffer>>,
}

impl BrokerClient {
    /// Create a client from configuration. Validates the broker URL and TLS
    /// material; no network traffic happens until [`MessageBus::connect`].
    pub fn new(config: BusConfig) -> BusResult<Self> {
        let mqtt_options = options::configure_options(&config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, options::CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let buffer = ReconnectBuffer::new(config.effective_reconnect_buf_size());

        Ok(BrokerClient {
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: StdMutex::new(Some(event_loop)),
            state_tx,
            state_rx,
            shutdown_tx: None,
            supervisor: None,
            registry: Arc::new(SubscriptionRegistry::new()),
            buffer: Arc::new(StdMutex::new(buffer)),
        })
    }

    /// Wait until the supervisor observes a connection acknowledgement.
    async fn wait_for_connected(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> BusResult<()> {
        let wait = tokio::time::timeout(timeout, async {
            loop {
                match state_rx.borrow_and_update().clone() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        return Err(BusError::Connect(
                            "broker refused or dropped the connection".to_string(),
                        ))
                    }
                    ConnectionState::Closed => {
                        return Err(BusError::Connect("client closed".to_string()))
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(BusError::Connect(
                        "connection supervisor stopped".to_string(),
                    ));
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(BusError::Connect(format!(
                "no connection acknowledgement within {timeout:?}"
            ))),
        }
    }

    /// Sleep that stops early when shutdown is signalled. Returns false when
    /// the sleep was interrupted by shutdown.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Re-register every active filter after a reconnect.
    async fn resubscribe(client: &Arc<Mutex<AsyncClient>>, registry: &SubscriptionRegistry) {
        let client = client.lock().await;
        for (subject, group) in registry.active_subscriptions() {
            let filter = options::subscription_filter(&subject, group.as_deref());
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                error!(filter = %filter, error = %err, "re-subscribe failed");
            } else {
                debug!(filter = %filter, "re-subscribed");
            }
        }
    }

    /// Replay messages buffered while the session was down, in publish order.
    async fn replay_buffered(
        client: &Arc<Mutex<AsyncClient>>,
        buffer: &Arc<StdMutex<ReconnectBuffer>>,
    ) {
        let pending = {
            let mut buffer = buffer.lock().unwrap();
            buffer.drain_pending()
        };
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "replaying buffered messages");
        let client = client.lock().await;
        for msg in pending {
            let props = options::publish_properties(&msg);
            if let Err(err) = client
                .publish_with_properties(
                    msg.subject.clone(),
                    QoS::AtLeastOnce,
                    false,
                    msg.payload.clone(),
                    props,
                )
                .await
            {
                error!(subject = %msg.subject, error = %err, "buffered publish failed");
            }
        }
    }

    /// Schedule a reconnection attempt: back off, then swap in a fresh
    /// transport session. Returns false when shutdown interrupted the cycle.
    async fn reconnect_after_failure(
        config: &BusConfig,
        event_loop: &mut EventLoop,
        shared_client: &Arc<Mutex<AsyncClient>>,
        state_tx: &watch::Sender<ConnectionState>,
        shutdown_rx: watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> bool {
        *attempt += 1;
        let _ = state_tx.send(ConnectionState::Reconnecting(*attempt));
        info!(attempt = *attempt, delay = ?RECONNECT_DELAY, "scheduling reconnection");

        if !Self::interruptible_sleep(shutdown_rx.clone(), RECONNECT_DELAY).await {
            return false;
        }
        if *shutdown_rx.borrow() {
            return false;
        }

        match options::configure_options(config) {
            Ok(mqtt_options) => {
                let (new_client, new_event_loop) =
                    AsyncClient::new(mqtt_options, options::CHANNEL_CAPACITY);
                *event_loop = new_event_loop;
                *shared_client.lock().await = new_client;
                true
            }
            Err(err) => {
                // Keep polling the old session; the next error re-enters here.
                error!(error = %err, "failed to rebuild transport session");
                true
            }
        }
    }

    /// Supervisor loop: poll transport events, observe state changes, and
    /// keep the session alive until shutdown.
    async fn supervise(
        config: BusConfig,
        mut event_loop: EventLoop,
        shared_client: Arc<Mutex<AsyncClient>>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        registry: Arc<SubscriptionRegistry>,
        buffer: Arc<StdMutex<ReconnectBuffer>>,
    ) {
        let mut ever_connected = false;
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            ever_connected = true;
                            attempt = 0;
                            let _ = state_tx.send(ConnectionState::Connected);
                            info!("broker session established");
                            Self::resubscribe(&shared_client, &registry).await;
                            Self::replay_buffered(&shared_client, &buffer).await;
                        } else {
                            warn!(code = ?ack.code, "broker rejected the connection");
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            if !ever_connected {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = options::message_from_publish(&publish);
                        let delivered = registry.dispatch(&msg);
                        debug!(subject = %msg.subject, delivered, "message received");
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        warn!("broker disconnected the session");
                        if !Self::reconnect_after_failure(
                            &config,
                            &mut event_loop,
                            &shared_client,
                            &state_tx,
                            shutdown_rx.clone(),
                            &mut attempt,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if !ever_connected {
                            error!(error = %err, "initial connection failed");
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            break;
                        }
                        warn!(error = %err, "transport error");
                        if !Self::reconnect_after_failure(
                            &config,
                            &mut event_loop,
                            &shared_client,
                            &state_tx,
                            shutdown_rx.clone(),
                            &mut attempt,
                        )
                        .await
                        {
                            break;
                        }
                    }
                }
            }
        }
        debug!("connection supervisor stopped");
    }

    fn current_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn ensure_open(&self) -> BusResult<()> {
        match self.current_state() {
            ConnectionState::Closed => Err(BusError::NotConnected {
                state: ConnectionState::Closed,
            }),
            _ => Ok(()),
        }
    }

    /// Subscribe the filter with the broker when connected; otherwise the
    /// registration is picked up by the post-reconnect resubscription pass.
    async fn broker_subscribe(&self, subject: &str, group: Option<&str>) {
        if !self.current_state().is_connected() {
            return;
        }
        let filter = options::subscription_filter(subject, group);
        let client = self.client.lock().await;
        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            warn!(filter = %filter, error = %err, "subscribe deferred to reconnect");
        }
    }

    async fn subscribe_push(
        &self,
        subject: &str,
        group: Option<&str>,
        handler: MessageHandler,
    ) -> BusResult<Subscription> {
        self.ensure_open()?;
        let (id, rx) = self.registry.register(subject, group);
        let (cancel, worker) = subscription::spawn_worker(rx, handler);
        self.registry.attach_cancel(id, cancel);
        self.broker_subscribe(subject, group).await;
        Ok(Subscription::new(
            id,
            subject.to_string(),
            group.map(str::to_string),
            self.registry.clone(),
            worker,
        ))
    }

    async fn subscribe_pull(
        &self,
        subject: &str,
        group: Option<&str>,
    ) -> BusResult<SyncSubscription> {
        self.ensure_open()?;
        let (id, rx) = self.registry.register(subject, group);
        self.broker_subscribe(subject, group).await;
        Ok(SyncSubscription::new(
            id,
            subject.to_string(),
            group.map(str::to_string),
            self.registry.clone(),
            rx,
        ))
    }
}

#[async_trait]
impl MessageBus for BrokerClient {
    async fn connect(&mut self) -> BusResult<()> {
        let event_loop = self
            .event_loop
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BusError::Connect("client already started".to_string()))?;

        let _ = self.state_tx.send(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = tokio::spawn(Self::supervise(
            self.config.clone(),
            event_loop,
            self.client.clone(),
            self.state_tx.clone(),
            shutdown_rx,
            self.registry.clone(),
            self.buffer.clone(),
        ));
        self.supervisor = Some(supervisor);

        Self::wait_for_connected(self.state_rx.clone(), DIAL_TIMEOUT).await
    }

    fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        self.current_state()
    }

    fn headers_supported(&self) -> bool {
        // Headers ride MQTT v5 user properties, available on any established
        // session.
        self.current_state().is_connected()
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        self.publish_msg(Message::with_payload(subject, payload.to_vec()))
            .await
    }

    async fn publish_msg(&self, msg: Message) -> BusResult<()> {
        match self.current_state() {
            ConnectionState::Connected => {
                let props = options::publish_properties(&msg);
                let client = self.client.lock().await;
                client
                    .publish_with_properties(
                        msg.subject.clone(),
                        QoS::AtLeastOnce,
                        false,
                        msg.payload.clone(),
                        props,
                    )
                    .await
                    .map_err(|err| BusError::Publish(err.to_string()))
            }
            state if state.allows_buffering() => {
                let outcome = {
                    let mut buffer = self.buffer.lock().unwrap();
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
        self.subscribe_push(subject, None, handler).await
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: MessageHandler,
    ) -> BusResult<Subscription> {
        self.subscribe_push(subject, Some(group), handler).await
    }

    async fn subscribe_sync(&self, subject: &str) -> BusResult<SyncSubscription> {
        self.subscribe_pull(subject, None).await
    }

    async fn queue_subscribe_sync(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<SyncSubscription> {
        self.subscribe_pull(subject, Some(group)).await
    }

    async fn close(&mut self) {
        // Best-effort flush: give buffered messages until the flush timeout
        // to be replayed by a reconnect.
        let buffer = self.buffer.clone();
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async move {
            loop {
                if buffer.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if flushed.is_err() {
            warn!("closing with undelivered buffered messages");
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        {
            let client = self.client.lock().await;
            if let Err(err) = client.disconnect().await {
                debug!(error = %err, "disconnect on close failed");
            }
        }

        self.registry.close_all();
        self.buffer.lock().unwrap().clear();
        let _ = self.state_tx.send(ConnectionState::Closed);

        if let Some(supervisor) = self.supervisor.take() {
            match tokio::time::timeout(Duration::from_secs(2), supervisor).await {
                Ok(_) => debug!("supervisor shut down"),
                Err(_) => warn!("supervisor did not stop in time"),
            }
        }

        info!("bus client closed");
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        // Graceful teardown needs close(); this only stops background tasks.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler_fn;

    fn test_client() -> BrokerClient {
        BrokerClient::new(BusConfig::new("mqtt://localhost:1883", "unit-tests")).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let result = BrokerClient::new(BusConfig::new("not a url", "unit-tests"));
        assert!(matches!(result, Err(BusError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let client = test_client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.headers_supported());
    }

    #[tokio::test]
    async fn test_publish_fails_before_connect() {
        let client = test_client();
        let result = client.publish("events", b"x").await;
        assert!(matches!(
            result,
            Err(BusError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let mut client = test_client();
        client.close().await;

        assert_eq!(client.connection_state(), ConnectionState::Closed);
        let result = client.publish("events", b"x").await;
        assert!(matches!(
            result,
            Err(BusError::NotConnected {
                state: ConnectionState::Closed
            })
        ));
        let result = client.subscribe("events", handler_fn(|_msg| async {})).await;
        assert!(matches!(result, Err(BusError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_registers_locally() {
        let client = test_client();
        let sub = client
            .subscribe("events", handler_fn(|_msg| async {}))
            .await
            .unwrap();
        assert!(sub.is_active());
        assert_eq!(sub.subject(), "events");
        sub.unsubscribe().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_connected_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            BrokerClient::wait_for_connected(state_rx, Duration::from_millis(200)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connected_timeout() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let _keep_alive = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let result = BrokerClient::wait_for_connected(state_rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BusError::Connect(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connected_rejection() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected);
        });

        let result =
            BrokerClient::wait_for_connected(state_rx, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(BusError::Connect(_))));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(BrokerClient::interruptible_sleep(shutdown_rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        assert!(
            !BrokerClient::interruptible_sleep(shutdown_rx, Duration::from_millis(200)).await
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_from_caller_view() {
        let mut client = test_client();
        client.close().await;
        client.close().await;
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }
}
