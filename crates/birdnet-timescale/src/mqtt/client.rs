//! Reconnecting MQTT client built on `rumqttc`.
//!
//! # Tasks
//!
//! ```text
//! ┌────────────┐  Publish   ┌──────────┐  bounded mpsc  ┌────────────┐
//! │ event loop │──► route ──►│ registry │──────────────►│ dispatcher │──► handler
//! └────────────┘            └──────────┘                └────────────┘
//!    │  ▲   │ ConnAck
//!    │  │   └──► spawn replay ──► SUBSCRIBE per registered topic
//!    │  └── SubAck / Outgoing::Subscribe resolve pending requests
//!    └── poll error: log, wait reconnect_delay, poll again (rumqttc reconnects)
//! ```
//!
//! `rumqttc` queues requests without reporting the packet id, so pending
//! subscribes are matched to their `Outgoing::Subscribe(pkid)` events in FIFO
//! order; a submit lock keeps that order identical to the request channel's.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, Publish, QoS,
    SubAck, SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::registry::{
    resubscribe_all, MessageHandler, SubscribeTransport, Subscription, SubscriptionRegistry,
};
use super::topic::validate_filter;
use super::{lock, Subscriber};
use crate::config::{BrokerAddress, MqttConfig};
use crate::error::{BridgeError, Result};

/// Capacity of the `rumqttc` request channel.
const REQUEST_CAPACITY: usize = 64;

type AckResult = std::result::Result<(), String>;

/// A subscribe request waiting for its SUBACK.
struct PendingSubscribe {
    topic: String,
    /// Binding to register on success; `None` for replays of existing entries.
    binding: Option<Subscription>,
    done: oneshot::Sender<AckResult>,
}

#[derive(Default)]
struct PendingAcks {
    /// Submitted to `rumqttc`, packet id not yet known.
    queued: VecDeque<PendingSubscribe>,
    /// Written to the socket, keyed by packet id.
    inflight: HashMap<u16, PendingSubscribe>,
}

/// State shared between the client handle, the event loop and replay tasks.
struct Shared {
    client: AsyncClient,
    registry: SubscriptionRegistry,
    pending: Mutex<PendingAcks>,
    /// Serializes "push pending + enqueue request" so FIFO matching holds.
    submit: tokio::sync::Mutex<()>,
    subscribe_timeout: Duration,
    closing: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingAcks> {
        lock(&self.pending)
    }

    /// Send a SUBSCRIBE and wait for the broker's answer.
    async fn request(&self, topic: &str, qos: QoS, binding: Option<Subscription>) -> Result<()> {
        let (done, answer) = oneshot::channel();
        {
            let _order = self.submit.lock().await;
            self.pending().queued.push_back(PendingSubscribe {
                topic: topic.to_string(),
                binding,
                done,
            });
            if let Err(e) = self.client.subscribe(topic, qos).await {
                // Still holding the submit lock, so ours is the last entry.
                self.pending().queued.pop_back();
                return Err(BridgeError::subscription(topic, e));
            }
        }

        match tokio::time::timeout(self.subscribe_timeout, answer).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(BridgeError::subscription(topic, reason)),
            Ok(Err(_)) => Err(BridgeError::subscription(topic, "MQTT event loop stopped")),
            Err(_) => Err(BridgeError::subscription(
                topic,
                format!("no SUBACK within {:?}", self.subscribe_timeout),
            )),
        }
    }

    fn on_outgoing_subscribe(&self, pkid: u16) {
        let mut pending = self.pending();
        match pending.queued.pop_front() {
            Some(request) => {
                pending.inflight.insert(pkid, request);
            }
            None => log::debug!("SUBSCRIBE {pkid} sent without a pending request"),
        }
    }

    fn on_suback(&self, ack: &SubAck) {
        let Some(request) = self.pending().inflight.remove(&ack.pkid) else {
            log::debug!("SUBACK {} matches no pending request", ack.pkid);
            return;
        };

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            let _ = request
                .done
                .send(Err("broker rejected the subscription".to_string()));
            return;
        }

        // Register before the event loop handles the next packet, so messages
        // right after the SUBACK (retained ones) already find their handler.
        // A caller that gave up waiting gets no registration.
        if let Some(binding) = request.binding {
            if request.done.is_closed() {
                log::warn!(
                    "SUBACK for '{}' arrived after the caller gave up",
                    request.topic
                );
                return;
            }
            self.registry.register(binding);
        }
        let _ = request.done.send(Ok(()));
    }

    /// Fail requests whose SUBSCRIBE went out on a connection that is gone.
    fn fail_inflight(&self, reason: &str) {
        let drained: Vec<PendingSubscribe> =
            self.pending().inflight.drain().map(|(_, req)| req).collect();
        for request in drained {
            log::debug!("Abandoning subscribe for '{}': {reason}", request.topic);
            let _ = request.done.send(Err(reason.to_string()));
        }
    }
}

#[async_trait]
impl SubscribeTransport for Shared {
    async fn resubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.request(&subscription.topic, subscription.qos, None).await
    }
}

/// A publish routed to its handler, waiting for the dispatcher.
struct Delivery {
    handler: Arc<dyn MessageHandler>,
    publish: Publish,
}

/// MQTT broker client that restores its subscriptions after every reconnect.
pub struct MqttClient {
    shared: Arc<Shared>,
    eventloop: Mutex<Option<EventLoop>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    disconnect_grace: Duration,
    dispatch_capacity: usize,
}

impl MqttClient {
    /// Build the client from configuration. No network traffic happens until
    /// [`connect`](Self::connect).
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let address = BrokerAddress::parse(&config.address)?;

        let mut options = MqttOptions::new(&config.client_id, &address.host, address.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(config.clean_session);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }
        if address.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(config.connect_timeout_secs);
        eventloop.set_network_options(network);

        log::debug!(
            "MQTT client '{}' configured for {}:{} (tls: {})",
            config.client_id,
            address.host,
            address.port,
            address.tls
        );

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                registry: SubscriptionRegistry::new(),
                pending: Mutex::new(PendingAcks::default()),
                submit: tokio::sync::Mutex::new(()),
                subscribe_timeout: config.subscribe_timeout(),
                closing: AtomicBool::new(false),
            }),
            eventloop: Mutex::new(Some(eventloop)),
            tasks: Mutex::new(Vec::new()),
            connect_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            disconnect_grace: config.disconnect_grace(),
            dispatch_capacity: config.dispatch_capacity,
        })
    }

    /// Start the event loop and wait for the first CONNACK.
    ///
    /// Later connection losses are retried by the event loop on its own.
    pub async fn connect(&self) -> Result<()> {
        let eventloop = lock(&self.eventloop)
            .take()
            .ok_or_else(|| BridgeError::Connection("connect already called".to_string()))?;

        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.dispatch_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = EventLoopDriver {
            eventloop,
            shared: self.shared.clone(),
            dispatch: dispatch_tx,
            ready: Some(ready_tx),
            reconnect_delay: self.reconnect_delay,
        };
        {
            let mut tasks = lock(&self.tasks);
            tasks.push(tokio::spawn(driver.run()));
            tasks.push(tokio::spawn(run_dispatcher(dispatch_rx)));
        }

        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.abort_tasks();
                Err(e)
            }
            Ok(Err(_)) => {
                self.abort_tasks();
                Err(BridgeError::Connection(
                    "event loop stopped before connecting".to_string(),
                ))
            }
            Err(_) => {
                self.abort_tasks();
                Err(BridgeError::ConnectTimeout(self.connect_timeout))
            }
        }
    }

    /// Remove a binding and tell the broker to stop delivering it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.shared.registry.remove(topic);
        self.shared
            .client
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::subscription(topic, e))?;
        log::info!("Unsubscribed from topic: {topic}");
        Ok(())
    }

    /// Send DISCONNECT and give in-flight packets the configured grace period.
    ///
    /// Subscriptions stay registered.
    pub async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.client.try_disconnect() {
            log::warn!("Failed to queue MQTT disconnect: {e}");
        }

        let handles = std::mem::take(&mut *lock(&self.tasks));
        let deadline = tokio::time::Instant::now() + self.disconnect_grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        log::info!("MQTT client disconnected");
    }

    /// Bindings currently registered for replay.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.all()
    }

    fn abort_tasks(&self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Subscriber for MqttClient {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        validate_filter(topic).map_err(|e| BridgeError::subscription(topic, e))?;
        let binding = Subscription::new(topic, qos, handler);
        self.shared.request(topic, qos, Some(binding)).await?;
        log::info!("Subscribed to topic: {topic} ({qos:?})");
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

struct EventLoopDriver {
    eventloop: EventLoop,
    shared: Arc<Shared>,
    dispatch: mpsc::Sender<Delivery>,
    ready: Option<oneshot::Sender<Result<()>>>,
    reconnect_delay: Duration,
}

impl EventLoopDriver {
    async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    log::info!(
                        "MQTT connection established (session present: {})",
                        ack.session_present
                    );
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    self.spawn_replay();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if !self.dispatch_publish(publish).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.shared.on_suback(&ack),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    self.shared.on_outgoing_subscribe(pkid)
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    log::debug!("MQTT DISCONNECT sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.shared.closing.load(Ordering::SeqCst) {
                        log::debug!("MQTT event loop closing: {e}");
                        break;
                    }
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Err(BridgeError::Connection(e.to_string())));
                        break;
                    }
                    log::error!("MQTT connection lost: {e}");
                    self.shared.fail_inflight("connection lost");
                    tokio::time::sleep(self.reconnect_delay).await;
                    log::warn!("MQTT attempting to reconnect");
                }
            }
        }
        self.shared.fail_inflight("client disconnected");
        log::debug!("MQTT event loop stopped");
    }

    /// Replay needs SUBACKs from this loop, so it runs on its own task.
    fn spawn_replay(&self) {
        let subscriptions = self.shared.registry.all();
        if subscriptions.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let total = subscriptions.len();
            let restored = resubscribe_all(shared.as_ref(), subscriptions).await;
            log::info!("Restored {restored}/{total} MQTT subscriptions");
        });
    }

    /// Returns `false` once the dispatcher is gone.
    async fn dispatch_publish(&mut self, publish: Publish) -> bool {
        let Some(handler) = self.shared.registry.route(&publish.topic) else {
            log::debug!("No subscription for message on '{}'", publish.topic);
            return true;
        };
        if self.dispatch.send(Delivery { handler, publish }).await.is_err() {
            log::warn!("MQTT dispatcher stopped, dropping event loop");
            return false;
        }
        true
    }
}

/// Run handlers one message at a time, in arrival order.
async fn run_dispatcher(mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some(Delivery { handler, publish }) = deliveries.recv().await {
        handler.handle(&publish.topic, &publish.payload).await;
    }
}
