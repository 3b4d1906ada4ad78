//! Connection manager: one broker session, its lifecycle and everything
//! that has to happen around a (re)connect.
//!
//! [`ConnectionManager`] is the caller-facing handle. All session work runs
//! on a single actor task that owns the [`Link`], the offline buffer and the
//! heartbeat; the handle only talks to it through [`ManagerAction`]s.
//! Subscriptions and the connection state live behind one mutex shared by
//! both sides, so `publish`, `subscribe` and `unsubscribe` decide
//! synchronously and never wait for the network.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ConnAck--> Connected
//!      ^                          |                      |
//!      +--------- failure --------+                network loss
//!                                                        v
//!                       Connected <--ConnAck-- Reconnecting (retries with backoff)
//!
//! any state --close()--> Closed
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rumqttc::QoS;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::ManagerSettings;
use super::keepalive::Heartbeat;
use super::link::{Connector, Link, LinkError, LinkEvent};
use super::message_manager::{Dispatcher, ManagerEvent, MqttMessage, PublishHandle};
use super::offline_buffer::{OfflineBuffer, Outbound};
use super::registry::{MessageCallback, Registry};
use super::rumqtt_link::RumqttConnector;
use crate::codec::{now_millis, StatusMessage};
use crate::naming::{DeviceNaming, TopicPlan};
use crate::tls::{TlsContext, TlsError, TlsMaterial};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Connection manager is closed")]
    Closed,

    #[error("Broker link: {0}")]
    Link(#[from] LinkError),

    #[error("TLS bootstrap: {0}")]
    Tls(#[from] TlsError),
}

#[derive(Debug)]
enum ManagerAction {
    Connect,
    Publish(Outbound),
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    Disconnect { done: oneshot::Sender<()> },
    Close { done: oneshot::Sender<()> },
}

struct Shared {
    state: ConnectionState,
    registry: Registry,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // Every update under the lock is a single assignment or Vec edit.
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one broker session. Not reusable after [`close`](Self::close).
pub struct ConnectionManager {
    plan: TopicPlan,
    actions: mpsc::UnboundedSender<ManagerAction>,
    shared: Arc<Mutex<Shared>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawns the manager task on the current tokio runtime.
    ///
    /// Observable events go to `events` when given. The receiver should be
    /// drained promptly; events that do not fit are dropped with a warning.
    pub fn new(
        naming: &DeviceNaming,
        settings: ManagerSettings,
        connector: Box<dyn Connector>,
        events: Option<mpsc::Sender<ManagerEvent>>,
    ) -> Self {
        let plan = naming.topic_plan();
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Disconnected,
            registry: Registry::new(),
        }));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let (dispatcher, _dispatch_task) = Dispatcher::spawn(events);

        let worker = ManagerWorker {
            heartbeat: Heartbeat::new(&settings.heartbeat, plan.heartbeat()),
            buffer: OfflineBuffer::new(settings.mqtt.offline_buffer),
            plan: plan.clone(),
            settings,
            connector,
            shared: shared.clone(),
            state_tx,
            dispatcher,
            link: None,
            unsent: VecDeque::new(),
            inflight: HashMap::new(),
            subs_unsent: VecDeque::new(),
            subs_inflight: HashMap::new(),
        };
        tokio::spawn(worker.run(actions_rx));

        info!("Connection manager created for {}", plan.client_id());
        Self {
            plan,
            actions,
            shared,
            state_rx,
        }
    }

    /// Manager on top of rumqttc. TLS addresses use the process-wide context,
    /// built from `material` if this is the first one.
    pub async fn with_tls_material(
        naming: &DeviceNaming,
        settings: ManagerSettings,
        material: Option<&TlsMaterial>,
        events: Option<mpsc::Sender<ManagerEvent>>,
    ) -> Result<Self, ManagerError> {
        let tls = match material {
            Some(material) => Some(TlsContext::shared(material).await?),
            None => TlsContext::cached(),
        };
        let connector =
            RumqttConnector::new(naming.client_id(), &settings.mqtt, &settings.backoff, tls)?;
        Ok(Self::new(naming, settings, Box::new(connector), events))
    }

    pub fn topics(&self) -> &TopicPlan {
        &self.plan
    }

    pub fn client_id(&self) -> &str {
        self.plan.client_id()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Resolves once the manager reports `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ManagerError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ManagerError::Closed)
    }

    /// Starts connecting in the background. A no-op unless disconnected.
    pub fn connect(&self) -> Result<(), ManagerError> {
        if self.state() == ConnectionState::Closed {
            return Err(ManagerError::Closed);
        }
        self.send(ManagerAction::Connect)
    }

    /// Queues a publish. Outside `Connected` and `Reconnecting` the returned
    /// handle is already resolved to `false`.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> PublishHandle {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            debug!("Publish to {} rejected while {}", topic, state);
            return PublishHandle::resolved(false);
        }

        let (done, handle) = PublishHandle::pending();
        let outbound = Outbound {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            done: Some(done),
        };
        match self.send(ManagerAction::Publish(outbound)) {
            Ok(()) => handle,
            Err(_) => PublishHandle::resolved(false),
        }
    }

    /// Registers or replaces the subscription for `filter`. It is sent to the
    /// broker now when connected, otherwise on the next connect.
    pub fn subscribe<F>(&self, filter: &str, qos: QoS, callback: F) -> Result<(), ManagerError>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        let mut shared = lock(&self.shared);
        if shared.state == ConnectionState::Closed {
            return Err(ManagerError::Closed);
        }
        shared.registry.upsert(filter, qos, callback);
        if shared.state == ConnectionState::Connected {
            self.send(ManagerAction::Subscribe {
                filter: filter.to_string(),
            })?;
        }
        Ok(())
    }

    /// Returns whether `filter` was registered.
    pub fn unsubscribe(&self, filter: &str) -> Result<bool, ManagerError> {
        let mut shared = lock(&self.shared);
        if shared.state == ConnectionState::Closed {
            return Err(ManagerError::Closed);
        }
        let removed = shared.registry.remove(filter);
        if removed && shared.state == ConnectionState::Connected {
            self.send(ManagerAction::Unsubscribe {
                filter: filter.to_string(),
            })?;
        }
        Ok(removed)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.shared).registry.filters()
    }

    /// Announces offline, releases the session and returns to `Disconnected`.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let (done, rx) = oneshot::channel();
        self.send(ManagerAction::Disconnect { done })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    /// Releases everything for good. Safe to call repeatedly.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(ManagerAction::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, action: ManagerAction) -> Result<(), ManagerError> {
        self.actions
            .send(action)
            .map_err(|_| ManagerError::Closed)
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Publish waiting for its outgoing packet id.
type Unsent = (QoS, Option<oneshot::Sender<bool>>);

struct ManagerWorker {
    plan: TopicPlan,
    settings: ManagerSettings,
    connector: Box<dyn Connector>,
    shared: Arc<Mutex<Shared>>,
    state_tx: watch::Sender<ConnectionState>,
    dispatcher: Dispatcher,
    link: Option<Link>,
    buffer: OfflineBuffer,
    heartbeat: Heartbeat,
    /// Queued on the link, in order, not yet written.
    unsent: VecDeque<Unsent>,
    /// Written QoS 1/2 publishes by packet id.
    inflight: HashMap<u16, Option<oneshot::Sender<bool>>>,
    subs_unsent: VecDeque<String>,
    subs_inflight: HashMap<u16, String>,
}

async fn next_link_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link.as_mut() {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

impl ManagerWorker {
    async fn run(mut self, mut actions: mpsc::UnboundedReceiver<ManagerAction>) {
        loop {
            tokio::select! {
                action = actions.recv() => {
                    let Some(action) = action else {
                        debug!("Manager handle dropped, closing");
                        self.teardown(ConnectionState::Closed).await;
                        break;
                    };
                    if self.handle_action(action).await == Flow::Stop {
                        break;
                    }
                }
                event = next_link_event(&mut self.link) => self.handle_link_event(event).await,
                _ = self.heartbeat.tick() => self.beat(),
            }
        }
        debug!("Manager task for {} stopped", self.plan.client_id());
    }

    fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = std::mem::replace(&mut lock(&self.shared).state, next);
        if next != ConnectionState::Connected && self.heartbeat.is_running() {
            debug!("Stopping heartbeat");
            self.heartbeat.stop();
        }
        if previous != next {
            self.notify_state(next);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        info!("Connection state: {}", state);
        self.state_tx.send_replace(state);
        self.dispatcher.event(ManagerEvent::StateChanged(state));
    }

    async fn handle_action(&mut self, action: ManagerAction) -> Flow {
        match action {
            ManagerAction::Connect => self.open_link(),
            ManagerAction::Publish(outbound) => match self.state() {
                ConnectionState::Connected => self.send_publish(outbound),
                ConnectionState::Reconnecting => {
                    debug!("Buffering publish to {} until reconnected", outbound.topic);
                    if let Some(dropped) = self.buffer.push(outbound) {
                        self.dispatcher.complete(dropped.done, false);
                    }
                }
                state => {
                    debug!("Dropping publish to {} while {}", outbound.topic, state);
                    self.dispatcher.complete(outbound.done, false);
                }
            },
            ManagerAction::Subscribe { filter } => {
                let qos = {
                    let shared = lock(&self.shared);
                    (shared.state == ConnectionState::Connected)
                        .then(|| shared.registry.qos_of(&filter))
                        .flatten()
                };
                if let Some(qos) = qos {
                    self.send_subscribe(filter, qos);
                }
            }
            ManagerAction::Unsubscribe { filter } => {
                if let (ConnectionState::Connected, Some(link)) = (self.state(), &self.link) {
                    debug!("Unsubscribing from {}", filter);
                    if let Err(e) = link.client().unsubscribe(&filter) {
                        warn!("Unsubscribe from {} failed: {}", filter, e);
                    }
                }
            }
            ManagerAction::Disconnect { done } => {
                self.teardown(ConnectionState::Disconnected).await;
                let _ = done.send(());
            }
            ManagerAction::Close { done } => {
                self.teardown(ConnectionState::Closed).await;
                let _ = done.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn open_link(&mut self) {
        let state = self.state();
        if state != ConnectionState::Disconnected || self.link.is_some() {
            debug!("connect() ignored while {}", state);
            return;
        }

        match self.connector.open() {
            Ok(link) => {
                self.link = Some(link);
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => {
                error!("Could not open broker session: {}", e);
                self.dispatcher.event(ManagerEvent::ConnectFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(event) = event else {
            self.on_link_ended().await;
            return;
        };

        match event {
            LinkEvent::Connected { session_present } => self.on_connected(session_present),
            LinkEvent::Message { topic, payload } => {
                let callback = lock(&self.shared)
                    .registry
                    .find_first(&topic)
                    .map(|subscription| subscription.callback.clone());
                match callback {
                    Some(callback) => self
                        .dispatcher
                        .message(callback, MqttMessage::new(topic, payload)),
                    None => warn!("No subscription matches {}, dropping message", topic),
                }
            }
            LinkEvent::PublishSent { pkid } => {
                if pkid != 0 && self.inflight.contains_key(&pkid) {
                    // Retransmission of an unacknowledged publish after a reconnect.
                    return;
                }
                match self.unsent.pop_front() {
                    Some((QoS::AtMostOnce, done)) => self.dispatcher.complete(done, true),
                    Some((_, done)) => {
                        self.inflight.insert(pkid, done);
                    }
                    None => debug!("Untracked publish written (pkid {})", pkid),
                }
            }
            LinkEvent::PublishAcked { pkid } => {
                if let Some(done) = self.inflight.remove(&pkid) {
                    self.dispatcher.complete(done, true);
                }
            }
            LinkEvent::SubscribeSent { pkid } => {
                if let Some(filter) = self.subs_unsent.pop_front() {
                    self.subs_inflight.insert(pkid, filter);
                }
            }
            LinkEvent::SubscribeAcked { pkid, granted } => {
                if let Some(filter) = self.subs_inflight.remove(&pkid) {
                    if granted {
                        debug!("Subscribed to {}", filter);
                    } else {
                        warn!("Broker refused subscription to {}", filter);
                        self.dispatcher.event(ManagerEvent::SubscribeFailed {
                            filter,
                            reason: "refused by broker".to_string(),
                        });
                    }
                }
            }
            LinkEvent::ConnectionLost { reason } => self.on_connection_lost(reason).await,
            LinkEvent::RetryScheduled { attempt, delay } => {
                self.dispatcher
                    .event(ManagerEvent::Retrying { attempt, delay });
            }
            LinkEvent::Attempting { attempt } => {
                if self.state() == ConnectionState::Disconnected && self.link.is_some() {
                    debug!("Retry attempt {} starting", attempt);
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    fn on_connected(&mut self, session_present: bool) {
        let previous = self.state();
        if matches!(
            previous,
            ConnectionState::Closed | ConnectionState::Disconnected
        ) {
            debug!("Ignoring ConnAck while {}", previous);
            return;
        }
        info!(
            "Connected as {} (session present: {})",
            self.plan.client_id(),
            session_present
        );

        if !self.buffer.is_empty() {
            debug!("Flushing offline buffer");
        }
        for outbound in self.buffer.drain() {
            self.send_publish(outbound);
        }

        let failures = {
            let mut shared = lock(&self.shared);
            shared.state = ConnectionState::Connected;
            match self.link.as_ref() {
                Some(link) => {
                    let subs_unsent = &mut self.subs_unsent;
                    shared.registry.resubscribe_all(|filter, qos| {
                        debug!("Subscribing to {} ({:?})", filter, qos);
                        link.client().subscribe(filter, qos)?;
                        subs_unsent.push_back(filter.to_string());
                        Ok::<(), LinkError>(())
                    })
                }
                None => Vec::new(),
            }
        };
        for (filter, e) in failures {
            warn!("Resubscribing {} failed: {}", filter, e);
            self.dispatcher.event(ManagerEvent::SubscribeFailed {
                filter,
                reason: e.to_string(),
            });
        }

        self.publish_status(true);
        self.heartbeat.start();
        if previous != ConnectionState::Connected {
            self.notify_state(ConnectionState::Connected);
        }
    }

    async fn on_connection_lost(&mut self, reason: String) {
        self.heartbeat.stop();
        // SUBACKs of the lost session will never arrive. Subscribes still
        // queued on the client are written after the reconnect, in order.
        self.subs_inflight.clear();

        let auto_reconnect = self.settings.mqtt.auto_reconnect;
        match self.state() {
            ConnectionState::Connected => {
                warn!("Connection lost: {}", reason);
                if auto_reconnect {
                    self.set_state(ConnectionState::Reconnecting);
                } else {
                    self.set_state(ConnectionState::Disconnected);
                    self.drop_link().await;
                }
            }
            ConnectionState::Connecting => {
                warn!("Connection attempt failed: {}", reason);
                self.dispatcher
                    .event(ManagerEvent::ConnectFailed { reason });
                self.set_state(ConnectionState::Disconnected);
                if !auto_reconnect {
                    self.drop_link().await;
                }
            }
            ConnectionState::Reconnecting => debug!("Reconnect attempt failed: {}", reason),
            state => debug!("Ignoring connection loss while {}", state),
        }
    }

    async fn on_link_ended(&mut self) {
        warn!("Broker link worker ended");
        if let Some(link) = self.link.take() {
            link.cancel().await;
        }
        self.fail_outstanding();
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel().await;
        }
        self.fail_outstanding();
    }

    /// Best-effort offline announcement, then the session is released.
    async fn teardown(&mut self, target: ConnectionState) {
        let was_connected = self.state() == ConnectionState::Connected;
        if was_connected {
            self.publish_status(false);
        }
        self.set_state(target);

        if let Some(link) = self.link.take() {
            if was_connected {
                if let Err(e) = link.client().disconnect() {
                    debug!("DISCONNECT not queued: {}", e);
                }
                link.shutdown(self.settings.mqtt.teardown_timeout()).await;
            } else {
                // Nothing to flush while no session is up.
                link.cancel().await;
            }
        }
        self.fail_outstanding();
    }

    fn fail_outstanding(&mut self) {
        for outbound in self.buffer.drain() {
            self.dispatcher.complete(outbound.done, false);
        }
        for (_, done) in self.unsent.drain(..) {
            self.dispatcher.complete(done, false);
        }
        for (_, done) in self.inflight.drain() {
            self.dispatcher.complete(done, false);
        }
        self.subs_unsent.clear();
        self.subs_inflight.clear();
    }

    fn send_publish(&mut self, outbound: Outbound) {
        let Some(link) = self.link.as_ref() else {
            self.dispatcher.complete(outbound.done, false);
            return;
        };
        let Outbound {
            topic,
            payload,
            qos,
            retain,
            done,
        } = outbound;

        debug!("Publishing {} bytes to {} ({:?})", payload.len(), topic, qos);
        match link.client().publish(&topic, payload, qos, retain) {
            Ok(()) => self.unsent.push_back((qos, done)),
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                self.dispatcher.complete(done, false);
            }
        }
    }

    fn send_subscribe(&mut self, filter: String, qos: QoS) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        debug!("Subscribing to {} ({:?})", filter, qos);
        match link.client().subscribe(&filter, qos) {
            Ok(()) => self.subs_unsent.push_back(filter),
            Err(e) => {
                warn!("Subscribe to {} failed: {}", filter, e);
                self.dispatcher.event(ManagerEvent::SubscribeFailed {
                    filter,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn publish_status(&mut self, online: bool) {
        let status = StatusMessage::new(
            self.plan.client_id(),
            online,
            self.plan.role(),
            self.plan.instance(),
            None,
            now_millis(),
        );
        let payload = match status.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode status: {}", e);
                return;
            }
        };
        self.send_publish(Outbound {
            topic: self.plan.status().to_string(),
            payload,
            qos: QoS::AtLeastOnce,
            retain: true,
            done: None,
        });
    }

    fn beat(&mut self) {
        if lock(&self.shared).state != ConnectionState::Connected {
            self.heartbeat.stop();
            return;
        }
        let outbound = Outbound {
            topic: self.heartbeat.topic().to_string(),
            payload: self.heartbeat.payload().to_vec(),
            qos: QoS::AtMostOnce,
            retain: false,
            done: None,
        };
        self.send_publish(outbound);
    }
}
