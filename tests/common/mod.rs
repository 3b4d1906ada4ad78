#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forklift_link::mqtt::{BrokerClient, Connector, Link, LinkError, LinkEvent, QoS};
use forklift_link::{ConnectionManager, DeviceNaming, ManagerEvent, ManagerSettings};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Disconnect,
}

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<Call>>,
    links: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
    reject_filter: Mutex<Option<String>>,
    fail_open: AtomicBool,
    opens: AtomicUsize,
}

/// Scripted broker: records every request and lets the test play the
/// network side by injecting [`LinkEvent`]s into the latest session.
#[derive(Clone, Default)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn reject_subscribe(&self, filter: &str) {
        *self.inner.reject_filter.lock().unwrap() = Some(filter.to_string());
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub async fn inject(&self, event: LinkEvent) {
        let tx = self
            .inner
            .links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session opened");
        let _ = tx.send(event).await;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().unwrap().clear();
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish {
                    topic: t, payload, ..
                } if t == topic => Some(payload),
                _ => None,
            })
            .collect()
    }
}

impl Connector for FakeBroker {
    fn open(&self) -> Result<Link, LinkError> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::Address("unreachable".to_string()));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.inner.links.lock().unwrap().push(tx);
        let client = FakeClient {
            inner: self.inner.clone(),
        };
        Ok(Link::new(
            Box::new(client),
            rx,
            None,
            CancellationToken::new(),
        ))
    }
}

struct FakeClient {
    inner: Arc<Inner>,
}

impl FakeClient {
    fn record(&self, call: Call) {
        self.inner.calls.lock().unwrap().push(call);
    }
}

impl BrokerClient for FakeClient {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError> {
        self.record(Call::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        if self.inner.reject_filter.lock().unwrap().as_deref() == Some(filter) {
            return Err(LinkError::Rejected(filter.to_string()));
        }
        self.record(Call::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.record(Call::Unsubscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.record(Call::Disconnect);
        Ok(())
    }
}

pub fn naming() -> DeviceNaming {
    DeviceNaming::new("wh01", "A", "fl01", "ph", "01")
}

pub fn settings() -> ManagerSettings {
    let mut settings = ManagerSettings::default();
    settings.heartbeat.enabled = false;
    settings.mqtt.teardown_timeout_ms = 200;
    settings
}

pub fn manager_with(
    settings: ManagerSettings,
) -> (ConnectionManager, FakeBroker, mpsc::Receiver<ManagerEvent>) {
    let broker = FakeBroker::new();
    let (tx, rx) = mpsc::channel(256);
    let manager = ConnectionManager::new(&naming(), settings, Box::new(broker.clone()), Some(tx));
    (manager, broker, rx)
}

pub fn manager() -> (ConnectionManager, FakeBroker, mpsc::Receiver<ManagerEvent>) {
    manager_with(settings())
}

/// Connects and plays the ConnAck.
pub async fn connected(manager: &ConnectionManager, broker: &FakeBroker) {
    manager.connect().unwrap();
    wait_state(manager, forklift_link::ConnectionState::Connecting).await;
    broker
        .inject(LinkEvent::Connected {
            session_present: false,
        })
        .await;
    wait_state(manager, forklift_link::ConnectionState::Connected).await;
}

pub async fn wait_state(manager: &ConnectionManager, state: forklift_link::ConnectionState) {
    tokio::time::timeout(WAIT, manager.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("never reached {}", state))
        .unwrap();
}

/// Polls `condition` until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event matching `pick`, skipping the rest.
pub async fn next_event<T>(
    rx: &mut mpsc::Receiver<ManagerEvent>,
    mut pick: impl FnMut(ManagerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}
