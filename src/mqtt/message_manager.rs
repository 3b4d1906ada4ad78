//! The single execution context on which everything observable happens.
//!
//! Subscription callbacks, publish completions and [`ManagerEvent`]s are all
//! handed to one dispatcher task in the order the manager produced them.
//! Callers therefore never see a completion overtake the state change that
//! caused it, and callbacks never run concurrently with each other.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::mqtt_handler::ConnectionState;
use super::registry::MessageCallback;
use crate::codec::{Pose, ProgressMessage};

/// Everything the manager reports to the outside world.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagerEvent {
    StateChanged(ConnectionState),
    /// A connection attempt was refused or could not be established.
    ConnectFailed { reason: String },
    Retrying { attempt: u32, delay: Duration },
    SubscribeFailed { filter: String, reason: String },
    Pose(Pose),
    /// Raw acknowledgement payload from the device.
    Ack(String),
    Progress(ProgressMessage),
}

/// An inbound message as handed to a subscription callback.
#[derive(Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl MqttMessage {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        Self {
            topic,
            payload,
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(40).collect();
        write!(f, "{} - {} - {}", self.received_at.format("%H:%M:%S"), self.topic, preview)
    }
}

impl fmt::Debug for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MqttMessage({})", self)
    }
}

enum Delivery {
    Message {
        callback: MessageCallback,
        message: MqttMessage,
    },
    Event(ManagerEvent),
    Completion {
        done: oneshot::Sender<bool>,
        ok: bool,
    },
}

/// Sending side of the dispatcher. Never blocks.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    /// Starts the dispatcher task. Events are forwarded to `events` when given.
    pub fn spawn(events: Option<mpsc::Sender<ManagerEvent>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Message { callback, message } => {
                        let run = AssertUnwindSafe(|| callback(&message.topic, &message.payload));
                        if panic::catch_unwind(run).is_err() {
                            warn!("Callback panicked, dropped message {}", message);
                        }
                    }
                    Delivery::Event(event) => {
                        let Some(events) = events.as_ref() else {
                            continue;
                        };
                        if let Err(e) = events.try_send(event) {
                            warn!("Event receiver not keeping up, dropping event: {}", e);
                        }
                    }
                    Delivery::Completion { done, ok } => {
                        if done.send(ok).is_err() {
                            debug!("Publish completion dropped by caller");
                        }
                    }
                }
            }
            debug!("Dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    pub fn message(&self, callback: MessageCallback, message: MqttMessage) {
        self.deliver(Delivery::Message { callback, message });
    }

    pub fn event(&self, event: ManagerEvent) {
        self.deliver(Delivery::Event(event));
    }

    /// Resolves a publish completion; `None` means nobody is waiting.
    pub fn complete(&self, done: Option<oneshot::Sender<bool>>, ok: bool) {
        if let Some(done) = done {
            self.deliver(Delivery::Completion { done, ok });
        }
    }

    fn deliver(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            debug!("Dispatcher already stopped");
        }
    }
}

/// Outcome of one publish. Resolves to `true` once the broker took the
/// message, `false` otherwise. Dropping it only gives up interest.
#[derive(Debug)]
pub struct PublishHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(bool),
    Waiting(oneshot::Receiver<bool>),
}

impl PublishHandle {
    pub(crate) fn pending() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: HandleState::Waiting(rx),
            },
        )
    }

    pub(crate) fn resolved(ok: bool) -> Self {
        Self {
            state: HandleState::Ready(ok),
        }
    }

    /// Non-blocking check; `None` while the outcome is still open.
    pub fn try_outcome(&mut self) -> Option<bool> {
        match &mut self.state {
            HandleState::Ready(ok) => Some(*ok),
            HandleState::Waiting(rx) => match rx.try_recv() {
                Ok(ok) => {
                    self.state = HandleState::Ready(ok);
                    Some(ok)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = HandleState::Ready(false);
                    Some(false)
                }
            },
        }
    }
}

impl Future for PublishHandle {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.state {
            HandleState::Ready(ok) => Poll::Ready(*ok),
            HandleState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(outcome) => {
                    let ok = outcome.unwrap_or(false);
                    self.state = HandleState::Ready(ok);
                    Poll::Ready(ok)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
