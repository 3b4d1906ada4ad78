//! The seam between the connection manager and the MQTT client library.
//!
//! A [`Connector`] opens a [`Link`]: a request handle ([`BrokerClient`]) plus
//! a stream of [`LinkEvent`]s produced by a networking worker running on its
//! own task. The manager never touches the network itself, which keeps it
//! testable against a scripted broker.

use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Request queue is full")]
    QueueFull,

    #[error("Link is closed")]
    Closed,

    #[error("Invalid broker address: {0}")]
    Address(String),

    #[error("TLS is required for {0}")]
    TlsRequired(String),

    #[error("Broker request rejected: {0}")]
    Rejected(String),
}

/// Non-blocking request side of a broker session. Every call only queues.
pub trait BrokerClient: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> Result<(), LinkError>;

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError>;

    fn unsubscribe(&self, filter: &str) -> Result<(), LinkError>;

    fn disconnect(&self) -> Result<(), LinkError>;
}

/// What the networking worker observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { session_present: bool },
    Message { topic: String, payload: Vec<u8> },
    /// A publish was written; `pkid` is `0` for QoS 0.
    PublishSent { pkid: u16 },
    /// PUBACK for QoS 1, PUBCOMP for QoS 2.
    PublishAcked { pkid: u16 },
    SubscribeSent { pkid: u16 },
    SubscribeAcked { pkid: u16, granted: bool },
    ConnectionLost { reason: String },
    RetryScheduled { attempt: u32, delay: Duration },
    /// The scheduled retry is starting now.
    Attempting { attempt: u32 },
}

/// One broker session: request handle, event stream and the worker behind them.
pub struct Link {
    client: Box<dyn BrokerClient>,
    events: mpsc::Receiver<LinkEvent>,
    worker: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Link {
    pub fn new(
        client: Box<dyn BrokerClient>,
        events: mpsc::Receiver<LinkEvent>,
        worker: Option<JoinHandle<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            events,
            worker,
            cancel,
        }
    }

    pub fn client(&self) -> &dyn BrokerClient {
        self.client.as_ref()
    }

    /// `None` once the worker is gone.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Waits up to `grace` for the worker to finish on its own (after a
    /// DISCONNECT was queued), then cancels and aborts it.
    pub async fn shutdown(self, grace: Duration) {
        let Link {
            client,
            mut events,
            worker,
            cancel,
        } = self;

        if let Some(mut worker) = worker {
            let finished = tokio::time::timeout(grace, async {
                // The worker owns the only sender; draining keeps it from blocking.
                while events.recv().await.is_some() {}
                (&mut worker).await
            })
            .await;

            match finished {
                Ok(Ok(())) => debug!("Link worker finished"),
                Ok(Err(e)) => warn!("Link worker ended abnormally: {}", e),
                Err(_) => {
                    warn!("Link worker did not stop within {:?}, aborting", grace);
                    cancel.cancel();
                    worker.abort();
                }
            }
        }
        cancel.cancel();
        drop(client);
    }

    /// Stops the worker right away, without a DISCONNECT.
    pub async fn cancel(self) {
        let Link {
            events,
            worker,
            cancel,
            ..
        } = self;
        cancel.cancel();
        drop(events);
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Link worker ended abnormally: {}", e);
            }
        }
    }
}

/// Opens broker sessions. One call, one independent session.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> Result<Link, LinkError>;
}
