//! [`Connector`] backed by rumqttc.
//!
//! `EventLoop::poll` is not cancel safe while a connect is in progress, so the
//! event loop runs on a dedicated worker task and the manager only ever sees
//! translated [`LinkEvent`]s. The worker keeps polling through network
//! errors, pacing reconnect attempts with [`Backoff`], until a DISCONNECT is
//! written, every client handle is dropped or the link is cancelled.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::config::{BackoffConfig, BrokerAddress, MqttConfig};
use super::link::{BrokerClient, Connector, Link, LinkError, LinkEvent};
use crate::tls::TlsContext;

const EVENT_CAPACITY: usize = 256;

pub struct RumqttClient {
    client: AsyncClient,
}

impl From<ClientError> for LinkError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::TryRequest(_) => LinkError::QueueFull,
            ClientError::Request(_) => LinkError::Closed,
        }
    }
}

impl BrokerClient for RumqttClient {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(LinkError::from)
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_subscribe(filter, qos)
            .map_err(LinkError::from)
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.client.try_unsubscribe(filter).map_err(LinkError::from)
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.client.try_disconnect().map_err(LinkError::from)
    }
}

pub struct RumqttConnector {
    client_id: String,
    address: BrokerAddress,
    config: MqttConfig,
    backoff: BackoffConfig,
    tls: Option<TlsContext>,
}

impl RumqttConnector {
    /// Fails early when the address is malformed or asks for TLS without a context.
    pub fn new(
        client_id: impl Into<String>,
        config: &MqttConfig,
        backoff: &BackoffConfig,
        tls: Option<TlsContext>,
    ) -> Result<Self, LinkError> {
        let address =
            BrokerAddress::parse(&config.address).map_err(|e| LinkError::Address(e.to_string()))?;
        if address.is_tls() && tls.is_none() {
            return Err(LinkError::TlsRequired(address.to_string()));
        }

        Ok(Self {
            client_id: client_id.into(),
            address,
            config: config.clone(),
            backoff: backoff.clone(),
            tls,
        })
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.address.host.clone(),
            self.address.port,
        );
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs))
            .set_clean_session(self.config.clean_session)
            .set_inflight(self.config.max_inflight.max(1))
            .set_request_channel_capacity(self.config.request_channel_capacity.max(1));

        if let (true, Some(tls)) = (self.address.is_tls(), self.tls.as_ref()) {
            options.set_transport(tls.transport());
        }
        options
    }
}

impl Connector for RumqttConnector {
    fn open(&self) -> Result<Link, LinkError> {
        info!("Opening broker session to {} as {}", self.address, self.client_id);

        let (client, mut eventloop) =
            AsyncClient::new(self.options(), self.config.request_channel_capacity.max(1));
        eventloop
            .network_options
            .set_connection_timeout(self.config.connection_timeout_secs.max(1));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(drive(
            eventloop,
            events_tx,
            Backoff::from_config(&self.backoff),
            cancel.clone(),
        ));

        Ok(Link::new(
            Box::new(RumqttClient { client }),
            events_rx,
            Some(worker),
            cancel,
        ))
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Link worker cancelled");
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT written, stopping link worker");
                break;
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Broker accepted session (session present: {})", ack.session_present);
                backoff.reset();
                Some(LinkEvent::Connected {
                    session_present: ack.session_present,
                })
            }
            Ok(event) => translate(event),
            Err(ConnectionError::RequestsDone) => {
                debug!("All client handles dropped, stopping link worker");
                break;
            }
            Err(e) => {
                let reason = root_cause(&e);
                warn!("Broker connection error: {}", reason);
                if events.send(LinkEvent::ConnectionLost { reason }).await.is_err() {
                    break;
                }

                let delay = match backoff.next_sleep() {
                    Ok(delay) => delay,
                    Err(e) => {
                        error!("Giving up on broker: {}", e);
                        break;
                    }
                };
                let attempt = backoff.attempt();
                info!("Reconnect attempt {} in {:.2}s", attempt, delay.as_secs_f64());
                if events
                    .send(LinkEvent::RetryScheduled { attempt, delay })
                    .await
                    .is_err()
                {
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                Some(LinkEvent::Attempting { attempt })
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("Link events receiver dropped, stopping worker");
                break;
            }
        }
    }
}

fn translate(event: Event) -> Option<LinkEvent> {
    match event {
        Event::Incoming(Packet::Publish(publish)) => Some(LinkEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Event::Incoming(Packet::PubAck(ack)) => Some(LinkEvent::PublishAcked { pkid: ack.pkid }),
        Event::Incoming(Packet::PubComp(comp)) => {
            Some(LinkEvent::PublishAcked { pkid: comp.pkid })
        }
        Event::Incoming(Packet::SubAck(ack)) => Some(LinkEvent::SubscribeAcked {
            pkid: ack.pkid,
            granted: ack
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
        }),
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(LinkEvent::PublishSent { pkid }),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => Some(LinkEvent::SubscribeSent { pkid }),
        other => {
            trace!("Ignoring broker event {:?}", other);
            None
        }
    }
}

fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_address_needs_a_context() {
        let config = MqttConfig {
            address: "broker.example".into(),
            ..MqttConfig::default()
        };
        let result = RumqttConnector::new("c", &config, &BackoffConfig::default(), None);
        assert!(matches!(result, Err(LinkError::TlsRequired(_))));
    }

    #[test]
    fn plain_tcp_needs_no_context() {
        let config = MqttConfig {
            address: "tcp://127.0.0.1:1883".into(),
            ..MqttConfig::default()
        };
        let connector =
            RumqttConnector::new("c", &config, &BackoffConfig::default(), None).unwrap();
        assert_eq!(connector.address().port, 1883);
    }

    #[test]
    fn bad_address_is_rejected() {
        let config = MqttConfig {
            address: "ws://broker".into(),
            ..MqttConfig::default()
        };
        assert!(matches!(
            RumqttConnector::new("c", &config, &BackoffConfig::default(), None),
            Err(LinkError::Address(_))
        ));
    }

    #[test]
    fn acks_and_messages_are_translated() {
        use rumqttc::{PubAck, Publish, SubAck};

        let publish = Publish::new("fk/wh01/A/fl01/dev/ack", QoS::AtLeastOnce, b"{}".to_vec());
        assert_eq!(
            translate(Event::Incoming(Packet::Publish(publish))),
            Some(LinkEvent::Message {
                topic: "fk/wh01/A/fl01/dev/ack".into(),
                payload: b"{}".to_vec()
            })
        );
        assert_eq!(
            translate(Event::Incoming(Packet::PubAck(PubAck::new(7)))),
            Some(LinkEvent::PublishAcked { pkid: 7 })
        );
        assert_eq!(
            translate(Event::Incoming(Packet::SubAck(SubAck::new(
                3,
                vec![SubscribeReasonCode::Failure]
            )))),
            Some(LinkEvent::SubscribeAcked {
                pkid: 3,
                granted: false
            })
        );
        assert_eq!(translate(Event::Outgoing(Outgoing::PingReq)), None);
    }
}
