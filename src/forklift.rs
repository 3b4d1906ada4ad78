//! Typed forklift protocol on top of the [`ConnectionManager`].
//!
//! Front-ends send move commands and listen for pose, ack and progress
//! updates; devices report progress and every app instance publishes its
//! presence. Inbound payloads are decoded inside the subscription callbacks
//! and surfaced as [`ManagerEvent`]s.

use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{self, MoveCommand, ProgressMessage, StatusMessage};
use crate::mqtt::{ConnectionManager, ManagerError, ManagerEvent, PublishHandle};

#[derive(Debug, thiserror::Error)]
pub enum ForkliftError {
    #[error("Required field is blank: {0}")]
    MissingField(&'static str),

    #[error("Could not encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub struct ForkliftClient {
    manager: Arc<ConnectionManager>,
}

impl ForkliftClient {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Subscribes to the unit's telemetry (of `source`, default: own
    /// instance), ack and progress topics. Decoded updates go to `events`.
    pub fn attach(
        &self,
        events: mpsc::Sender<ManagerEvent>,
        source: Option<&str>,
    ) -> Result<(), ForkliftError> {
        let topics = self.manager.topics();
        let telemetry = match source {
            Some(instance) => topics.telemetry_for(instance),
            None => topics.telemetry(),
        };

        let tx = events.clone();
        self.manager
            .subscribe(&telemetry, QoS::AtLeastOnce, move |topic, payload| {
                match codec::parse_pose(payload) {
                    Some(pose) => forward(&tx, ManagerEvent::Pose(pose)),
                    None => warn!("Dropping malformed telemetry on {}", topic),
                }
            })?;

        let tx = events.clone();
        self.manager
            .subscribe(topics.ack(), QoS::AtLeastOnce, move |_, payload| {
                let ack = String::from_utf8_lossy(payload).into_owned();
                forward(&tx, ManagerEvent::Ack(ack));
            })?;

        let tx = events;
        self.manager
            .subscribe(topics.progress(), QoS::AtLeastOnce, move |topic, payload| {
                match ProgressMessage::parse(payload) {
                    Some(progress) => forward(&tx, ManagerEvent::Progress(progress)),
                    None => warn!("Dropping malformed progress on {}", topic),
                }
            })?;

        debug!("Forklift subscriptions registered for {}", topics.base());
        Ok(())
    }

    /// Sends a `move_to` command to the unit. Blank fields are refused.
    pub fn send_move(
        &self,
        target_uid: &str,
        destination: &str,
    ) -> Result<PublishHandle, ForkliftError> {
        if target_uid.trim().is_empty() {
            return Err(ForkliftError::MissingField("target_uid"));
        }
        if destination.trim().is_empty() {
            return Err(ForkliftError::MissingField("destination"));
        }

        let command = MoveCommand::new(
            target_uid,
            destination,
            self.manager.client_id(),
            codec::now_millis(),
        );
        let payload = command.encode()?;
        Ok(self
            .manager
            .publish(self.manager.topics().command(), payload, QoS::AtLeastOnce, false))
    }

    pub fn send_progress(
        &self,
        stage: &str,
        detail: Option<&str>,
    ) -> Result<PublishHandle, ForkliftError> {
        if stage.trim().is_empty() {
            return Err(ForkliftError::MissingField("stage"));
        }
        let progress =
            ProgressMessage::new(self.manager.client_id(), stage, detail, codec::now_millis());
        Ok(self.manager.publish(
            self.manager.topics().progress(),
            progress.encode()?,
            QoS::AtLeastOnce,
            false,
        ))
    }

    /// Retained presence with an optional free-form `extra`.
    pub fn publish_status(
        &self,
        online: bool,
        extra: Option<&str>,
    ) -> Result<PublishHandle, ForkliftError> {
        let topics = self.manager.topics();
        let status = StatusMessage::new(
            topics.client_id(),
            online,
            topics.role(),
            topics.instance(),
            extra,
            codec::now_millis(),
        );
        Ok(self
            .manager
            .publish(topics.status(), status.encode()?, QoS::AtLeastOnce, true))
    }
}

fn forward(tx: &mpsc::Sender<ManagerEvent>, event: ManagerEvent) {
    if let Err(e) = tx.try_send(event) {
        warn!("Forklift event receiver not keeping up: {}", e);
    }
}
