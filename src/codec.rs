//! JSON envelopes exchanged over the forklift topics.
//!
//! Outbound envelopes (move command, status, progress) are serialized with
//! serde in field order, so the wire shape is stable. Inbound telemetry is
//! parsed leniently: anything that is not a JSON object with numeric `x` and
//! `y` yields `None` and never an error, so one broken payload cannot stall
//! the dispatch path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub const MOVE_TO: &str = "move_to";

/// Command sent to a device on `dev/cmd`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MoveCommand {
    pub target_uid: String,
    pub command: String,
    pub destination: String,
    pub from: String,
    pub req_id: u64,
    pub ts: u64,
}

impl MoveCommand {
    /// The request id doubles as the send timestamp.
    pub fn new(target_uid: &str, destination: &str, from: &str, now_ms: u64) -> Self {
        Self {
            target_uid: target_uid.trim().to_string(),
            command: MOVE_TO.to_string(),
            destination: destination.trim().to_string(),
            from: from.to_string(),
            req_id: now_ms,
            ts: now_ms,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Presence of an app instance, always published retained.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub online: bool,
    pub ts: u64,
    pub role: String,
    #[serde(rename = "inst")]
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl StatusMessage {
    pub fn new(
        client_id: &str,
        online: bool,
        role: &str,
        instance: &str,
        extra: Option<&str>,
        now_ms: u64,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            online,
            ts: now_ms,
            role: role.to_string(),
            instance: instance.to_string(),
            extra: extra.map(|e| e.trim().to_string()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Progress report on `dev/progress`. `detail` is serialized as `null` when absent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProgressMessage {
    pub from: String,
    pub stage: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub ts: u64,
}

impl ProgressMessage {
    pub fn new(from: &str, stage: &str, detail: Option<&str>, now_ms: u64) -> Self {
        Self {
            from: from.to_string(),
            stage: stage.trim().to_string(),
            detail: detail.map(|d| d.trim().to_string()),
            ts: now_ms,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Lenient counterpart of [`parse_pose`]; `None` for anything malformed.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match serde_json::from_slice(payload) {
            Ok(progress) => Some(progress),
            Err(e) => {
                debug!("Dropping malformed progress payload: {}", e);
                None
            }
        }
    }
}

/// Forklift position on the floor plan.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
}

/// Full telemetry sample; devices may add `heading` and a device-side `ts`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Telemetry {
    pub pose: Pose,
    pub heading: Option<f64>,
    pub ts: Option<u64>,
}

pub fn parse_telemetry(payload: &[u8]) -> Option<Telemetry> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("Telemetry payload is not JSON: {}", e);
            return None;
        }
    };

    let x = value.get("x").and_then(Value::as_f64);
    let y = value.get("y").and_then(Value::as_f64);
    let (Some(x), Some(y)) = (x, y) else {
        debug!("Telemetry payload lacks numeric x/y: {}", value);
        return None;
    };

    Some(Telemetry {
        pose: Pose { x, y },
        heading: value.get("heading").and_then(Value::as_f64),
        ts: value.get("ts").and_then(Value::as_u64),
    })
}

pub fn parse_pose(payload: &[u8]) -> Option<Pose> {
    parse_telemetry(payload).map(|telemetry| telemetry.pose)
}

/// Kind of a device-side uplink line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UplinkKind {
    Telemetry,
    Ack,
    Progress,
}

/// Routes one JSON line coming from the vehicle computer.
///
/// An explicit `t` field wins; unknown `t` values are unroutable. Without `t`,
/// a line carrying both `x` and `y` counts as telemetry.
pub fn classify_uplink(line: &str) -> Option<UplinkKind> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;

    if let Some(kind) = object.get("t") {
        return match kind.as_str()? {
            "telemetry" => Some(UplinkKind::Telemetry),
            "ack" => Some(UplinkKind::Ack),
            "progress" => Some(UplinkKind::Progress),
            _ => None,
        };
    }

    if object.contains_key("x") && object.contains_key("y") {
        Some(UplinkKind::Telemetry)
    } else {
        None
    }
}
