//! Device naming and the fixed topic hierarchy derived from it.
//!
//! Every running client has exactly one identity: warehouse, line, unit, role
//! and instance. From these five fields the client identifier and all topics
//! are derived. Nothing here validates or trims; values are used as given.
//!
//! ```text
//! fk/{warehouse}/{line}/{unit}
//! ├── dev/cmd                          app    → device   (QoS 1)
//! ├── dev/ack                          device → app      (QoS 1)
//! ├── dev/progress                     device → app      (QoS 1)
//! ├── jet/{instance}/telemetry         device → app      (QoS 1)
//! └── app/{role}/{instance}/status     app    → all      (QoS 1, retained)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity fields of one client.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceNaming {
    pub warehouse: String,
    pub line: String,
    pub unit: String,
    /// `tb` for tablets, `ph` for phones, `esp` / `jet` for devices.
    pub role: String,
    pub instance: String,
}

impl Default for DeviceNaming {
    fn default() -> Self {
        Self::new("wh01", "A", "fl01", "ph", "01")
    }
}

impl DeviceNaming {
    pub fn new(
        warehouse: impl Into<String>,
        line: impl Into<String>,
        unit: impl Into<String>,
        role: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            warehouse: warehouse.into(),
            line: line.into(),
            unit: unit.into(),
            role: role.into(),
            instance: instance.into(),
        }
    }

    /// `forklift_{warehouse}-{line}-{unit}-{role}-{instance}`
    pub fn client_id(&self) -> String {
        format!(
            "forklift_{}-{}-{}-{}-{}",
            self.warehouse, self.line, self.unit, self.role, self.instance
        )
    }

    /// `fk/{warehouse}/{line}/{unit}`
    pub fn topic_base(&self) -> String {
        format!("fk/{}/{}/{}", self.warehouse, self.line, self.unit)
    }

    pub fn topic_plan(&self) -> TopicPlan {
        TopicPlan::from_naming(self)
    }
}

impl fmt::Display for DeviceNaming {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.client_id())
    }
}

/// The complete set of topics one client talks on.
///
/// Built once from a [`DeviceNaming`] and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicPlan {
    client_id: String,
    base: String,
    role: String,
    instance: String,
    command: String,
    ack: String,
    progress: String,
    status: String,
}

impl TopicPlan {
    pub fn from_naming(naming: &DeviceNaming) -> Self {
        let base = naming.topic_base();
        Self {
            client_id: naming.client_id(),
            command: format!("{base}/dev/cmd"),
            ack: format!("{base}/dev/ack"),
            progress: format!("{base}/dev/progress"),
            status: format!("{base}/app/{}/{}/status", naming.role, naming.instance),
            role: naming.role.clone(),
            instance: naming.instance.clone(),
            base,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn ack(&self) -> &str {
        &self.ack
    }

    pub fn progress(&self) -> &str {
        &self.progress
    }

    /// Telemetry of the naming's own instance.
    pub fn telemetry(&self) -> String {
        self.telemetry_for(&self.instance)
    }

    /// Telemetry of an arbitrary data source on the same unit.
    pub fn telemetry_for(&self, instance: &str) -> String {
        format!("{}/jet/{instance}/telemetry", self.base)
    }

    /// Always published retained.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Default heartbeat topic, `{client_id}/ping`.
    pub fn heartbeat(&self) -> String {
        format!("{}/ping", self.client_id)
    }
}
