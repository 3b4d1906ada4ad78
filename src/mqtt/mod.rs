//! # MQTT Connectivity Module
//!
//! Owns the broker session of a forklift front-end: mutual-TLS connect,
//! automatic reconnect with subscription restore, offline buffering, the
//! application heartbeat and a single ordered event surface for callers.
//!
//! ## Why This Module Exists
//!
//! Tablets, phones and vehicle computers all speak to the same cloud broker
//! over flaky warehouse Wi-Fi. Every one of them needs the same guarantees:
//! - Subscriptions come back after every reconnect without caller involvement
//! - Commands issued during a short outage are delivered once the link returns
//! - Presence is visible to the rest of the fleet through a retained status
//! - Callers never block on the network
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, heartbeat and backoff settings, broker addresses
//! ├── mqtt_handler.rs     - ConnectionManager handle and its actor task
//! ├── message_manager.rs  - Dispatcher task, ManagerEvent, PublishHandle
//! ├── registry.rs         - Desired subscriptions and wildcard dispatch
//! ├── link.rs             - Connector / BrokerClient seam, LinkEvent
//! ├── rumqtt_link.rs      - rumqttc-backed connector and its event loop worker
//! ├── offline_buffer.rs   - Bounded, oldest-dropping outbound buffer
//! ├── keepalive.rs        - Application heartbeat
//! └── backoff.rs          - Reconnect pacing
//! ```
//!
//! ## Task Layout
//!
//! - **Caller threads** use [`ConnectionManager`] synchronously; publish,
//!   subscribe and unsubscribe only take the shared lock and queue work.
//! - **Manager task** owns the link, the offline buffer and the heartbeat and
//!   is the only place where the connection state changes.
//! - **Link worker** polls the rumqttc event loop and reports [`LinkEvent`]s.
//! - **Dispatcher task** runs subscription callbacks, resolves publish
//!   completions and forwards [`ManagerEvent`]s, strictly in order.

pub mod backoff;
pub mod config;
pub mod keepalive;
pub mod link;
pub mod message_manager;
pub mod mqtt_handler;
pub mod offline_buffer;
pub mod registry;
pub mod rumqtt_link;

pub use config::{BackoffConfig, BrokerAddress, HeartbeatConfig, ManagerSettings, MqttConfig};
pub use link::{BrokerClient, Connector, Link, LinkError, LinkEvent};
pub use message_manager::{ManagerEvent, MqttMessage, PublishHandle};
pub use mqtt_handler::{ConnectionManager, ConnectionState, ManagerError};
pub use registry::{topic_matches, MessageCallback, Registry};
pub use rumqttc::QoS;
