//! MQTT connectivity layer for forklift-fleet front-ends.
//!
//! ```text
//! naming   - DeviceNaming and the TopicPlan derived from it
//! tls      - mutual-TLS bootstrap, cached once per process
//! codec    - JSON envelopes (move, status, progress, telemetry)
//! mqtt     - ConnectionManager, registry, dispatcher, link, heartbeat
//! forklift - typed command / telemetry facade over the manager
//! config   - TOML application config
//! ```

pub mod codec;
pub mod config;
pub mod forklift;
pub mod mqtt;
pub mod naming;
pub mod tls;

pub use forklift::{ForkliftClient, ForkliftError};
pub use mqtt::{ConnectionManager, ConnectionState, ManagerEvent, ManagerSettings, PublishHandle};
pub use naming::{DeviceNaming, TopicPlan};
pub use tls::{TlsContext, TlsError, TlsMaterial};
