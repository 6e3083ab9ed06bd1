//! # MQTT Sessions
//!
//! Both broker connections of the bridge (local telemetry ingest and dashboard
//! delivery) are instances of the same [`mqtt_handler::Session`] state machine
//! over a pluggable [`transport::Transport`].
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, credentials and per-session options
//! ├── message_manager.rs  - Inbound messages and the event channel back to the bridge
//! ├── transport.rs        - Transport trait and the rumqttc implementation
//! └── mqtt_handler.rs     - Connection state machine and reconnect supervision
//! ```
//!
//! Transports never call into the bridge. Inbound publishes and connection
//! loss are queued as [`message_manager::SessionEvent`]s and handled on the
//! bridge's own event loop, so session state only ever changes there.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;

#[cfg(test)]
pub mod mock;
