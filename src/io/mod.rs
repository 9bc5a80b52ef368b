//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http_api` - JSON HTTP API (hyper)
//! - `sessions` - Newline-delimited TCP push sessions
//! - `journal` - JSONL notification journal
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for egress messages
//! - `prometheus` - Prometheus text exposition

pub mod egress_channel;
pub mod http_api;
pub mod journal;
pub mod mqtt_egress;
pub mod prometheus;
pub mod sessions;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use http_api::{start_http_server, ApiState};
pub use journal::Journal;
pub use mqtt_egress::MqttPublisher;
pub use sessions::start_session_listener;
