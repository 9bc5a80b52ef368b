//! Embedded MQTT broker using rumqttd
//!
//! Optional. Lets a single-node deployment receive the alert mirror without
//! running a separate broker.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

/// Alert payloads are small; keep inbound packets well under rumqttd's default
const MAX_PAYLOAD_BYTES: usize = 65_536;

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 4,
        max_connections: 1000,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_BYTES,
                max_inflight_count: 100,
                auth: None,
                dynamic_filters: true,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread when `[broker] enabled`
///
/// Returns false if the broker is disabled or the bind address is invalid.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let addr = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = match addr.parse() {
        Ok(listen) => listen,
        Err(e) => {
            warn!(error = %e, addr = %addr, "broker_invalid_bind_address");
            return false;
        }
    };

    let config = broker_config(listen);
    let spawned = thread::Builder::new().name("mqtt-broker".to_string()).spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the lifetime of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });
    if let Err(e) = spawned {
        warn!(error = %e, "broker_thread_spawn_failed");
        return false;
    }

    // Give the listener a moment before the egress client connects
    thread::sleep(std::time::Duration::from_millis(100));
    info!(addr = %listen, "broker_started");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_broker_not_started() {
        assert!(!start_embedded_broker(&AppConfig::default()));
    }

    #[test]
    fn test_broker_config_listens_on_v4() {
        let listen: SocketAddr = "127.0.0.1:18830".parse().unwrap();
        let config = broker_config(listen);
        let servers = config.v4.unwrap();
        let v4 = &servers["v4"];
        assert_eq!(v4.listen, listen);
        assert_eq!(v4.connections.max_payload_size, MAX_PAYLOAD_BYTES);
    }
}
