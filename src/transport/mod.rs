//! MQTT transport helpers.
//!
//! Endpoint parsing, optional TLS material loading and client construction for
//! the processor binary, which both subscribes to tracked-object batches and
//! publishes presence on the same connection.

mod mqtt;

pub use mqtt::{
    connect_mqtt, parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, MqttSettings,
    TlsMaterials,
};
