//! MQTT connection setup for the processor.
//!
//! - `parse_mqtt_endpoint` / `validate_loopback_addr`: broker address handling;
//!   remote brokers need an explicit opt-in.
//! - `TlsMaterials`: PEM files for broker verification and client auth.
//! - `connect_mqtt`: builds the v5 sync client that both subscribes to batches
//!   and publishes presence.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{Client, Connection, MqttOptions};
use rumqttc::Transport;
use std::path::Path;
use std::time::Duration;

/// Capacity of the client request channel. Publishes beyond it fail fast
/// until the connection drains the queue.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// PEM material for MQTT over TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate used to verify the broker.
    /// When None, the webpki roots bundled with rumqttc are trusted.
    pub ca: Option<Vec<u8>>,

    /// Client certificate and key (cert, key) for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Read TLS material from the paths given on the command line.
    ///
    /// Every path is optional, but a client certificate and its key must come
    /// together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path.map(|path| read_pem(path, "CA")).transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => Some((
                read_pem(cert_path, "client cert")?,
                read_pem(key_path, "client key")?,
            )),
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    /// True when a CA or client identity was supplied.
    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Transport for `endpoint`.
    ///
    /// Plain TCP refuses TLS material so a forgotten `mqtts://` does not
    /// silently drop verification. Client identities need an explicit CA.
    fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled; \
                     use --mqtt-use-tls or an mqtts:// address"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

/// Connection parameters for `connect_mqtt`.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
}

/// Build a sync MQTT v5 client. The connection is established lazily when
/// the returned `Connection` is iterated.
pub fn connect_mqtt(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = &settings.endpoint;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = &settings.username {
        options.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    options.set_transport(settings.tls.build_transport(endpoint)?);

    let (client, connection) = Client::new(options, REQUEST_CHANNEL_CAPACITY);
    log::info!(
        "MQTT client configured for {}:{} (TLS: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

/// Parse an MQTT broker address.
///
/// Accepts `host:port`, `[ipv6]:port`, and the `mqtt://`, `tcp://`, `mqtts://`
/// and `ssl://` schemes. The secure schemes force TLS on.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

/// Reject brokers outside this host unless remote brokers were allowed.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (use --allow-remote-mqtt to override)",
        original
    ))
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

/// Split `host:port` or `[ipv6]:port`. The port is required.
fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}
