//! presence_processor - Debounce tracked objects into per-camera presence.
//!
//! 1. Subscribes to tracked-object batches (`{prefix}/tracked/<camera>`)
//! 2. Keeps the best annotated frame per camera and label
//! 3. Publishes `ON`/`OFF` per label plus a retained JPEG snapshot
//! 4. Optionally stores snapshots on disk and drives an HTTP event endpoint
//! 5. Serves current and best frames on a loopback HTTP API

use anyhow::Result;
use clap::Parser;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Event, Incoming};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use object_presence::config::ProcessorConfig;
use object_presence::transport::{
    connect_mqtt, parse_mqtt_endpoint, validate_loopback_addr, MqttSettings, TlsMaterials,
};
use object_presence::{
    load_font, parse_batch, AggregationEngine, BoxRenderer, DirectoryFrameStore,
    FilesystemSnapshotStore, Frame, HttpEventBoundaryNotifier, MqttNotifier, Pipeline,
    SnapshotApiConfig, SnapshotServer, TransitionDispatcher,
};

const PROCESSOR_NAME: &str = "presence_processor";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Aggregate tracked objects into debounced per-camera presence"
)]
struct Args {
    /// MQTT broker address (`host:port`, `mqtt://` or `mqtts://`).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT brokers.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (implied by mqtts://).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = PROCESSOR_NAME)]
    mqtt_client_id: String,

    /// Topic filter for incoming batches. Defaults to `{prefix}/tracked/+`.
    #[arg(long, env = "PRESENCE_BATCH_TOPIC")]
    batch_topic: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = ProcessorConfig::load()?;

    let endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&endpoint, &args.mqtt_broker_addr)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;
    let batch_topic = args.batch_topic.clone().unwrap_or_else(|| cfg.batch_topic());

    log::info!("Presence processor starting");
    log::info!(
        "  MQTT broker: {}:{} (TLS: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls
    );
    log::info!("  Batch topic: {}", batch_topic);
    log::info!("  Topic prefix: {}", cfg.topic_prefix);
    log::info!("  Frame directory: {}", cfg.frames.dir.display());
    log::info!(
        "  Min history: {}, best stale after: {}s",
        cfg.presence.min_history_len,
        cfg.presence.best_stale_secs
    );
    log::info!(
        "  Snapshots: {}",
        cfg.snapshot_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    log::info!("  Event endpoints: {}", cfg.event_endpoints.len());
    log::info!("  Font: {}", cfg.font_path.display());

    let store = Arc::new(DirectoryFrameStore::new(
        &cfg.frames.dir,
        cfg.frames.width,
        cfg.frames.height,
    )?);
    let engine = Arc::new(AggregationEngine::with_placeholder(
        store,
        Arc::new(build_renderer(&cfg)),
        cfg.presence,
        Frame::blank(cfg.frames.width, cfg.frames.height),
    ));

    let api = SnapshotServer::spawn(
        SnapshotApiConfig {
            addr: cfg.api_addr.clone(),
        },
        engine.clone(),
    )?;

    let (client, mut connection) = connect_mqtt(&MqttSettings {
        endpoint,
        client_id: args.mqtt_client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
        tls,
    })?;

    let mut dispatcher =
        TransitionDispatcher::new(Arc::new(MqttNotifier::new(client.clone(), &cfg.topic_prefix)));
    if let Some(dir) = &cfg.snapshot_dir {
        dispatcher = dispatcher.with_snapshot_store(Arc::new(FilesystemSnapshotStore::new(dir)?));
    }
    if !cfg.event_endpoints.is_empty() {
        dispatcher = dispatcher.with_event_boundary(Arc::new(HttpEventBoundaryNotifier::new(
            cfg.event_endpoints.clone(),
        )));
    }
    let (sender, pipeline) = Pipeline::spawn(engine.clone(), Arc::new(dispatcher), cfg.workers)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let client = client.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            if let Err(err) = client.try_disconnect() {
                log::warn!("MQTT disconnect failed: {}", err);
            }
        })?;
    }

    for event in connection.iter() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // Clean sessions drop subscriptions, so resubscribe on every connect.
                client.try_subscribe(batch_topic.clone(), QoS::AtMostOnce)?;
                log::info!("Subscribed to {}", batch_topic);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                match parse_batch(&publish.payload) {
                    Ok(batch) => sender.send(batch)?,
                    Err(err) => log::warn!(
                        "Skipping malformed batch on {}: {:#}",
                        String::from_utf8_lossy(&publish.topic),
                        err
                    ),
                }
            }
            Ok(_) => {}
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("MQTT connection error: {}. Reconnecting...", err);
                std::thread::sleep(Duration::from_secs(5));
            }
        }
    }

    log::info!("Shutting down");
    drop(sender);
    pipeline.join()?;
    engine.release_all();
    api.stop()?;
    Ok(())
}

fn build_renderer(cfg: &ProcessorConfig) -> BoxRenderer {
    let mut renderer = BoxRenderer::new();
    match load_font(&cfg.font_path) {
        Ok(font) => renderer = renderer.with_font(font),
        Err(err) => log::warn!("Box labels and timestamps disabled: {:#}", err),
    }
    for (camera, options) in &cfg.render_options {
        renderer = renderer.with_camera_options(camera.clone(), *options);
    }
    renderer
}
