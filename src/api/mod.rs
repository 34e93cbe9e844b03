//! Read-only HTTP API over the aggregation engine.
//!
//! Serves the latest annotated frame and the best frame per label as JPEG so a
//! dashboard can poll them without subscribing to MQTT.

use crate::engine::AggregationEngine;
use crate::notify::encode_jpeg;
use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct SnapshotApiConfig {
    pub addr: String,
}

impl Default for SnapshotApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5055".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct SnapshotApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SnapshotApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("snapshot api thread panicked"))?;
        }
        Ok(())
    }
}

pub struct SnapshotServer;

impl SnapshotServer {
    pub fn spawn(
        cfg: SnapshotApiConfig,
        engine: Arc<AggregationEngine>,
    ) -> Result<SnapshotApiHandle> {
        let configured_addr: SocketAddr = cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid snapshot api address '{}': {}", cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("snapshot-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, engine, shutdown_thread) {
                    log::error!("snapshot api stopped: {}", err);
                }
            })?;
        log::info!("snapshot api listening on {}", addr);

        Ok(SnapshotApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    engine: Arc<AggregationEngine>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &engine) {
                    log::warn!("snapshot api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Route<'a> {
    Health,
    Cameras,
    Latest { camera: &'a str },
    Best { camera: &'a str, label: &'a str },
}

fn route(path: &str) -> Option<Route<'_>> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => Some(Route::Health),
        ["cameras"] => Some(Route::Cameras),
        ["cameras", camera, "latest.jpg"] if !camera.is_empty() => {
            Some(Route::Latest { camera })
        }
        ["cameras", camera, label, "best.jpg"] if !camera.is_empty() && !label.is_empty() => {
            Some(Route::Best { camera, label })
        }
        _ => None,
    }
}

fn handle_connection(mut stream: TcpStream, engine: &AggregationEngine) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match route(&request.path) {
        Some(Route::Health) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Some(Route::Cameras) => {
            let payload = serde_json::to_vec(&engine.cameras())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Some(Route::Latest { camera }) => {
            let jpeg = encode_jpeg(&engine.current_frame(camera))?;
            write_response(&mut stream, 200, "image/jpeg", &jpeg)
        }
        Some(Route::Best { camera, label }) => match engine.best_frame(camera, label) {
            Some(frame) => {
                let jpeg = encode_jpeg(&frame)?;
                write_response(&mut stream, 200, "image/jpeg", &jpeg)
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"no_best_frame"}"#),
        },
        None => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
