//! Local control channel
//!
//! Line-delimited JSON over a Unix socket: the stand-in for the
//! management transport, delivering network-map snapshots to the two
//! reconcilers and serving status queries. One request per line, one
//! response per line.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wiremesh_common::{NetworkMap, PeerStatus, Result};

use crate::dns::DnsServer;
use crate::engine::Engine;

/// A control request, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Apply a network-map snapshot; the embedded DNS update is handed to
    /// the DNS reconciler under the same serial.
    Apply { map: NetworkMap },
    /// Report the applied serials and the active peer/registration sets.
    Status,
}

/// Response envelope mirroring the request framing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    fn ok(value: serde_json::Value) -> Self {
        Self {
            ok: Some(value),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: None,
            error: Some(message.into()),
        }
    }
}

/// Status payload returned for a `status` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub serial: u64,
    pub peers: Vec<PeerStatus>,
    pub dns_serial: u64,
    pub dns_domains: Vec<String>,
}

/// Accepts control connections and dispatches requests to the
/// reconcilers. The engine is shared behind a mutex so snapshot applies
/// serialize with status reads.
pub struct ControlServer {
    engine: Arc<Mutex<Engine>>,
    dns: Arc<DnsServer>,
    cancel: CancellationToken,
}

impl ControlServer {
    pub fn new(engine: Arc<Mutex<Engine>>, dns: Arc<DnsServer>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            dns,
            cancel,
        }
    }

    /// Bind the socket and serve until cancelled.
    pub async fn serve(self, socket_path: PathBuf) -> Result<()> {
        // a previous run may have left the socket file behind
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!("control socket listening on {}", socket_path.display());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("control accept failed: {}", e);
                            continue;
                        }
                    };
                    let engine = self.engine.clone();
                    let dns = self.dns.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, engine, dns).await {
                            debug!("control connection closed: {}", e);
                        }
                    });
                }
            }
        }

        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    engine: Arc<Mutex<Engine>>,
    dns: Arc<DnsServer>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&line, &engine, &dns).await;
        let payload = serde_json::to_string(&response)?;
        let writer = reader.get_mut();
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}

async fn dispatch(
    line: &str,
    engine: &Arc<Mutex<Engine>>,
    dns: &Arc<DnsServer>,
) -> ControlResponse {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return ControlResponse::error(format!("invalid request: {}", e)),
    };

    match request {
        ControlRequest::Apply { map } => {
            let serial = map.serial;
            let dns_update = map.dns.clone();

            if let Err(e) = engine.lock().await.apply_network_map(&map).await {
                return ControlResponse::error(e.to_string());
            }
            if let Some(update) = dns_update {
                if let Err(e) = dns.apply_update(serial, &update).await {
                    return ControlResponse::error(e.to_string());
                }
            }
            ControlResponse::ok(serde_json::json!({ "serial": serial }))
        }
        ControlRequest::Status => {
            let (serial, peers) = {
                let engine = engine.lock().await;
                (engine.serial(), engine.peers())
            };
            let report = StatusReport {
                serial,
                peers,
                dns_serial: dns.serial().await,
                dns_domains: dns.registered_domains(),
            };
            match serde_json::to_value(&report) {
                Ok(value) => ControlResponse::ok(value),
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }
    }
}
