//! Admin Trigger Endpoints
//!
//! Internal POST endpoints that trigger exports and restores:
//!
//! - `POST /_backup/export?lowerCheckpointTime=..&upperCheckpointTime=..`
//! - `POST /_backup/restore?fromTime=..&dryRun=true`
//!
//! Timestamps are RFC 3339. Responses are short human-readable status
//! lines; failures come back as 4xx/5xx with the underlying error logged,
//! never masked.
//!
//! The server speaks just enough HTTP/1.1 over a `tokio` TCP listener to
//! serve internal POSTs: one request per connection, headers parsed and
//! ignored, no keep-alive.

use crate::blobstore::BlobStore;
use crate::clock::CommitTime;
use crate::export::DiffExporter;
use crate::restore::Restorer;
use crate::store::MemoryDatastore;
use bytes::BytesMut;
use std::collections::HashMap;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Maximum bytes of request head we will buffer
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Shared handler state
pub struct AdminState<B: BlobStore> {
    pub store: MemoryDatastore,
    pub exporter: DiffExporter<B>,
    pub restorer: Restorer<B>,
}

/// Minimal HTTP server exposing the export/restore triggers.
pub struct AdminServer<B: BlobStore> {
    listener: TcpListener,
    state: Arc<AdminState<B>>,
}

impl<B: BlobStore> AdminServer<B> {
    pub async fn bind(addr: &str, state: Arc<AdminState<B>>) -> IoResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(AdminServer { listener, state })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn run(self) -> IoResult<()> {
        info!(addr = %self.listener.local_addr()?, "admin server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept admin connection: {}", e);
                    continue;
                }
            };
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    warn!(peer = %peer, "admin connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<B: BlobStore>(
    mut stream: TcpStream,
    state: Arc<AdminState<B>>,
) -> IoResult<()> {
    let mut buf = BytesMut::with_capacity(1024);

    // Read until end of headers; the endpoints take no request body.
    loop {
        if find_header_end(&buf).is_some() {
            break;
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            write_response(&mut stream, 400, "request too large\n").await?;
            return Ok(());
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(()); // peer closed before a full request
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default();
    let (status, body) = match parse_request_line(request_line) {
        Some((method, path, query)) => dispatch(&state, method, path, &query).await,
        None => (400, "malformed request line\n".to_string()),
    };

    write_response(&mut stream, status, &body).await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `METHOD SP target SP version` and split the target's query string.
fn parse_request_line(line: &str) -> Option<(&str, &str, HashMap<String, String>)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let _version = parts.next()?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, HashMap::new()),
    };
    Some((method, path, query))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), percent_decode(value)))
        })
        .collect()
}

/// Decode %XX escapes; anything malformed passes through unchanged.
fn percent_decode(value: &str) -> String {
    fn hex_digit(byte: u8) -> Option<u8> {
        (byte as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

async fn dispatch<B: BlobStore>(
    state: &AdminState<B>,
    method: &str,
    path: &str,
    query: &HashMap<String, String>,
) -> (u16, String) {
    match (method, path) {
        ("POST", "/_backup/export") => handle_export(state, query).await,
        ("POST", "/_backup/restore") => handle_restore(state, query).await,
        (_, "/_backup/export") | (_, "/_backup/restore") => {
            (405, "method not allowed; use POST\n".to_string())
        }
        _ => (404, "no such endpoint\n".to_string()),
    }
}

async fn handle_export<B: BlobStore>(
    state: &AdminState<B>,
    query: &HashMap<String, String>,
) -> (u16, String) {
    let upper_time = match required_time(query, "upperCheckpointTime") {
        Ok(time) => time,
        Err(msg) => return (400, msg),
    };
    let upper = match state.store.checkpoint_at(upper_time) {
        Some(checkpoint) => checkpoint,
        None => {
            return (
                400,
                format!("no checkpoint exists at {}\n", upper_time),
            )
        }
    };

    let lower = match query.get("lowerCheckpointTime") {
        None => None,
        Some(raw) => match CommitTime::parse_rfc3339(raw) {
            Err(e) => return (400, format!("bad lowerCheckpointTime: {}\n", e)),
            Ok(time) => match state.store.checkpoint_at(time) {
                Some(checkpoint) => Some(checkpoint),
                None => {
                    return (400, format!("no checkpoint exists at {}\n", time))
                }
            },
        },
    };

    match state.exporter.export(lower.as_ref(), &upper).await {
        Ok(result) => (
            200,
            format!(
                "exported {} transactions to {}\n",
                result.num_transactions, result.blob_key
            ),
        ),
        Err(e) => {
            error!("export failed: {}", e);
            (500, format!("export failed: {}\n", e))
        }
    }
}

async fn handle_restore<B: BlobStore>(
    state: &AdminState<B>,
    query: &HashMap<String, String>,
) -> (u16, String) {
    let from = match required_time(query, "fromTime") {
        Ok(time) => time,
        Err(msg) => return (400, msg),
    };
    let dry_run = match query.get("dryRun").map(String::as_str) {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return (400, format!("bad dryRun value: {:?}\n", other));
        }
    };

    match state.restorer.restore(from, dry_run).await {
        Ok(result) => {
            let verb = if dry_run { "would restore" } else { "restored" };
            let through = result
                .restored_to
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "nothing (no diffs found)".to_string());
            (
                200,
                format!(
                    "{} {} files ({} transactions) through {}\n",
                    verb, result.files_applied, result.transactions_applied, through
                ),
            )
        }
        Err(e) => {
            error!("restore failed: {}", e);
            (500, format!("restore failed: {}\n", e))
        }
    }
}

fn required_time(query: &HashMap<String, String>, key: &str) -> Result<CommitTime, String> {
    let raw = query
        .get(key)
        .ok_or_else(|| format!("missing required parameter {}\n", key))?;
    CommitTime::parse_rfc3339(raw).map_err(|e| format!("bad {}: {}\n", key, e))
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> IoResult<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
