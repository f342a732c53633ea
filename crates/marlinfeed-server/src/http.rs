//! The Octoprint-compatible HTTP surface.
//!
//! Slicers (Cura, PrusaSlicer) speak a small subset of the Octoprint API
//! to upload jobs, poll state and pause prints. This module serves that
//! subset over plain HTTP/1.1, parsed directly off the TCP stream:
//! request line, headers, `Content-Length`-delimited body. No routing
//! framework, no TLS (an external reverse proxy terminates that), no
//! authentication beyond the bind address.
//!
//! Every accepted connection runs in its own spawned task. Tasks touch
//! the core only through the [`ApiContext`] handles: printer-state
//! snapshots, the injection channel and the pause switch. A request
//! handler that goes wrong takes down its own task, never the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | GET  | `/api/version` | static version document |
//! | GET  | `/api/settings` | static feature document |
//! | GET  | `/api/printer` | temperatures + state flags |
//! | GET  | `/api/job` | job progress document |
//! | POST | `/api/login` | canned success |
//! | POST | `/api/job` | `pause` toggles the pause flag, `cancel` is a no-op |
//! | POST | `/api/files/local` | multipart upload into the upload directory |
//! | POST | `/api/files/local/<name>` | `print: true` reschedules the file |
//! | POST | `/api/printer/command` | injects `commands[]` |
//!
//! Everything else is 404 with an HTML body.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use marlinfeed_engine::{Injector, PauseSwitch, StateHandle};

use crate::names::{create_numbered_file, sanitize_filename};

/// Maximum accepted size for headers and for non-upload bodies.
const MAX_META_BYTES: u64 = 64 * 1024;

/// Handles the HTTP surface hands out to request tasks.
#[derive(Clone)]
pub struct ApiContext {
    pub state: StateHandle,
    pub injector: Injector,
    pub pause: PauseSwitch,
    pub upload_dir: PathBuf,
    /// External base URL, used for the upload Location header.
    pub base_url: String,
}

/// Accept loop for API connections.
pub struct HttpServer {
    listener: TcpListener,
    ctx: Arc<ApiContext>,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr, ctx: ApiContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "API listening");
        Ok(HttpServer {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    /// The bound address; lets tests bind port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(peer = %peer, "API connection");
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx).await {
                    debug!(peer = %peer, error = %e, "API connection failed");
                }
            });
        }
    }
}

struct Request {
    method: String,
    path: String,
    content_length: u64,
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ApiContext>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);

    let request_line = match read_header_line(&mut reader).await? {
        Some(line) => line,
        None => return Ok(()), // closed before sending anything
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let raw_path = parts.next().unwrap_or("").to_string();
    // the query string is irrelevant to every endpoint we serve
    let path = raw_path.split('?').next().unwrap_or("").to_string();

    let mut content_length: u64 = 0;
    let mut read_total = request_line.len() as u64;
    loop {
        let line = match read_header_line(&mut reader).await? {
            Some(line) => line,
            None => break,
        };
        read_total += line.len() as u64;
        if read_total > MAX_META_BYTES {
            return respond_404(&mut reader, "oversized request head").await;
        }
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let request = Request {
        method,
        path,
        content_length,
    };
    debug!(method = %request.method, path = %request.path, "API request");

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/version") => respond_json(&mut reader, 200, &version_json(), "").await,
        ("GET", "/api/settings") => respond_json(&mut reader, 200, &settings_json(), "").await,
        ("GET", "/api/printer") => {
            let body = ctx.state.printer_json();
            respond_json(&mut reader, 200, &body, "").await
        }
        ("GET", "/api/job") => {
            let body = ctx.state.job_json();
            respond_json(&mut reader, 200, &body, "").await
        }
        ("POST", "/api/login") => {
            drain_body(&mut reader, request.content_length).await?;
            respond_json(&mut reader, 200, &login_json(), "").await
        }
        ("POST", "/api/job") => job_command(&mut reader, &ctx, &request).await,
        ("POST", "/api/printer/command") => inject_commands(&mut reader, &ctx, &request).await,
        ("POST", "/api/files/local") => upload(&mut reader, &ctx, &request).await,
        ("POST", path) if path.starts_with("/api/files/local/") => {
            touch_file(&mut reader, &ctx, &request).await
        }
        _ => {
            drain_body(&mut reader, request.content_length).await?;
            respond_404(&mut reader, &request.path).await
        }
    }
}

/// `POST /api/job`: pause toggling. `cancel` is acknowledged but not
/// acted on; aborting a live print from the network is more dangerous
/// than useful.
async fn job_command(
    reader: &mut BufReader<TcpStream>,
    ctx: &ApiContext,
    request: &Request,
) -> io::Result<()> {
    let body = read_body(reader, request.content_length).await?;
    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return respond_404(reader, "malformed job command").await,
    };
    let command = parsed["command"].as_str().unwrap_or("");
    let action = parsed["action"].as_str();

    match command {
        "pause" => {
            if action.is_none() {
                let paused = ctx.pause.toggle();
                info!(paused, "pause toggled via API");
            }
            respond_no_content(reader).await
        }
        "cancel" => {
            info!("cancel requested via API (ignored)");
            respond_no_content(reader).await
        }
        _ => respond_404(reader, "unsupported job action").await,
    }
}

/// `POST /api/printer/command`: feeds each entry of `commands[]` into
/// the injection channel.
async fn inject_commands(
    reader: &mut BufReader<TcpStream>,
    ctx: &ApiContext,
    request: &Request,
) -> io::Result<()> {
    let body = read_body(reader, request.content_length).await?;
    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return respond_404(reader, "malformed command body").await,
    };
    let Some(commands) = parsed["commands"].as_array() else {
        return respond_404(reader, "missing commands array").await;
    };
    for command in commands.iter().filter_map(|c| c.as_str()) {
        if command.trim() == "M81" {
            // power-off is not wired through the feeder
            info!("received M81 via API (ignored)");
            continue;
        }
        debug!(command, "injecting");
        ctx.injector.send_line(command);
    }
    respond_no_content(reader).await
}

/// `POST /api/files/local/<name>` with `print: true`: refresh the
/// file's mtime so the directory watcher schedules it again.
async fn touch_file(
    reader: &mut BufReader<TcpStream>,
    ctx: &ApiContext,
    request: &Request,
) -> io::Result<()> {
    let body = read_body(reader, request.content_length).await?;
    let wants_print = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .map(|v| v.get("print").is_some())
        .unwrap_or(false);
    if !wants_print {
        return respond_404(reader, "touch without print").await;
    }

    let name = request
        .path
        .trim_start_matches("/api/files/local/")
        .to_string();
    let path = ctx.upload_dir.join(sanitize_filename(&name));
    let is_file = std::fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        return respond_404(reader, "no such upload").await;
    }
    let touched = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    match touched {
        Ok(()) => {
            info!(file = %path.display(), "scheduled for print");
            respond_no_content(reader).await
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "touch failed");
            respond_404(reader, "touch failed").await
        }
    }
}

/// `POST /api/files/local`: multipart upload. Parsed only far enough to
/// find the `filename=` in a `Content-Disposition` header and stream the
/// file part into the upload directory, atomically renamed when its
/// closing boundary arrives.
async fn upload(
    reader: &mut BufReader<TcpStream>,
    ctx: &ApiContext,
    request: &Request,
) -> io::Result<()> {
    let (tmp_path, tmp_file) = match create_numbered_file(&ctx.upload_dir, "upload-") {
        Ok(pair) => pair,
        Err(e) => {
            warn!(dir = %ctx.upload_dir.display(), error = %e, "cannot create upload file");
            return respond_404(reader, "upload storage unavailable").await;
        }
    };
    debug!(file = %tmp_path.display(), "storing upload data");
    let mut tmp = tokio::fs::File::from_std(tmp_file);

    let mut boundary: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut wait_for_file_start = false;
    // data lines lag one line behind, because the line just before the
    // closing boundary carries the delimiter's CRLF, not file content
    let mut pending: Option<Vec<u8>> = None;
    let mut in_file_part = false;

    let mut consumed: u64 = 0;
    let mut line = Vec::new();
    while consumed < request.content_length {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        consumed += n as u64;

        let trimmed = trim_crlf(&line);
        let is_boundary = match &boundary {
            Some(b) => trimmed == &b[..] || trimmed == [&b[..], &b"--"[..]].concat(),
            None => false,
        };

        if boundary.is_none() && line.starts_with(b"--") {
            boundary = Some(trimmed.to_vec());
        } else if is_boundary {
            if in_file_part {
                // delimiter CRLF belongs to the boundary, not the file
                if let Some(mut last) = pending.take() {
                    strip_trailing_newline(&mut last);
                    tmp.write_all(&last).await?;
                }
                tmp.flush().await?;
                drop(tmp);
                return finish_upload(reader, ctx, request, tmp_path, filename, consumed).await;
            }
        } else if in_file_part {
            if let Some(prev) = pending.take() {
                tmp.write_all(&prev).await?;
            }
            pending = Some(line.clone());
        } else if wait_for_file_start {
            // skip the remaining part headers up to the blank line
            if trimmed.is_empty() {
                wait_for_file_start = false;
                in_file_part = true;
            }
        } else if filename.is_none() && line.starts_with(b"Content-Disposition:") {
            let header = marlinfeed_protocol::Line::new(line.clone());
            if header.prefix_match("Content-Disposition:\u{8}form-data\u{8}") != 0 {
                filename = header.string_field("filename");
                wait_for_file_start = filename.is_some();
            }
        }
    }

    warn!("premature end of upload data");
    let _ = tokio::fs::remove_file(&tmp_path).await;
    respond_404(reader, "incomplete upload").await
}

async fn finish_upload(
    reader: &mut BufReader<TcpStream>,
    ctx: &ApiContext,
    request: &Request,
    tmp_path: PathBuf,
    filename: Option<String>,
    consumed: u64,
) -> io::Result<()> {
    let name = sanitize_filename(filename.as_deref().unwrap_or("upload.gcode"));
    let final_path = ctx.upload_dir.join(&name);
    info!(from = %tmp_path.display(), to = %final_path.display(), "upload complete");
    tokio::fs::rename(&tmp_path, &final_path).await?;

    // remaining multipart fields are irrelevant; drain them
    drain_body(reader, request.content_length.saturating_sub(consumed)).await?;

    let location = format!("Location: {}/api/files/local/{}\r\n", ctx.base_url, name);
    respond_json(reader, 201, &created_json(), &location).await
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn strip_trailing_newline(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

async fn read_header_line(reader: &mut BufReader<TcpStream>) -> io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn read_body(reader: &mut BufReader<TcpStream>, content_length: u64) -> io::Result<Vec<u8>> {
    let len = content_length.min(MAX_META_BYTES);
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn drain_body(reader: &mut BufReader<TcpStream>, mut remaining: u64) -> io::Result<()> {
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let take = remaining.min(scratch.len() as u64) as usize;
        let n = reader.read(&mut scratch[..take]).await?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

async fn respond(
    reader: &mut BufReader<TcpStream>,
    status: u16,
    reason: &str,
    content_type: &str,
    extra_headers: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\n{}Cache-Control: no-store\r\nContent-Length: {}\r\nContent-Type: {}\r\n\r\n",
        status,
        reason,
        extra_headers,
        body.len(),
        content_type,
    );
    let stream = reader.get_mut();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn respond_json(
    reader: &mut BufReader<TcpStream>,
    status: u16,
    body: &str,
    extra_headers: &str,
) -> io::Result<()> {
    let reason = match status {
        201 => "Created",
        _ => "OK",
    };
    respond(
        reader,
        status,
        reason,
        "application/json",
        extra_headers,
        body.as_bytes(),
    )
    .await
}

async fn respond_no_content(reader: &mut BufReader<TcpStream>) -> io::Result<()> {
    respond(reader, 204, "No Content", "text/html", "", b"").await
}

async fn respond_404(reader: &mut BufReader<TcpStream>, what: &str) -> io::Result<()> {
    debug!(what, "unsupported request");
    let body = format!(
        "<!DOCTYPE html><html><head><title>Error</title></head>\
         <body><h1>Unsupported Request: {}</h1></body></html>",
        what
    );
    respond(reader, 404, "Not Found", "text/html", "", body.as_bytes()).await
}

fn version_json() -> String {
    serde_json::json!({
        "api": "0.1",
        "server": "1.0.0",
        "text": "Marlinfeed 1.0.0",
    })
    .to_string()
}

fn settings_json() -> String {
    serde_json::json!({
        "feature": {
            "sdSupport": false,
        },
        "webcam": {
            "webcamEnabled": false,
            "streamUrl": "",
        },
    })
    .to_string()
}

fn login_json() -> String {
    serde_json::json!({
        "_is_external_client": false,
        "active": true,
        "admin": true,
        "apikey": null,
        "groups": ["admins", "users"],
        "name": "_api",
    })
    .to_string()
}

fn created_json() -> String {
    serde_json::json!({
        "done": true,
        "files": {
            "local": {
                "origin": "local",
                "refs": {},
            },
        },
    })
    .to_string()
}
