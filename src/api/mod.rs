//! HTTP surface.
//!
//! Plain HTTP/1.1 over `std::net`: a non-blocking accept loop hands each
//! connection to its own thread, so a long-lived MJPEG stream never holds up a
//! capture or a model switch. Streams end when the client goes away or the
//! server stops.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::CaptureRequest;
use crate::config::frame_interval;
use crate::error::PipelineError;
use crate::frame::FrameStatus;
use crate::stream::{StreamEncoder, CONTENT_TYPE as MULTIPART_CONTENT_TYPE};
use crate::Pipeline;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, cancel open streams and wait for the accept loop.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: Arc<Pipeline>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let pipeline = self.pipeline;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, pipeline, shutdown_thread) {
                log::error!("pipeline api stopped: {}", err);
            }
        });
        log::info!("pipeline api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let pipeline = Arc::clone(&pipeline);
                let shutdown = Arc::clone(&shutdown);
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &pipeline, &shutdown) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    pipeline: &Pipeline,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_error(&mut stream, &PipelineError::InvalidRequest(err.to_string()))?;
            return Ok(());
        }
    };
    log::debug!("{} {}", request.method, request.path);

    let segments: Vec<&str> = request
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json(&mut stream, 200, &serde_json::json!({"status": "ok"})),
        ("GET", ["stream"]) => {
            let encoder = StreamEncoder::raw(
                pipeline.frames.clone(),
                frame_interval(pipeline.stream.raw_fps),
            );
            serve_stream(stream, encoder, shutdown)
        }
        ("GET", ["detection-stream"]) => {
            let encoder = StreamEncoder::annotated(
                pipeline.frames.clone(),
                Arc::clone(&pipeline.cache),
                frame_interval(pipeline.stream.annotated_fps),
                pipeline.stream.inference_budget,
            );
            serve_stream(stream, encoder, shutdown)
        }
        ("GET", ["status"]) => {
            let status = pipeline.frames.status();
            let code = match status {
                FrameStatus::NotFound { .. } => 404,
                _ => 200,
            };
            write_json(&mut stream, code, &status)
        }
        ("POST", ["capture-detection"]) => {
            let result = parse_json::<CaptureRequest>(&request.body)
                .and_then(|capture| pipeline.capture.capture(&capture));
            match result {
                Ok(outcome) => write_json(&mut stream, 201, &outcome),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("GET", ["detection", id, "image"]) => {
            let result = parse_id(id).and_then(|id| pipeline.capture.snapshot(id));
            match result {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("PUT", ["person-detection-model", id]) => {
            let result = parse_id(id).and_then(|id| {
                let confidence = parse_confidence(&request.body)?;
                pipeline
                    .cache
                    .registry()
                    .select_with_confidence(id, confidence)
            });
            match result {
                Ok(model) => write_json(&mut stream, 200, &model),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        (_, ["health"])
        | (_, ["stream"])
        | (_, ["detection-stream"])
        | (_, ["status"])
        | (_, ["capture-detection"])
        | (_, ["detection", _, "image"])
        | (_, ["person-detection-model", _]) => write_json(
            &mut stream,
            405,
            &ErrorBody {
                error: "method_not_allowed",
                message: format!("{} not allowed on {}", request.method, request.path),
            },
        ),
        _ => write_json(
            &mut stream,
            404,
            &ErrorBody {
                error: "not_found",
                message: format!("no route for {}", request.path),
            },
        ),
    }
}

fn serve_stream(
    mut stream: TcpStream,
    mut encoder: StreamEncoder,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nConnection: close\r\n\r\n",
        MULTIPART_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    let exit = encoder.run(&mut stream, shutdown);
    log::debug!(
        "{:?} stream finished ({:?}) after {} parts",
        encoder.variant(),
        exit,
        encoder.frames_sent()
    );
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn parse_id(raw: &str) -> Result<i64, PipelineError> {
    raw.parse()
        .map_err(|_| PipelineError::InvalidRequest(format!("invalid id '{}'", raw)))
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, PipelineError> {
    serde_json::from_slice(body)
        .map_err(|err| PipelineError::InvalidRequest(format!("invalid json body: {}", err)))
}

fn parse_confidence(body: &[u8]) -> Result<f32, PipelineError> {
    let value: serde_json::Value = parse_json(body)?;
    let confidence = value
        .get("confidence")
        .ok_or_else(|| PipelineError::InvalidRequest("confidence is required".to_string()))?;
    let confidence = confidence
        .as_f64()
        .or_else(|| confidence.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| PipelineError::InvalidRequest("confidence must be a number".to_string()))?;
    Ok(confidence as f32)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body completed"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_error(stream: &mut TcpStream, err: &PipelineError) -> Result<()> {
    let status = err.status_code();
    if status >= 500 {
        log::error!("request failed: {}", err);
    }
    write_json(
        stream,
        status,
        &ErrorBody {
            error: err.code(),
            message: err.to_string(),
        },
    )
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
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
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_body_rules() {
        assert_eq!(parse_confidence(br#"{"confidence": 0.7}"#).ok(), Some(0.7));
        assert_eq!(parse_confidence(br#"{"confidence": "0.25"}"#).ok(), Some(0.25));
        assert!(matches!(
            parse_confidence(br#"{}"#),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_confidence(br#"{"confidence": true}"#),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(parse_confidence(b"not json").is_err());
    }

    #[test]
    fn ids_must_be_integers() {
        assert_eq!(parse_id("12").ok(), Some(12));
        assert!(parse_id("twelve").is_err());
    }
}
