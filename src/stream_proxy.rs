//! Per-context camera proxy.
//!
//! Each running proxy owns one port from the shared [`PortAllocator`] and an
//! axum server on `bind_address:port`. A pump task feeds a broadcast channel
//! that every `/stream` viewer subscribes to. MJPEG sources are fetched and
//! passed through as-is; RTSP sources are transcoded by a supervised ffmpeg.

use crate::backend::BackendCapabilities;
use crate::config::CameraConfig;
use crate::context::{ContextId, PrinterContext, PrinterDetails, PrinterSettings};
use crate::context_manager::ContextLifecycleHook;
use crate::errors::{DaemonError, Result};
use crate::port_allocator::PortAllocator;
use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::Url;

const FRAME_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_CONTENT_TYPE: &str = "multipart/x-mixed-replace;boundary=ffmpeg";
const BUILTIN_CAMERA_PORT: u16 = 8080;
const FFMPEG_MAX_RESTARTS: usize = 10;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSourceKind {
    Mjpeg,
    Rtsp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub url: Url,
    pub kind: StreamSourceKind,
}

impl StreamSource {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| DaemonError::Validation(format!("Invalid camera URL {}: {}", raw, e)))?;
        let kind = match url.scheme() {
            "http" | "https" => StreamSourceKind::Mjpeg,
            "rtsp" | "rtsps" => StreamSourceKind::Rtsp,
            other => {
                return Err(DaemonError::Validation(format!(
                    "Unsupported camera URL scheme: {}",
                    other
                )))
            }
        };
        if url.host_str().map_or(true, str::is_empty) {
            return Err(DaemonError::Validation(format!(
                "Camera URL {} has no host",
                raw
            )));
        }
        Ok(Self { url, kind })
    }
}

/// Transcoding parameters for RTSP sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOptions {
    /// 1-60
    pub frame_rate: u8,
    /// 1-5, lower is better
    pub quality: u8,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            quality: 3,
        }
    }
}

impl StreamOptions {
    /// Per-printer settings win over the configured defaults.
    pub fn resolve(settings: &PrinterSettings, config: &CameraConfig) -> Result<Self> {
        let options = Self {
            frame_rate: settings
                .camera_frame_rate
                .unwrap_or(config.default_frame_rate),
            quality: settings.camera_quality.unwrap_or(config.default_quality),
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=60).contains(&self.frame_rate) {
            return Err(DaemonError::Validation(format!(
                "Frame rate {} is outside 1-60",
                self.frame_rate
            )));
        }
        if !(1..=5).contains(&self.quality) {
            return Err(DaemonError::Validation(format!(
                "Quality {} is outside 1-5",
                self.quality
            )));
        }
        Ok(())
    }

    /// ffmpeg `-q:v` scale is 2-31; map 1-5 onto its usable low end.
    fn ffmpeg_qscale(&self) -> u8 {
        self.quality * 3 - 1
    }
}

/// Pick the camera feed for a printer: the custom URL when enabled, else the
/// printer's own MJPEG endpoint.
pub fn resolve_camera_url(
    details: &PrinterDetails,
    capabilities: &BackendCapabilities,
) -> Result<String> {
    let camera = &capabilities.camera;
    if camera.custom_enabled {
        return match camera.custom_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => Err(DaemonError::Validation(
                "Custom camera is enabled but no URL is set".into(),
            )),
        };
    }
    if camera.builtin {
        let addr = SocketAddr::new(details.ip_address, BUILTIN_CAMERA_PORT);
        return Ok(format!("http://{}/?action=stream", addr));
    }
    Err(DaemonError::unsupported("camera"))
}

pub fn ffmpeg_args(source: &Url, options: &StreamOptions) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-rtsp_transport".into(),
        "tcp".into(),
        "-i".into(),
        source.to_string(),
        "-f".into(),
        "mpjpeg".into(),
        "-r".into(),
        options.frame_rate.to_string(),
        "-q:v".into(),
        options.ffmpeg_qscale().to_string(),
        "pipe:1".into(),
    ]
}

fn mjpeg_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(usize::MAX)
        .build()
}

fn ffmpeg_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(FFMPEG_MAX_RESTARTS)
        .build()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub context_id: ContextId,
    pub port: u16,
    /// Where viewers connect.
    pub url: String,
    pub source_url: String,
    pub kind: StreamSourceKind,
    pub options: StreamOptions,
}

/// State shared between the pump and the HTTP handlers.
struct ProxyShared {
    frames: broadcast::Sender<Bytes>,
    content_type: RwLock<String>,
    kind: StreamSourceKind,
    failed: AtomicBool,
}

struct ProxyInstance {
    context: Arc<PrinterContext>,
    info: StreamInfo,
    server: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        self.pump.abort();
        self.server.abort();
    }
}

pub struct StreamProxyService {
    config: CameraConfig,
    bind_ip: IpAddr,
    ports: Arc<PortAllocator>,
    proxies: Mutex<HashMap<ContextId, ProxyInstance>>,
    client: reqwest::Client,
}

impl StreamProxyService {
    pub fn new(config: CameraConfig, ports: Arc<PortAllocator>) -> Result<Self> {
        let bind_ip: IpAddr = config.bind_address.parse().map_err(|_| {
            DaemonError::Config(format!(
                "Invalid camera bind address: {}",
                config.bind_address
            ))
        })?;
        // No overall timeout: the response body is an endless stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            config,
            bind_ip,
            ports,
            proxies: Mutex::new(HashMap::new()),
            client,
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Start (or restart) the proxy for `context`.
    ///
    /// An existing proxy for the same context is stopped and its port released
    /// before a new port is taken.
    pub fn start(
        &self,
        context: &Arc<PrinterContext>,
        source_url: &str,
        options: StreamOptions,
    ) -> Result<StreamInfo> {
        let source = StreamSource::from_url(source_url)?;
        options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| DaemonError::Stream("no async runtime to host the proxy".into()))?;

        let id = context.id();
        let mut proxies = self.proxies.lock();

        if context.is_removed() {
            return Err(DaemonError::NotFound(format!("context {}", id)));
        }

        if let Some(previous) = proxies.remove(&id) {
            info!("Replacing camera proxy on port {} for {}", previous.info.port, id);
            drop(previous);
        }
        if let Some(port) = context.take_camera_port() {
            self.ports.release_port(port);
        }

        let (port, listener) = self.bind_free_port()?;

        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let shared = Arc::new(ProxyShared {
            frames,
            content_type: RwLock::new(DEFAULT_CONTENT_TYPE.to_string()),
            kind: source.kind,
            failed: AtomicBool::new(false),
        });

        let server = runtime.spawn(serve(listener, shared.clone(), id, port));
        let pump = match source.kind {
            StreamSourceKind::Mjpeg => runtime.spawn(pump_mjpeg(
                self.client.clone(),
                source.url.clone(),
                shared,
            )),
            StreamSourceKind::Rtsp => runtime.spawn(supervise_ffmpeg(
                self.config.ffmpeg_path.clone(),
                ffmpeg_args(&source.url, &options),
                shared,
            )),
        };

        let info = StreamInfo {
            context_id: id,
            port,
            url: format!("http://{}/stream", self.public_addr(port)),
            source_url: source.url.to_string(),
            kind: source.kind,
            options,
        };

        if let Some(stale) = context.set_camera_port(port) {
            self.ports.release_port(stale);
        }
        proxies.insert(
            id,
            ProxyInstance {
                context: context.clone(),
                info: info.clone(),
                server,
                pump,
            },
        );

        info!(
            "Camera proxy for {} listening on port {} ({:?} from {})",
            id, port, source.kind, info.source_url
        );
        Ok(info)
    }

    /// Stop the proxy for `context` and release its port. Returns `false`
    /// when nothing was running.
    pub fn stop(&self, context: &PrinterContext) -> bool {
        let mut proxies = self.proxies.lock();
        let stopped = proxies.remove(&context.id());
        if let Some(port) = context.take_camera_port() {
            self.ports.release_port(port);
        }
        match stopped {
            Some(instance) => {
                info!(
                    "Camera proxy for {} on port {} stopped",
                    instance.info.context_id, instance.info.port
                );
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<ProxyInstance> = self.proxies.lock().drain().map(|(_, p)| p).collect();
        for instance in drained {
            if let Some(port) = instance.context.take_camera_port() {
                self.ports.release_port(port);
            }
        }
    }

    pub fn stream_info(&self, id: ContextId) -> Option<StreamInfo> {
        self.proxies.lock().get(&id).map(|p| p.info.clone())
    }

    pub fn active_streams(&self) -> Vec<StreamInfo> {
        self.proxies.lock().values().map(|p| p.info.clone()).collect()
    }

    pub fn is_running(&self, id: ContextId) -> bool {
        self.proxies.lock().contains_key(&id)
    }

    /// Allocate ports until one can actually be bound.
    fn bind_free_port(&self) -> Result<(u16, std::net::TcpListener)> {
        let mut last_error = None;
        for _ in 0..self.ports.total_ports() {
            let port = self.ports.allocate_port()?;
            match std::net::TcpListener::bind(SocketAddr::new(self.bind_ip, port))
                .and_then(|l| l.set_nonblocking(true).map(|_| l))
            {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => {
                    warn!("Port {} is allocated but not bindable: {}", port, e);
                    self.ports.release_port(port);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.map(DaemonError::Io).unwrap_or_else(|| {
            let (start, end) = self.ports.range();
            DaemonError::PoolExhausted { start, end }
        }))
    }

    fn public_addr(&self, port: u16) -> SocketAddr {
        let ip = if self.bind_ip.is_unspecified() {
            IpAddr::from([127, 0, 0, 1])
        } else {
            self.bind_ip
        };
        SocketAddr::new(ip, port)
    }
}

impl ContextLifecycleHook for StreamProxyService {
    fn context_removing(&self, context: &Arc<PrinterContext>) {
        self.stop(context);
    }
}

fn router(shared: Arc<ProxyShared>) -> Router {
    Router::new()
        .route("/stream", get(handle_stream))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

async fn serve(
    listener: std::net::TcpListener,
    shared: Arc<ProxyShared>,
    id: ContextId,
    port: u16,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Camera proxy for {} could not adopt port {}: {}", id, port, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, router(shared)).await {
        error!("Camera proxy for {} on port {} failed: {}", id, port, e);
    }
}

async fn handle_stream(State(shared): State<Arc<ProxyShared>>) -> Response {
    let rx = shared.frames.subscribe();
    let content_type = shared.content_type.read().clone();
    // New viewers start at a part boundary, not in the middle of a frame.
    let marker = boundary_marker(&content_type);
    let synced = marker.is_none();

    let frames = futures_util::stream::unfold(
        (rx, marker, synced),
        |(mut rx, marker, mut synced)| async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) if synced => {
                        return Some((Ok::<Bytes, Infallible>(chunk), (rx, marker, synced)))
                    }
                    Ok(chunk) => {
                        let aligned = marker
                            .as_deref()
                            .and_then(|marker| align_to_boundary(&chunk, marker));
                        if let Some(aligned) = aligned {
                            synced = true;
                            return Some((Ok(aligned), (rx, marker, synced)));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Viewer lagged, skipped {} chunks", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

/// `--<boundary>` from a multipart content type.
fn boundary_marker(content_type: &str) -> Option<Vec<u8>> {
    let start = content_type.to_ascii_lowercase().find("boundary=")? + "boundary=".len();
    let boundary = content_type[start..]
        .split(';')
        .next()?
        .trim()
        .trim_matches('"')
        .trim_start_matches("--");
    (!boundary.is_empty()).then(|| format!("--{}", boundary).into_bytes())
}

/// The part of `chunk` from the first boundary marker on, if it has one.
fn align_to_boundary(chunk: &Bytes, marker: &[u8]) -> Option<Bytes> {
    chunk
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|offset| chunk.slice(offset..))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHealth {
    pub status: String,
    pub source: StreamSourceKind,
    pub viewers: usize,
    pub content_type: String,
}

async fn handle_health(State(shared): State<Arc<ProxyShared>>) -> Json<ProxyHealth> {
    let status = if shared.failed.load(Ordering::Acquire) {
        "failed"
    } else {
        "streaming"
    };
    Json(ProxyHealth {
        status: status.to_string(),
        source: shared.kind,
        viewers: shared.frames.receiver_count(),
        content_type: shared.content_type.read().clone(),
    })
}

/// Relay an upstream MJPEG response body, reconnecting forever.
async fn pump_mjpeg(client: reqwest::Client, url: Url, shared: Arc<ProxyShared>) {
    let mut backoff = mjpeg_backoff();
    loop {
        match client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => {
                if let Some(content_type) = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                {
                    *shared.content_type.write() = content_type.to_string();
                }
                backoff = mjpeg_backoff();
                debug!("Connected to camera at {}", url);

                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            let _ = shared.frames.send(bytes);
                        }
                        Err(e) => {
                            warn!("Camera stream {} interrupted: {}", url, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Camera {} unreachable: {}", url, e),
        }

        let delay = backoff.next().unwrap_or(Duration::from_secs(10));
        tokio::time::sleep(delay).await;
    }
}

/// Run ffmpeg, restarting it on exit until it fails to start too many times
/// in a row. Any run that produced output resets the count.
async fn supervise_ffmpeg(ffmpeg: String, args: Vec<String>, shared: Arc<ProxyShared>) {
    let mut backoff = ffmpeg_backoff();
    loop {
        match run_ffmpeg(&ffmpeg, &args, &shared).await {
            Ok(true) => backoff = ffmpeg_backoff(),
            Ok(false) => warn!("ffmpeg exited without producing output"),
            Err(e) => warn!("ffmpeg failed: {}", e),
        }

        match backoff.next() {
            Some(delay) => {
                debug!("Restarting ffmpeg in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(
                    "ffmpeg failed {} times in a row, giving up",
                    FFMPEG_MAX_RESTARTS
                );
                shared.failed.store(true, Ordering::Release);
                return;
            }
        }
    }
}

/// Returns whether the process wrote anything before exiting.
async fn run_ffmpeg(ffmpeg: &str, args: &[String], shared: &ProxyShared) -> Result<bool> {
    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DaemonError::Stream(format!("could not start {}: {}", ffmpeg, e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| DaemonError::Stream("ffmpeg stdout was not captured".into()))?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut produced = false;
    loop {
        if buf.capacity() < READ_CHUNK / 4 {
            buf.reserve(READ_CHUNK);
        }
        let n = stdout.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        produced = true;
        let _ = shared.frames.send(buf.split().freeze());
    }

    let status = child.wait().await?;
    debug!("ffmpeg exited with {}", status);
    Ok(produced)
}
