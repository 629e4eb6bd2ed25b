//! Output sinks fed from the frame slot: MJPEG stream or virtual camera.

use crate::config::Config;
use crate::slot::FrameSlot;
use crate::stream;
use framer_hw::{LoopbackSink, SinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// How long a stopping MJPEG server may take to close its clients.
const STREAM_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("unknown output mode '{0}' (expected stream, virtual_cam or none)")]
    UnknownMode(String),
    #[error("failed to bind MJPEG server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("virtual camera: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to spawn output thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Stream,
    VirtualCam,
    None,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputMode::Stream => "stream",
            OutputMode::VirtualCam => "virtual_cam",
            OutputMode::None => "none",
        })
    }
}

impl FromStr for OutputMode {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "mjpeg" => Ok(OutputMode::Stream),
            "virtual_cam" | "vcam" => Ok(OutputMode::VirtualCam),
            "none" | "off" => Ok(OutputMode::None),
            other => Err(OutputError::UnknownMode(other.to_string())),
        }
    }
}

/// Output-side settings, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub stream_bind: SocketAddr,
    pub stream_fps: u32,
    pub jpeg_quality: u8,
    pub vcam_device: String,
    pub vcam_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&Config> for OutputSettings {
    fn from(config: &Config) -> Self {
        Self {
            stream_bind: config.stream_bind,
            stream_fps: config.stream_fps,
            jpeg_quality: config.jpeg_quality,
            vcam_device: config.vcam_device.clone(),
            vcam_fps: config.vcam_fps,
            width: config.output_width,
            height: config.output_height,
        }
    }
}

enum Running {
    Idle,
    Stream {
        addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        server: tokio::task::JoinHandle<()>,
    },
    VirtualCam {
        stop: Arc<AtomicBool>,
        thread: std::thread::JoinHandle<()>,
    },
}

/// Owns whichever output is currently active. At most one runs at a time.
pub struct Outputs {
    slot: Arc<FrameSlot>,
    settings: OutputSettings,
    running: Running,
}

impl Outputs {
    pub fn new(slot: Arc<FrameSlot>, settings: OutputSettings) -> Self {
        Self {
            slot,
            settings,
            running: Running::Idle,
        }
    }

    pub fn mode(&self) -> OutputMode {
        match self.running {
            Running::Idle => OutputMode::None,
            Running::Stream { .. } => OutputMode::Stream,
            Running::VirtualCam { .. } => OutputMode::VirtualCam,
        }
    }

    /// Address the MJPEG server is listening on, when streaming.
    pub fn stream_addr(&self) -> Option<SocketAddr> {
        match self.running {
            Running::Stream { addr, .. } => Some(addr),
            _ => None,
        }
    }

    /// Stop the current output and start `mode`.
    ///
    /// The previous output is fully shut down first, so restarting the
    /// stream can rebind the same address. On failure nothing is running and
    /// the error is returned.
    pub async fn set_mode(&mut self, mode: OutputMode) -> Result<(), OutputError> {
        self.stop().await;
        self.running = match mode {
            OutputMode::None => Running::Idle,
            OutputMode::Stream => self.start_stream().await?,
            OutputMode::VirtualCam => self.start_virtual_cam()?,
        };
        tracing::info!(%mode, "output mode set");
        Ok(())
    }

    async fn start_stream(&self) -> Result<Running, OutputError> {
        let bind = self.settings.stream_bind;
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| OutputError::Bind { addr: bind, source })?;
        let addr = listener.local_addr().unwrap_or(bind);

        let (shutdown, rx) = watch::channel(false);
        let app = stream::router(
            Arc::clone(&self.slot),
            self.settings.stream_fps,
            self.settings.jpeg_quality,
            rx.clone(),
        );
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(stream::stopped(rx))
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "MJPEG server failed");
            }
        });

        tracing::info!(%addr, "MJPEG stream listening");
        Ok(Running::Stream {
            addr,
            shutdown,
            server,
        })
    }

    fn start_virtual_cam(&self) -> Result<Running, OutputError> {
        let sink = LoopbackSink::open(
            &self.settings.vcam_device,
            self.settings.width,
            self.settings.height,
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let slot = Arc::clone(&self.slot);
            let period = Duration::from_secs_f64(1.0 / self.settings.vcam_fps.max(1) as f64);
            std::thread::Builder::new()
                .name("framer-vcam".into())
                .spawn(move || run_virtual_cam(sink, slot, period, stop))
                .map_err(OutputError::Spawn)?
        };

        Ok(Running::VirtualCam { stop, thread })
    }

    /// Stop the active output, if any, and clear the frame slot.
    ///
    /// Connected MJPEG clients are disconnected and the listener is closed
    /// before this returns.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.running, Running::Idle) {
            Running::Idle => {}
            Running::Stream {
                addr,
                shutdown,
                mut server,
            } => {
                let _ = shutdown.send(true);
                if tokio::time::timeout(STREAM_STOP_GRACE, &mut server).await.is_err() {
                    tracing::warn!(%addr, "MJPEG server did not stop in time; aborting");
                    server.abort();
                    let _ = server.await;
                }
                tracing::info!(%addr, "MJPEG stream stopped");
            }
            Running::VirtualCam { stop, thread } => stop_virtual_cam(stop, thread),
        }
        self.slot.clear();
    }
}

impl Drop for Outputs {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.running, Running::Idle) {
            Running::Idle => {}
            Running::Stream { shutdown, server, .. } => {
                let _ = shutdown.send(true);
                server.abort();
            }
            Running::VirtualCam { stop, thread } => stop_virtual_cam(stop, thread),
        }
        self.slot.clear();
    }
}

fn stop_virtual_cam(stop: Arc<AtomicBool>, thread: std::thread::JoinHandle<()>) {
    stop.store(true, Ordering::Relaxed);
    if thread.join().is_err() {
        tracing::error!("virtual camera thread panicked");
    }
    tracing::info!("virtual camera stopped");
}

/// Write the latest slot frame at a fixed rate until `stop` is set.
///
/// Frames are repeated when the engine is slower than `period` and dropped
/// when it is faster.
fn run_virtual_cam(mut sink: LoopbackSink, slot: Arc<FrameSlot>, period: Duration, stop: Arc<AtomicBool>) {
    tracing::info!(device = %sink.device_path, ?period, "virtual camera started");
    let mut next = Instant::now();
    let mut failures = 0u32;

    while !stop.load(Ordering::Relaxed) {
        if let Some((_, frame)) = slot.latest() {
            match sink.write_frame(&frame) {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 100 == 0 {
                        tracing::warn!(error = %e, failures, "virtual camera write failed");
                    }
                }
            }
        }

        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}
