use crate::slot::FrameSlot;
use framer_core::{AspectRatio, FramePipeline, SessionIndex, TrackerError};
use framer_hw::{Camera, CameraError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Weight of the newest sample in the smoothed FPS figure.
const FPS_SMOOTHING: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the frame loop, as reported by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub camera: Option<String>,
    pub camera_resolution: Option<(u32, u32)>,
    pub fps: f32,
    pub fps_smoothed: f32,
    pub frames: u64,
    pub tracked_index: Option<SessionIndex>,
    pub margin: f32,
    pub aspect_ratio: String,
    pub faces_in_last_frame: usize,
    pub tracked_known: Option<bool>,
    pub capture_misses: u64,
    pub consecutive_capture_misses: u32,
}

/// Frame timing and capture-miss counters.
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    pub frames: u64,
    /// 1 / time since the previous frame.
    pub fps: f32,
    pub fps_smoothed: f32,
    last_frame: Option<Instant>,
    pub consecutive_misses: u32,
    pub total_misses: u64,
}

impl FrameStats {
    pub fn record_frame(&mut self, now: Instant) {
        self.frames += 1;
        self.consecutive_misses = 0;
        if let Some(prev) = self.last_frame {
            let dt = now.duration_since(prev).as_secs_f32();
            if dt > 0.0 {
                self.fps = 1.0 / dt;
                self.fps_smoothed = if self.fps_smoothed == 0.0 {
                    self.fps
                } else {
                    FPS_SMOOTHING * self.fps + (1.0 - FPS_SMOOTHING) * self.fps_smoothed
                };
            }
        }
        self.last_frame = Some(now);
    }

    /// Count a failed capture. Returns true every `warn_every` consecutive misses.
    pub fn record_miss(&mut self, warn_every: u32) -> bool {
        self.consecutive_misses += 1;
        self.total_misses += 1;
        warn_every > 0 && self.consecutive_misses % warn_every == 0
    }

    /// Forget timing across a camera switch so the first new frame does
    /// not report the gap as a frame interval.
    fn reset_timing(&mut self) {
        self.last_frame = None;
        self.consecutive_misses = 0;
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    /// Select a face; selecting the tracked index again returns to idle.
    Select {
        index: Option<SessionIndex>,
        reply: oneshot::Sender<Option<SessionIndex>>,
    },
    SetMargin {
        margin: f32,
        reply: oneshot::Sender<Result<(), TrackerError>>,
    },
    SetRatio {
        ratio: AspectRatio,
        reply: oneshot::Sender<()>,
    },
    SetCamera {
        device: String,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Select `index` (or deselect with `None`). Returns the tracked index
    /// afterwards; selecting the current index toggles back to idle.
    pub async fn select(&self, index: Option<SessionIndex>) -> Result<Option<SessionIndex>, EngineError> {
        self.request(|reply| EngineRequest::Select { index, reply }).await
    }

    pub async fn clear_selection(&self) -> Result<(), EngineError> {
        // Selecting `None` always lands on idle, whatever the current state.
        self.select(None).await.map(|_| ())
    }

    pub async fn set_margin(&self, margin: f32) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineRequest::SetMargin { margin, reply })
            .await??)
    }

    pub async fn set_ratio(&self, ratio: AspectRatio) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetRatio { ratio, reply }).await
    }

    /// Switch capture to `device`. On failure the previous camera stays active.
    pub async fn set_camera(&self, device: String) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineRequest::SetCamera { device, reply })
            .await??)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Ask the engine to stop. The thread clears the frame slot on exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
    }
}

/// Camera settings for the engine.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Warn after this many consecutive capture failures.
    pub miss_warn: u32,
}

/// Everything the frame loop owns.
struct EngineState {
    pipeline: FramePipeline,
    slot: Arc<FrameSlot>,
    capture: CaptureSettings,
    stats: FrameStats,
    camera_resolution: Option<(u32, u32)>,
    camera_path: Option<String>,
    last_faces: usize,
    last_known: Option<bool>,
}

/// What the command handler wants the loop to do next.
enum Control {
    Continue,
    SwitchCamera {
        device: String,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    Shutdown,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera is opened on the engine thread; if that fails the engine runs
/// without one and still answers requests, so a camera can be set later.
pub fn spawn_engine(
    pipeline: FramePipeline,
    capture: CaptureSettings,
    slot: Arc<FrameSlot>,
) -> Result<(EngineHandle, std::thread::JoinHandle<()>), EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);

    let thread = std::thread::Builder::new()
        .name("framer-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let state = EngineState {
                pipeline,
                slot,
                capture,
                stats: FrameStats::default(),
                camera_resolution: None,
                camera_path: None,
                last_faces: 0,
                last_known: None,
            };
            run(state, rx);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { tx }, thread))
}

fn run(mut state: EngineState, mut rx: mpsc::Receiver<EngineRequest>) {
    let mut camera = match Camera::open(&state.capture.device, state.capture.width, state.capture.height) {
        Ok(cam) => Some(cam),
        Err(e) => {
            tracing::warn!(
                device = %state.capture.device,
                error = %e,
                "camera unavailable; running without capture"
            );
            None
        }
    };

    loop {
        state.attach(camera.as_ref());
        let control = match camera.as_ref() {
            Some(cam) => run_session(&mut state, cam, &mut rx),
            None => idle_without_camera(&mut state, &mut rx),
        };

        match control {
            Control::Continue => {
                // Stream could not start; fall back to waiting for a new camera.
                camera = None;
            }
            Control::SwitchCamera { device, reply } => {
                match Camera::open(&device, state.capture.width, state.capture.height) {
                    Ok(new_camera) => {
                        tracing::info!(device = %device, "camera switched");
                        camera = Some(new_camera);
                        state.capture.device = device;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::warn!(device = %device, error = %e, "camera switch failed; keeping current camera");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Control::Shutdown => break,
        }
    }

    drop(camera);
    state.slot.clear();
}

/// Capture and process frames until a command ends the session.
fn run_session(state: &mut EngineState, camera: &Camera, rx: &mut mpsc::Receiver<EngineRequest>) -> Control {
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(device = %camera.device_path, error = %e, "failed to start capture");
            return Control::Continue;
        }
    };

    loop {
        loop {
            match rx.try_recv() {
                Ok(req) => match state.handle(req) {
                    Control::Continue => {}
                    other => return other,
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Control::Shutdown,
            }
        }

        match stream.next_frame() {
            Ok(frame) => state.process(&frame.image),
            Err(e) => {
                if state.stats.record_miss(state.capture.miss_warn) {
                    tracing::warn!(
                        error = %e,
                        consecutive = state.stats.consecutive_misses,
                        "camera keeps failing to deliver frames"
                    );
                } else {
                    tracing::debug!(error = %e, "capture miss");
                }
            }
        }
    }
}

/// Serve commands while no camera is available.
fn idle_without_camera(state: &mut EngineState, rx: &mut mpsc::Receiver<EngineRequest>) -> Control {
    while let Some(req) = rx.blocking_recv() {
        match state.handle(req) {
            Control::Continue => {}
            other => return other,
        }
    }
    Control::Shutdown
}

impl EngineState {
    fn attach(&mut self, camera: Option<&Camera>) {
        self.camera_path = camera.map(|c| c.device_path.clone());
        self.camera_resolution = camera.map(|c| (c.width, c.height));
        self.stats.reset_timing();
    }

    fn process(&mut self, frame: &image::RgbImage) {
        let outcome = self.pipeline.process(frame);
        self.stats.record_frame(Instant::now());
        self.last_faces = outcome.faces;
        if outcome.tracked_known.is_some() {
            self.last_known = outcome.tracked_known;
        }
        tracing::trace!(
            faces = outcome.faces,
            tracked = ?outcome.tracked_box,
            "frame processed"
        );
        self.slot.publish(outcome.output);
    }

    fn handle(&mut self, req: EngineRequest) -> Control {
        match req {
            EngineRequest::Select { index, reply } => {
                let current = self.pipeline.tracker().tracked_index();
                let next = if index.is_some() && index == current { None } else { index };
                self.pipeline.select(next);
                self.last_known = None;
                let _ = reply.send(next);
            }
            EngineRequest::SetMargin { margin, reply } => {
                let result = self.pipeline.set_margin(margin);
                if result.is_ok() {
                    tracing::info!(margin, "tracking margin set");
                }
                let _ = reply.send(result);
            }
            EngineRequest::SetRatio { ratio, reply } => {
                self.pipeline.set_ratio(ratio);
                tracing::info!(%ratio, "aspect ratio set");
                let _ = reply.send(());
            }
            EngineRequest::SetCamera { device, reply } => {
                return Control::SwitchCamera { device, reply };
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Shutdown => return Control::Shutdown,
        }
        Control::Continue
    }

    fn status(&self) -> EngineStatus {
        let tracker = self.pipeline.tracker();
        EngineStatus {
            camera: self.camera_path.clone(),
            camera_resolution: self.camera_resolution,
            fps: self.stats.fps,
            fps_smoothed: self.stats.fps_smoothed,
            frames: self.stats.frames,
            tracked_index: tracker.tracked_index(),
            margin: tracker.margin(),
            aspect_ratio: self.pipeline.ratio().to_string(),
            faces_in_last_frame: self.last_faces,
            tracked_known: self.last_known,
            capture_misses: self.stats.total_misses,
            consecutive_capture_misses: self.stats.consecutive_misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framer_core::{DetectorError, FaceBox, FaceDetector, FaceTracker, FrameCompositor};
    use image::RgbImage;
    use std::time::Duration;

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    fn pipeline() -> FramePipeline {
        FramePipeline::new(
            Box::new(NoFaces),
            FaceTracker::default(),
            FrameCompositor::new(32, 18),
            AspectRatio::WIDE,
        )
    }

    fn spawn_without_camera(slot: Arc<FrameSlot>) -> (EngineHandle, std::thread::JoinHandle<()>) {
        let capture = CaptureSettings {
            device: "/dev/video-framer-test-missing".into(),
            width: 640,
            height: 360,
            miss_warn: 30,
        };
        spawn_engine(pipeline(), capture, slot).unwrap()
    }

    #[test]
    fn test_fps_from_frame_interval() {
        let mut stats = FrameStats::default();
        let t0 = Instant::now();
        stats.record_frame(t0);
        assert_eq!(stats.fps, 0.0);
        stats.record_frame(t0 + Duration::from_millis(50));
        assert!((stats.fps - 20.0).abs() < 1e-3);
        assert!((stats.fps_smoothed - 20.0).abs() < 1e-3);
        stats.record_frame(t0 + Duration::from_millis(150));
        assert!((stats.fps - 10.0).abs() < 1e-3);
        assert!((stats.fps_smoothed - 19.0).abs() < 1e-3);
        assert_eq!(stats.frames, 3);
    }

    #[test]
    fn test_miss_warning_cadence() {
        let mut stats = FrameStats::default();
        let warnings: Vec<bool> = (0..7).map(|_| stats.record_miss(3)).collect();
        assert_eq!(warnings, vec![false, false, true, false, false, true, false]);
        assert_eq!(stats.total_misses, 7);

        stats.record_frame(Instant::now());
        assert_eq!(stats.consecutive_misses, 0);
        assert_eq!(stats.total_misses, 7);
    }

    #[tokio::test]
    async fn test_runs_without_camera() {
        let (engine, thread) = spawn_without_camera(Arc::new(FrameSlot::new()));
        let status = engine.status().await.unwrap();
        assert_eq!(status.camera, None);
        assert_eq!(status.frames, 0);
        assert_eq!(status.aspect_ratio, "16:9");
        engine.shutdown().await;
        tokio::task::spawn_blocking(move || thread.join().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_select_toggles_and_clears() {
        let (engine, _thread) = spawn_without_camera(Arc::new(FrameSlot::new()));
        assert_eq!(engine.select(Some(2)).await.unwrap(), Some(2));
        assert_eq!(engine.select(Some(1)).await.unwrap(), Some(1));
        assert_eq!(engine.select(Some(1)).await.unwrap(), None);
        engine.select(Some(0)).await.unwrap();
        engine.clear_selection().await.unwrap();
        assert_eq!(engine.status().await.unwrap().tracked_index, None);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_margin_and_ratio_commands() {
        let (engine, _thread) = spawn_without_camera(Arc::new(FrameSlot::new()));
        assert!(matches!(
            engine.set_margin(-0.5).await,
            Err(EngineError::Tracker(TrackerError::InvalidMargin(_)))
        ));
        engine.set_margin(2.0).await.unwrap();
        engine.set_ratio(AspectRatio::SQUARE).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.margin, 2.0);
        assert_eq!(status.aspect_ratio, "1:1");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_camera_switch_is_reported() {
        let (engine, _thread) = spawn_without_camera(Arc::new(FrameSlot::new()));
        let result = engine.set_camera("/dev/video-framer-also-missing".into()).await;
        assert!(matches!(result, Err(EngineError::Camera(CameraError::DeviceNotFound(_)))));
        // Engine still answers afterwards.
        assert!(engine.status().await.is_ok());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_slot_and_closes_channel() {
        let slot = Arc::new(FrameSlot::new());
        slot.publish(RgbImage::new(32, 18));
        let (engine, thread) = spawn_without_camera(Arc::clone(&slot));

        engine.shutdown().await;
        tokio::task::spawn_blocking(move || thread.join().unwrap()).await.unwrap();
        assert!(slot.is_empty());
        assert!(matches!(engine.status().await, Err(EngineError::ChannelClosed)));
    }
}
