//! MJPEG-over-HTTP output (`multipart/x-mixed-replace`).

use crate::slot::FrameSlot;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

const BOUNDARY: &str = "frame";

#[derive(Clone)]
struct StreamState {
    slot: Arc<FrameSlot>,
    poll: Duration,
    quality: u8,
    shutdown: watch::Receiver<bool>,
}

/// Router serving the live output at `GET /`.
///
/// Every client stream ends once `shutdown` turns true or its sender is
/// dropped.
pub fn router(slot: Arc<FrameSlot>, fps: u32, quality: u8, shutdown: watch::Receiver<bool>) -> Router {
    Router::new().route("/", get(mjpeg)).with_state(StreamState {
        slot,
        poll: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
        quality,
        shutdown,
    })
}

/// Resolves when `shutdown` turns true or its sender goes away.
pub async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn mjpeg(State(state): State<StreamState>) -> Response {
    tracing::info!("MJPEG client connected");
    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )],
        Body::from_stream(parts(state)),
    )
        .into_response()
}

/// Multipart parts, one per new slot frame, until shutdown.
fn parts(state: StreamState) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    let mut ticker = interval(state.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    stream::unfold((state, ticker, 0u64), |(state, mut ticker, mut last_seq)| async move {
        loop {
            tokio::select! {
                biased;
                _ = stopped(state.shutdown.clone()) => {
                    tracing::info!("MJPEG client disconnected: output stopped");
                    return None;
                }
                _ = ticker.tick() => {}
            }
            let Some((seq, frame)) = state.slot.latest() else {
                continue;
            };
            if seq == last_seq {
                continue;
            }
            last_seq = seq;

            let quality = state.quality;
            let encoded = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality)).await;
            match encoded {
                Ok(Ok(jpeg)) => {
                    let part = Bytes::from(multipart_part(&jpeg));
                    return Some((Ok(part), (state, ticker, last_seq)));
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "JPEG encoding failed"),
                Err(e) => tracing::warn!(error = %e, "JPEG encoder task failed"),
            }
        }
    })
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(frame)?;
    Ok(jpeg)
}

fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
