use crate::engine::EngineHandle;
use crate::outputs::{OutputMode, Outputs};
use framer_core::{AspectRatio, KnownFaceRegistry};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Framer1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Framer1";

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// D-Bus control interface for the framing daemon.
///
/// Bus name: org.freedesktop.Framer1
/// Object path: /org/freedesktop/Framer1
pub struct FramerService {
    engine: EngineHandle,
    outputs: Arc<Mutex<Outputs>>,
    registry: Arc<KnownFaceRegistry>,
}

impl FramerService {
    pub fn new(engine: EngineHandle, outputs: Arc<Mutex<Outputs>>, registry: Arc<KnownFaceRegistry>) -> Self {
        Self {
            engine,
            outputs,
            registry,
        }
    }
}

#[interface(name = "org.freedesktop.Framer1")]
impl FramerService {
    /// Track the face at `index` in the detector's output. A negative index
    /// deselects; selecting the tracked index again toggles back to idle.
    /// Returns whether a face is tracked afterwards.
    async fn select_face(&self, index: i32) -> zbus::fdo::Result<bool> {
        let index = usize::try_from(index).ok();
        tracing::info!(?index, "select_face requested");
        let tracked = self.engine.select(index).await.map_err(failed)?;
        Ok(tracked.is_some())
    }

    async fn clear_selection(&self) -> zbus::fdo::Result<()> {
        self.engine.clear_selection().await.map_err(failed)
    }

    async fn set_margin(&self, margin: f64) -> zbus::fdo::Result<()> {
        self.engine.set_margin(margin as f32).await.map_err(failed)
    }

    async fn set_aspect_ratio(&self, name: &str) -> zbus::fdo::Result<()> {
        let ratio: AspectRatio = name.parse().map_err(failed)?;
        self.engine.set_ratio(ratio).await.map_err(failed)
    }

    /// Switch output to `stream`, `virtual_cam` or `none`.
    async fn set_output_mode(&self, mode: &str) -> zbus::fdo::Result<()> {
        let mode: OutputMode = mode.parse().map_err(failed)?;
        self.outputs.lock().await.set_mode(mode).await.map_err(|e| {
            tracing::warn!(%mode, error = %e, "output mode change failed");
            failed(e)
        })
    }

    async fn set_camera(&self, device: &str) -> zbus::fdo::Result<()> {
        tracing::info!(device, "set_camera requested");
        self.engine.set_camera(device.to_string()).await.map_err(failed)
    }

    /// JSON array of `{index, label, dimensions}` for the loaded known faces.
    async fn list_known_faces(&self) -> zbus::fdo::Result<String> {
        Ok(known_faces_json(&self.registry).to_string())
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self.engine.status().await.map_err(failed)?;
        let outputs = self.outputs.lock().await;

        let mut status = serde_json::to_value(&engine).map_err(failed)?;
        if let Some(obj) = status.as_object_mut() {
            obj.insert("version".into(), env!("CARGO_PKG_VERSION").into());
            obj.insert("output_mode".into(), outputs.mode().to_string().into());
            obj.insert(
                "stream_addr".into(),
                outputs.stream_addr().map(|a| a.to_string()).into(),
            );
            obj.insert("known_faces".into(), self.registry.len().into());
        }
        Ok(status.to_string())
    }
}

fn known_faces_json(registry: &KnownFaceRegistry) -> serde_json::Value {
    registry
        .entries()
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::json!({
                "index": index,
                "label": entry.label,
                "dimensions": [entry.reference_image.width(), entry.reference_image.height()],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use framer_core::{Embedding, KnownFaceEntry};
    use image::RgbImage;

    #[test]
    fn test_known_faces_json() {
        let mut registry = KnownFaceRegistry::default();
        registry.push(KnownFaceEntry {
            reference_image: RgbImage::new(120, 160),
            embedding: Embedding::new(vec![1.0]),
            label: "alice".into(),
        });
        registry.push(KnownFaceEntry {
            reference_image: RgbImage::new(64, 64),
            embedding: Embedding::new(vec![0.0, 1.0]),
            label: "bob".into(),
        });

        let json = known_faces_json(&registry);
        assert_eq!(
            json,
            serde_json::json!([
                {"index": 0, "label": "alice", "dimensions": [120, 160]},
                {"index": 1, "label": "bob", "dimensions": [64, 64]},
            ])
        );
    }

    #[test]
    fn test_empty_registry_lists_nothing() {
        assert_eq!(known_faces_json(&KnownFaceRegistry::default()).to_string(), "[]");
    }
}
