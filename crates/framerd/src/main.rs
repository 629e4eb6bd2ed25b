use anyhow::{Context, Result};
use framer_core::{
    Embedder, FaceTracker, FrameCompositor, FramePipeline, KnownFaceRegistry, OnnxEmbedder,
    RecognitionEngine, ScrfdDetector, TrackedRecognition,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod gallery;
mod maintenance;
mod outputs;
mod slot;
mod store;
mod stream;

use config::Config;
use dbus_interface::{FramerService, BUS_NAME, OBJECT_PATH};
use engine::CaptureSettings;
use maintenance::CacheMaintenance;
use outputs::{OutputSettings, Outputs};
use slot::FrameSlot;
use store::EmbeddingCache;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("framerd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        known_faces = %config.known_faces_dir.display(),
        output_mode = %config.output_mode,
        "configuration loaded"
    );

    let detector = ScrfdDetector::load(
        &config.detector_model_path(),
        framer_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
    )
    .context("failed to load face detector")?;

    let embedder = match OnnxEmbedder::load(&config.embedder_model_path(), config.face_size) {
        Ok(embedder) => Some(embedder),
        Err(e) => {
            tracing::warn!(error = %e, "embedding model unavailable; face recognition disabled");
            None
        }
    };

    let (registry, embedder) = load_registry(&config, embedder).await?;
    let registry = Arc::new(registry);

    let maintenance = if config.maintenance_interval_secs > 0 {
        Some(
            CacheMaintenance::start(
                config.db_path.clone(),
                config.known_faces_dir.clone(),
                Duration::from_secs(config.maintenance_interval_secs),
            )
            .context("failed to start cache maintenance")?,
        )
    } else {
        None
    };

    let mut pipeline = FramePipeline::new(
        Box::new(detector),
        FaceTracker::new(config.tracking_margin, config.smoothing_alpha)?,
        FrameCompositor::new(config.output_width, config.output_height),
        config.aspect_ratio,
    );
    if let Some(embedder) = embedder {
        pipeline = pipeline.with_recognition(TrackedRecognition {
            engine: RecognitionEngine::new(config.similarity_threshold, config.face_size),
            embedder: Box::new(embedder),
            registry: Arc::clone(&registry),
            every: config.recognize_every,
        });
    }

    let slot = Arc::new(FrameSlot::new());
    let capture = CaptureSettings {
        device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        miss_warn: config.capture_miss_warn,
    };
    let (engine, engine_thread) = engine::spawn_engine(pipeline, capture, Arc::clone(&slot))?;

    let mut outputs = Outputs::new(Arc::clone(&slot), OutputSettings::from(&config));
    if let Err(e) = outputs.set_mode(config.output_mode).await {
        tracing::warn!(mode = %config.output_mode, error = %e, "output unavailable; running without output");
    }
    let outputs = Arc::new(tokio::sync::Mutex::new(outputs));

    let service = FramerService::new(engine.clone(), Arc::clone(&outputs), Arc::clone(&registry));
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the D-Bus session bus")?;

    tracing::info!(bus = BUS_NAME, known_faces = registry.len(), "framerd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("framerd shutting down");

    outputs.lock().await.stop().await;
    engine.shutdown().await;
    tokio::task::spawn_blocking(move || {
        if engine_thread.join().is_err() {
            tracing::error!("engine thread panicked");
        }
    })
    .await?;
    if let Some(maintenance) = maintenance {
        maintenance.stop();
    }

    Ok(())
}

/// Build the known-face registry on a blocking thread, handing the
/// embedder back for use in the frame loop.
async fn load_registry(
    config: &Config,
    embedder: Option<OnnxEmbedder>,
) -> Result<(KnownFaceRegistry, Option<OnnxEmbedder>)> {
    let db_path = config.db_path.clone();
    let dir = config.known_faces_dir.clone();
    let face_size = config.face_size;

    tokio::task::spawn_blocking(move || {
        let mut embedder = embedder;
        let mut cache = EmbeddingCache::open(&db_path).or_else(|e| {
            tracing::warn!(path = %db_path.display(), error = %e, "embedding cache unavailable; using a temporary one");
            EmbeddingCache::open_in_memory()
        })?;
        let registry = gallery::load_gallery(
            &dir,
            &mut cache,
            embedder.as_mut().map(|e| e as &mut dyn Embedder),
            face_size,
        )
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load known faces");
            KnownFaceRegistry::default()
        });
        Ok::<_, anyhow::Error>((registry, embedder))
    })
    .await
    .context("known-face loading task failed")?
}
