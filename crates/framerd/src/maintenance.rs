//! Periodic pruning of stale embedding cache rows.

use crate::store::EmbeddingCache;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Background thread that runs [`EmbeddingCache::prune_missing`] every
/// `interval` on its own database connection.
pub struct CacheMaintenance {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CacheMaintenance {
    pub fn start(db_path: PathBuf, known_faces_dir: PathBuf, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("framer-cache-maintenance".into())
            .spawn(move || {
                tracing::info!(?interval, "cache maintenance started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => prune_once(&db_path, &known_faces_dir),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("cache maintenance stopped");
            })?;

        Ok(Self {
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to finish its current pass.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("cache maintenance thread panicked");
            }
        }
    }
}

impl Drop for CacheMaintenance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn prune_once(db_path: &std::path::Path, dir: &std::path::Path) {
    let result = EmbeddingCache::open(db_path).and_then(|mut cache| cache.prune_missing(dir));
    match result {
        Ok(0) => tracing::debug!("cache maintenance: nothing to prune"),
        Ok(removed) => tracing::info!(removed, "cache maintenance pruned stale embeddings"),
        Err(e) => tracing::warn!(error = %e, "cache maintenance failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CachedEmbedding;
    use chrono::Utc;
    use framer_core::Embedding;
    use std::time::Instant;

    #[test]
    fn test_prunes_in_background_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cache.db");
        EmbeddingCache::open(&db_path)
            .unwrap()
            .retain_only(&[CachedEmbedding {
                file_name: "gone.png".into(),
                mtime_ns: 1,
                embedding: Embedding::new(vec![1.0]),
                computed_at: Utc::now(),
            }])
            .unwrap();

        let maintenance =
            CacheMaintenance::start(db_path.clone(), dir.path().to_path_buf(), Duration::from_millis(20))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while EmbeddingCache::open(&db_path).unwrap().len().unwrap() > 0 {
            assert!(Instant::now() < deadline, "stale row was never pruned");
            std::thread::sleep(Duration::from_millis(10));
        }
        maintenance.stop();
    }

    #[test]
    fn test_stop_is_prompt_with_long_interval() {
        let dir = tempfile::tempdir().unwrap();
        let maintenance = CacheMaintenance::start(
            dir.path().join("cache.db"),
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
        )
        .unwrap();
        let started = Instant::now();
        maintenance.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
