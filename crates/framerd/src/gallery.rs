//! Known-faces directory loading, backed by the embedding cache.

use crate::store::{file_mtime_ns, CachedEmbedding, EmbeddingCache};
use chrono::Utc;
use framer_core::{Embedder, KnownFaceEntry, KnownFaceRegistry};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Image files in `dir`, sorted by file name.
fn list_images(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read = std::fs::read_dir(dir).map_err(|source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut images: Vec<PathBuf> = read
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Build the known-face registry from the images in `dir`.
///
/// Cached embeddings are reused when the file's modification time matches;
/// everything else is embedded, if an embedder is available, or skipped.
/// Afterwards the cache holds exactly the images used in this load. Cache
/// write failures are logged and do not affect the returned registry.
pub fn load_gallery(
    dir: &Path,
    cache: &mut EmbeddingCache,
    mut embedder: Option<&mut dyn Embedder>,
    face_size: u32,
) -> Result<KnownFaceRegistry, GalleryError> {
    let mut registry = KnownFaceRegistry::default();

    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "known faces directory not found; no faces loaded");
        write_back(cache, &[]);
        return Ok(registry);
    }

    let mut seen = Vec::new();
    let (mut hits, mut computed, mut skipped) = (0usize, 0usize, 0usize);

    for path in list_images(dir)? {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            skipped += 1;
            continue;
        };
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());

        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "skipping unreadable image");
                skipped += 1;
                continue;
            }
        };
        // Without a usable mtime the image is still loaded, just never cached.
        let mtime_ns = match file_mtime_ns(&path) {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "no modification time; embedding without cache");
                None
            }
        };

        let cached = mtime_ns.and_then(|mtime_ns| match cache.lookup(&file_name, mtime_ns) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "ignoring unreadable cache entry");
                None
            }
        });

        let (embedding, row) = match (cached, embedder.as_deref_mut()) {
            (Some(hit), _) => {
                hits += 1;
                (hit.embedding.clone(), Some(hit))
            }
            (None, Some(embedder)) => {
                match KnownFaceRegistry::embed_reference(&image, embedder, face_size) {
                    Ok(embedding) => {
                        computed += 1;
                        let row = mtime_ns.map(|mtime_ns| CachedEmbedding {
                            file_name: file_name.clone(),
                            mtime_ns,
                            embedding: embedding.clone(),
                            computed_at: Utc::now(),
                        });
                        (embedding, row)
                    }
                    Err(e) => {
                        tracing::warn!(file = %file_name, error = %e, "skipping image: embedding failed");
                        skipped += 1;
                        continue;
                    }
                }
            }
            (None, None) => {
                tracing::debug!(file = %file_name, "no embedder and no cached embedding; skipping");
                skipped += 1;
                continue;
            }
        };

        registry.push(KnownFaceEntry {
            reference_image: image,
            embedding,
            label,
        });
        seen.extend(row);
    }

    write_back(cache, &seen);
    tracing::info!(
        dir = %dir.display(),
        faces = registry.len(),
        cached = hits,
        computed,
        skipped,
        "known faces loaded"
    );
    Ok(registry)
}

fn write_back(cache: &mut EmbeddingCache, seen: &[CachedEmbedding]) {
    if let Err(e) = cache.retain_only(seen) {
        tracing::warn!(error = %e, rows = seen.len(), "failed to update embedding cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framer_core::{Embedding, RecognizerError};
    use image::{Rgb, RgbImage};
    use std::time::{Duration, UNIX_EPOCH};

    /// Embeds an image as its mean color; counts calls.
    #[derive(Default)]
    struct MeanColorEmbedder {
        calls: usize,
        last_size: Option<(u32, u32)>,
    }

    impl Embedder for MeanColorEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
            self.calls += 1;
            self.last_size = Some(face.dimensions());
            let n = face.pixels().len() as f32;
            let mut sum = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
        }
    }

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(20, 24, Rgb(color)).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_missing_dir_gives_empty_registry_and_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        cache
            .retain_only(&[CachedEmbedding {
                file_name: "old.jpg".into(),
                mtime_ns: 1,
                embedding: Embedding::new(vec![1.0]),
                computed_at: Utc::now(),
            }])
            .unwrap();

        let mut embedder = MeanColorEmbedder::default();
        let registry =
            load_gallery(&dir.path().join("absent"), &mut cache, Some(&mut embedder), 160).unwrap();
        assert!(registry.is_empty());
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_loads_sorted_images_with_stem_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "bob.png", [0, 0, 200]);
        write_image(dir.path(), "alice.PNG", [200, 0, 0]);
        std::fs::write(dir.path().join("notes.txt"), b"not a face").unwrap();

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut embedder = MeanColorEmbedder::default();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();

        let labels: Vec<&str> = registry.labels().collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        assert_eq!(embedder.calls, 2);
        assert_eq!(embedder.last_size, Some((160, 160)));
        assert_eq!(registry.get(0).unwrap().reference_image.dimensions(), (20, 24));
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn test_second_load_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut first = MeanColorEmbedder::default();
        let a = load_gallery(dir.path(), &mut cache, Some(&mut first), 160).unwrap();

        let mut second = MeanColorEmbedder::default();
        let b = load_gallery(dir.path(), &mut cache, Some(&mut second), 160).unwrap();
        assert_eq!(second.calls, 0);
        assert_eq!(a.get(0).unwrap().embedding, b.get(0).unwrap().embedding);
    }

    #[test]
    fn test_stale_cache_entry_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);
        let mtime = file_mtime_ns(&dir.path().join("alice.png")).unwrap();

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        cache
            .retain_only(&[CachedEmbedding {
                file_name: "alice.png".into(),
                mtime_ns: mtime - 1,
                embedding: Embedding::new(vec![9.0, 9.0, 9.0]),
                computed_at: Utc::now(),
            }])
            .unwrap();

        let mut embedder = MeanColorEmbedder::default();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();
        assert_eq!(embedder.calls, 1);
        assert_ne!(registry.get(0).unwrap().embedding.values, vec![9.0, 9.0, 9.0]);
        assert!(cache.lookup("alice.png", mtime).unwrap().is_some());
    }

    #[test]
    fn test_removed_file_leaves_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);
        write_image(dir.path(), "bob.png", [0, 0, 200]);

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut embedder = MeanColorEmbedder::default();
        load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();
        std::fs::remove_file(dir.path().join("bob.png")).unwrap();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_without_embedder_uses_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut embedder = MeanColorEmbedder::default();
        load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();

        write_image(dir.path(), "bob.png", [0, 0, 200]);
        let registry = load_gallery(dir.path(), &mut cache, None, 160).unwrap();
        let labels: Vec<&str> = registry.labels().collect();
        assert_eq!(labels, vec!["alice"]);
    }

    #[test]
    fn test_pre_epoch_mtime_is_loaded_but_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);
        write_image(dir.path(), "bob.png", [0, 0, 200]);
        let old = UNIX_EPOCH - Duration::from_secs(86_400);
        std::fs::File::options()
            .write(true)
            .open(dir.path().join("alice.png"))
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(file_mtime_ns(&dir.path().join("alice.png")).is_err());

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut embedder = MeanColorEmbedder::default();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();

        let labels: Vec<&str> = registry.labels().collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_cache_write_failure_keeps_registry() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [200, 0, 0]);
        let db_path = dir.path().join("cache").join("embeddings.db");
        let mut cache = EmbeddingCache::open(&db_path).unwrap();

        // Swap the table for a read-only view so every rewrite fails.
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "DROP TABLE embeddings;
                 CREATE VIEW embeddings AS
                     SELECT 'x' AS file_name, 0 AS mtime_ns, '[]' AS embedding, '' AS computed_at;",
            )
            .unwrap();
        assert!(cache.retain_only(&[]).is_err());

        let mut embedder = MeanColorEmbedder::default();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();
        let labels: Vec<&str> = registry.labels().collect();
        assert_eq!(labels, vec!["alice"]);
        assert_eq!(embedder.calls, 1);
    }

    #[test]
    fn test_unreadable_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();
        write_image(dir.path(), "carol.jpeg", [10, 200, 10]);

        let mut cache = EmbeddingCache::open_in_memory().unwrap();
        let mut embedder = MeanColorEmbedder::default();
        let registry = load_gallery(dir.path(), &mut cache, Some(&mut embedder), 160).unwrap();
        let labels: Vec<&str> = registry.labels().collect();
        assert_eq!(labels, vec!["carol"]);
    }
}
