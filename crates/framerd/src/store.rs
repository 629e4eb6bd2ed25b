//! SQLite cache of reference-image embeddings, keyed by file name and
//! modification time.

use chrono::{DateTime, Utc};
use framer_core::Embedding;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt embedding for {file_name}: {source}")]
    Corrupt {
        file_name: String,
        source: serde_json::Error,
    },
}

/// One cached row.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEmbedding {
    pub file_name: String,
    pub mtime_ns: i64,
    pub embedding: Embedding,
    pub computed_at: DateTime<Utc>,
}

pub struct EmbeddingCache {
    conn: Connection,
}

impl EmbeddingCache {
    /// Open (creating if needed) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                 file_name   TEXT PRIMARY KEY,
                 mtime_ns    INTEGER NOT NULL,
                 embedding   TEXT NOT NULL,
                 computed_at TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    /// Cached entry for `file_name`, only if it was computed for `mtime_ns`.
    pub fn lookup(&self, file_name: &str, mtime_ns: i64) -> Result<Option<CachedEmbedding>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT embedding, computed_at FROM embeddings
                 WHERE file_name = ?1 AND mtime_ns = ?2",
                params![file_name, mtime_ns],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(json, computed_at)| {
            let embedding = serde_json::from_str(&json).map_err(|source| CacheError::Corrupt {
                file_name: file_name.to_string(),
                source,
            })?;
            Ok(CachedEmbedding {
                file_name: file_name.to_string(),
                mtime_ns,
                embedding,
                computed_at: parse_timestamp(&computed_at),
            })
        })
        .transpose()
    }

    /// Replace the cache contents with exactly `entries`.
    pub fn retain_only(&mut self, entries: &[CachedEmbedding]) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM embeddings", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (file_name, mtime_ns, embedding, computed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                let json = serde_json::to_string(&entry.embedding).map_err(|source| {
                    CacheError::Corrupt {
                        file_name: entry.file_name.clone(),
                        source,
                    }
                })?;
                insert.execute(params![
                    entry.file_name,
                    entry.mtime_ns,
                    json,
                    entry.computed_at.to_rfc3339()
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(rows = entries.len(), "embedding cache rewritten");
        Ok(())
    }

    /// Drop rows whose file no longer exists in `dir` or has been modified.
    /// Returns the number of rows removed.
    pub fn prune_missing(&mut self, dir: &Path) -> Result<usize, CacheError> {
        let rows: Vec<(String, i64)> = {
            let mut stmt = self.conn.prepare("SELECT file_name, mtime_ns FROM embeddings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let stale: HashSet<String> = rows
            .into_iter()
            .filter(|(name, mtime)| file_mtime_ns(&dir.join(name)).ok() != Some(*mtime))
            .map(|(name, _)| name)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        for name in &stale {
            tx.execute("DELETE FROM embeddings WHERE file_name = ?1", params![name])?;
        }
        tx.commit()?;
        Ok(stale.len())
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// File modification time in nanoseconds since the Unix epoch.
pub fn file_mtime_ns(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(since_epoch.as_nanos() as i64)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
