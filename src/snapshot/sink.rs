//! Snapshot storage backends.
//!
//! Two sinks implement the same capability interface: a filesystem
//! directory of image files, and a SQLite database used purely as opaque
//! blob storage. Both return names in ascending lexicographic order,
//! which is creation order because image names carry a sortable
//! timestamp prefix.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()>;
    /// All stored image names, ascending.
    async fn list(&self) -> Result<Vec<String>>;
    async fn load(&self, name: &str) -> Result<Vec<u8>>;
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Filesystem directory sink. Writes are staged to a temp file and
/// renamed into place so a crashed emission never leaves a partial
/// image under a valid name.
pub struct FsSink {
    dir: PathBuf,
}

impl FsSink {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl SnapshotSink for FsSink {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{}.tmp", name));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = data.len(), "snapshot written");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.dir.join(name)).await?)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.dir.join(name)).await?;
        debug!(name, "snapshot removed");
        Ok(())
    }
}

/// SQLite blob sink. A fresh connection is opened per operation inside
/// `spawn_blocking`; image bytes are opaque to the schema.
pub struct SqliteSink {
    path: PathBuf,
}

impl SqliteSink {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let sink = Self { path };
        sink.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS snapshots (
                    name TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    data BLOB NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(sink)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("snapshot db task failed: {}", e)))?
        .map_err(|e| Error::Internal(format!("snapshot db: {}", e)))
    }
}

#[async_trait]
impl SnapshotSink for SqliteSink {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let name = name.to_string();
        let data = data.to_vec();
        let created_at = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO snapshots (name, created_at, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, created_at, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM snapshots ORDER BY name ASC")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn load(&self, name: &str) -> Result<Vec<u8>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT data FROM snapshots WHERE name = ?1",
                [name],
                |row| row.get::<_, Vec<u8>>(0),
            )
        })
        .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM snapshots WHERE name = ?1", [name])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_sink(sink: &dyn SnapshotSink) {
        sink.store("20260101000000000.json.gz", b"one").await.unwrap();
        sink.store("20260101000001000.json.gz", b"two").await.unwrap();
        // stores of the same name overwrite
        sink.store("20260101000001000.json.gz", b"two-b")
            .await
            .unwrap();

        let names = sink.list().await.unwrap();
        assert_eq!(
            names,
            vec!["20260101000000000.json.gz", "20260101000001000.json.gz"]
        );

        assert_eq!(
            sink.load("20260101000001000.json.gz").await.unwrap(),
            b"two-b"
        );

        sink.remove("20260101000000000.json.gz").await.unwrap();
        assert_eq!(sink.list().await.unwrap().len(), 1);
        assert!(sink.load("20260101000000000.json.gz").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_sink() {
        let dir = TempDir::new().unwrap();
        let sink = FsSink::new(dir.path()).await.unwrap();
        exercise_sink(&sink).await;
    }

    #[tokio::test]
    async fn test_sqlite_sink() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::new(dir.path().join("snapshots.db")).await.unwrap();
        exercise_sink(&sink).await;
    }
}
