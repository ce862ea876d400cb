//! Local filesystem storage provider.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use super::{BackupItem, BodyReader, Provider};
use crate::error::{Result, SnapError};

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are flat object names; anything path-like is rejected.
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(SnapError::Storage(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn upload(&self, key: &str, mut body: BodyReader) -> Result<()> {
        let final_path = self.object_path(key)?;
        // Stage under a partial name so a failed stream never leaves a
        // readable object behind; the rename is the commit point.
        let partial_path = self.root.join(format!("{key}.partial"));

        let mut file = tokio::fs::File::create(&partial_path).await?;
        let result = async {
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&partial_path, &final_path).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                Err(SnapError::Storage(format!("upload failed: {e}")))
            }
        }
    }

    async fn download(&self, key: &str) -> Result<BodyReader> {
        let path = self.object_path(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| SnapError::Storage(format!("failed to open {key}: {e}")))?;
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) || name.ends_with(".partial") {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            items.push(BackupItem {
                key: name,
                size: meta.len(),
                last_modified: modified,
            });
        }

        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();

        let body: BodyReader = Box::new(std::io::Cursor::new(b"backup bytes".to_vec()));
        provider.upload("demo_20240101_000000.tar.gz", body).await.unwrap();

        let mut reader = provider.download("demo_20240101_000000.tar.gz").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"backup bytes");
    }

    #[tokio::test]
    async fn test_list_filters_prefix_and_partials() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();

        for key in ["demo_a.tar.gz", "demo_b.tar.gz", "other.tar.gz"] {
            let body: BodyReader = Box::new(std::io::Cursor::new(b"x".to_vec()));
            provider.upload(key, body).await.unwrap();
        }
        std::fs::write(dir.path().join("demo_c.tar.gz.partial"), b"junk").unwrap();

        let items = provider.list("demo_").await.unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["demo_a.tar.gz", "demo_b.tar.gz"]);
        assert!(items.iter().all(|i| i.size == 1));
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_object() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();

        struct FailingReader;
        impl tokio::io::AsyncRead for FailingReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("stream broke")))
            }
        }

        let result = provider.upload("demo.tar.gz", Box::new(FailingReader)).await;
        assert!(result.is_err());
        assert!(provider.list("").await.unwrap().is_empty());
        assert!(provider.download("demo.tar.gz").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        assert!(provider.download("../escape").await.is_err());
        assert!(provider.download("a/b").await.is_err());
    }
}
