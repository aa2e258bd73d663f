use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable copy of every uploaded export, addressed by content hash so a
/// re-import of the same archive is recognisable.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(
        &self,
        imported_at: DateTime<Utc>,
        user_id: Uuid,
        content_hash: &str,
        file_name: &str,
    ) -> PathBuf {
        let day = imported_at.format("%Y%m%d").to_string();
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "bin".to_string());
        PathBuf::from(user_id.to_string())
            .join(day)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write `bytes` via a temp file and rename; an existing file with the same
    /// hash path is left untouched.
    pub async fn store(
        &self,
        imported_at: DateTime<Utc>,
        user_id: Uuid,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredExport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(imported_at, user_id, &content_hash, file_name);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(stored(true));
            }
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), absolute_path.display())
            });
        }
        Ok(stored(false))
    }
}
