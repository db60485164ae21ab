//! Where turn audio lives
//!
//! Uploaded recordings and synthesized replies are parked under a
//! conversation-scoped key and handed back to clients as a signed URL.
//! The trait keeps the pipeline indifferent to the backing blob store;
//! the filesystem adapter serves single-host deployments and the memory
//! adapter serves tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use spar_core::{AudioFormat, ConversationId, Result, SparError, TurnId};

/// Blob storage for turn audio
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// A URL a client can fetch the clip from.
    async fn sign(&self, path: &str) -> Result<String>;
}

/// Conventional key for one turn's audio.
pub fn audio_path(conversation_id: ConversationId, turn_id: TurnId, format: AudioFormat) -> String {
    format!("{}/{}.{}", conversation_id, turn_id, format.extension())
}

fn validate_key(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|part| part == "..") {
        return Err(SparError::AudioStore(format!("invalid audio key: {path}")));
    }
    Ok(())
}

/// Audio on the local filesystem, served by URL prefix
pub struct FsAudioStore {
    root: PathBuf,
    base_url: String,
}

impl FsAudioStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_key(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl AudioStore for FsAudioStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        tracing::debug!("stored {} byte(s) at {}", bytes.len(), full.display());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        if !Path::new(&full).exists() {
            return Err(SparError::AudioStore(format!("no audio at {path}")));
        }
        Ok(tokio::fs::read(&full).await?)
    }

    async fn sign(&self, path: &str) -> Result<String> {
        validate_key(path)?;
        Ok(format!("{}/{}", self.base_url, path))
    }
}

/// In-memory audio store for tests and scripted runs
#[derive(Default)]
pub struct MemoryAudioStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        validate_key(path)?;
        self.blobs
            .write()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        validate_key(path)?;
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| SparError::AudioStore(format!("no audio at {path}")))
    }

    async fn sign(&self, path: &str) -> Result<String> {
        validate_key(path)?;
        Ok(format!("memory://{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_key_shape() {
        let conversation = ConversationId::new();
        let turn = TurnId::new();
        let key = audio_path(conversation, turn, AudioFormat::Mp3);
        assert_eq!(key, format!("{}/{}.mp3", conversation, turn));
    }

    #[tokio::test]
    async fn test_fs_roundtrip_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAudioStore::new(dir.path(), "http://localhost:8460/audio/");

        let key = audio_path(ConversationId::new(), TurnId::new(), AudioFormat::Wav);
        store.put(&key, b"wav bytes", "audio/wav").await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), b"wav bytes");
        assert_eq!(
            store.sign(&key).await.unwrap(),
            format!("http://localhost:8460/audio/{key}")
        );
    }

    #[tokio::test]
    async fn test_fs_missing_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAudioStore::new(dir.path(), "http://localhost:8460/audio");

        let err = store.get("conv/turn.mp3").await.unwrap_err();
        assert_eq!(err.code(), "audio_storage_error");
    }

    #[tokio::test]
    async fn test_traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAudioStore::new(dir.path(), "http://localhost:8460/audio");

        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("/absolute", b"x", "audio/wav").await.is_err());
        assert!(store.sign("a/../../b").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryAudioStore::new();
        store.put("c/t.mp3", &[1, 2, 3], "audio/mpeg").await.unwrap();
        assert_eq!(store.get("c/t.mp3").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.sign("c/t.mp3").await.unwrap(), "memory://c/t.mp3");
        assert!(store.get("c/other.mp3").await.is_err());
    }
}
