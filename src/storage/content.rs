//! Body content store with cascading layers

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use crate::config::{validate_layer_name, DEFAULT_LAYER};
use crate::Result;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Recorded bodies under `root/<layer>/<resource path>`
///
/// Reads walk the requested layers in order and fall back to the default
/// layer; writes always go to the default layer.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Store rooted at the cache root
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a resource body inside a layer
    #[must_use]
    pub fn layer_path(&self, layer: &str, resource_path: &str) -> PathBuf {
        self.root.join(layer).join(resource_path)
    }

    /// Layers to consult, in order: valid cascade entries, then the default
    #[must_use]
    pub fn layers<'a>(cascade: &'a [String]) -> Vec<&'a str> {
        let mut layers: Vec<&str> = cascade
            .iter()
            .map(String::as_str)
            .filter(|layer| *layer != DEFAULT_LAYER && validate_layer_name(layer).is_ok())
            .collect();
        layers.push(DEFAULT_LAYER);
        layers
    }

    /// First existing body file among the cascade layers
    pub async fn resolve(&self, resource_path: &str, cascade: &[String]) -> Option<PathBuf> {
        for layer in Self::layers(cascade) {
            let candidate = self.layer_path(layer, resource_path);
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                debug!("Resolved {} in layer '{}'", resource_path, layer);
                return Some(candidate);
            }
        }
        None
    }

    /// Read a body fresh from disk; `None` when no layer has it
    ///
    /// # Errors
    ///
    /// Returns error if an existing file cannot be read
    pub async fn read(&self, resource_path: &str, cascade: &[String]) -> Result<Option<Bytes>> {
        let Some(path) = self.resolve(resource_path, cascade).await else {
            return Ok(None);
        };
        let data = tokio::fs::read(&path).await?;
        Ok(Some(Bytes::from(data)))
    }

    /// Write a body into the default layer, replacing any previous file
    ///
    /// # Errors
    ///
    /// Returns error if directories or the file cannot be written
    pub async fn write(&self, resource_path: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.layer_path(DEFAULT_LAYER, resource_path);
        write_atomic(&path, data).await?;
        debug!("Stored {} bytes at {}", data.len(), path.display());
        Ok(path)
    }
}

/// Write through a temporary sibling file and rename it into place
///
/// # Errors
///
/// Returns error if the parent directory or the file cannot be written
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_default_layer() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path().to_path_buf());

        let path = store
            .write("get/http/example.com/index.html", b"hello")
            .await
            .unwrap();
        assert_eq!(
            path,
            temp_dir.path().join("default/get/http/example.com/index.html")
        );

        let data = store
            .read("get/http/example.com/index.html", &[])
            .await
            .unwrap();
        assert_eq!(data.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_read_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path().to_path_buf());
        assert!(store.read("get/http/nope/index.html", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascade_precedence() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path().to_path_buf());
        let rel = "get/http/example.com/a.css";

        store.write(rel, b"base").await.unwrap();
        write_atomic(&store.layer_path("cascade1", rel), b"one")
            .await
            .unwrap();

        let cascade = vec!["cascade2".to_string(), "cascade1".to_string()];
        assert_eq!(store.read(rel, &cascade).await.unwrap().unwrap(), "one");
        assert_eq!(store.read(rel, &[]).await.unwrap().unwrap(), "base");

        write_atomic(&store.layer_path("cascade2", rel), b"two")
            .await
            .unwrap();
        assert_eq!(store.read(rel, &cascade).await.unwrap().unwrap(), "two");
    }

    #[test]
    fn test_layers_skip_unsafe_names() {
        let cascade = vec![
            "../etc".to_string(),
            "overrides".to_string(),
            "default".to_string(),
        ];
        assert_eq!(ContentStore::layers(&cascade), vec!["overrides", "default"]);
    }

    #[tokio::test]
    async fn test_write_replaces_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path().to_path_buf());
        let rel = "get/http/example.com/index.html";

        store.write(rel, b"first version").await.unwrap();
        store.write(rel, b"second").await.unwrap();
        assert_eq!(store.read(rel, &[]).await.unwrap().unwrap(), "second");
    }
}
