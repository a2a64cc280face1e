//! Persisted index file (`network.json`)

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::MatchStrategy;
use crate::index::ResourceIndex;
use crate::{ProxyError, Result};

use super::content::write_atomic;

/// Location of the JSON index of a cache root
#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    /// Index file at `path`
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the index; a missing file yields an empty index
    ///
    /// # Errors
    ///
    /// Returns `IndexCorrupted` if the file exists but does not parse,
    /// or an I/O error if it cannot be read
    pub async fn load(&self, strategy: MatchStrategy) -> Result<ResourceIndex> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index at {}, starting empty", self.path.display());
                return Ok(ResourceIndex::new(strategy));
            }
            Err(e) => return Err(e.into()),
        };

        let index = ResourceIndex::from_json(&json, strategy).map_err(|e| {
            ProxyError::IndexCorrupted {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        info!(
            "Loaded {} resources from {}",
            index.len(),
            self.path.display()
        );
        Ok(index)
    }

    /// Write an already serialized index
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn write(&self, json: &str) -> Result<()> {
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!("Saved index to {}", self.path.display());
        Ok(())
    }
}
