//! Token-addressed registry over the managed temp directory.
//!
//! Completed compressions are persisted as files under a single managed
//! directory; callers only ever see opaque tokens. Entries live until an
//! explicit [`FileRegistry::evict`] or an age-based [`FileRegistry::sweep`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::utils::{CompressorError, CompressorResult};

/// Metadata for one stored compression artifact.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Opaque retrieval token
    pub token: String,
    /// Absolute path of the artifact file
    pub path: PathBuf,
    /// Filename the caller originally submitted
    pub original_filename: String,
    /// Tool that produced the artifact
    pub tool: String,
    /// When the artifact was registered
    pub created_at: SystemTime,
    /// Input size in bytes
    pub original_size: u64,
    /// Artifact size in bytes
    pub compressed_size: u64,
}

impl StoredArtifact {
    /// Age of the artifact; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

/// Token → artifact table over the managed temp directory.
pub struct FileRegistry {
    root: PathBuf,
    entries: Mutex<HashMap<String, StoredArtifact>>,
}

impl FileRegistry {
    /// Creates the managed directory and verifies it is writable.
    ///
    /// An unwritable directory is fatal to startup.
    pub async fn init(root: impl Into<PathBuf>) -> CompressorResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            CompressorError::initialization(format!(
                "failed to create temp directory {}: {e}",
                root.display()
            ))
        })?;
        // resolve symlinks once so confinement checks compare canonical paths
        let root = fs::canonicalize(&root).await.map_err(|e| {
            CompressorError::initialization(format!(
                "failed to canonicalize temp directory {}: {e}",
                root.display()
            ))
        })?;

        let probe = root.join(format!(".write-probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"").await.map_err(|e| {
            CompressorError::initialization(format!(
                "temp directory {} is not writable: {e}",
                root.display()
            ))
        })?;
        let _ = fs::remove_file(&probe).await;

        info!("temp directory ready: {}", root.display());
        Ok(Self {
            root,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// The managed temp directory all artifacts must live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores artifact metadata and mints its retrieval token.
    pub async fn register(
        &self,
        path: impl Into<PathBuf>,
        original_filename: impl Into<String>,
        tool: impl Into<String>,
        original_size: u64,
        compressed_size: u64,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        let artifact = StoredArtifact {
            token: token.clone(),
            path: path.into(),
            original_filename: original_filename.into(),
            tool: tool.into(),
            created_at: SystemTime::now(),
            original_size,
            compressed_size,
        };
        debug!("registered artifact {} -> {}", token, artifact.path.display());
        self.entries.lock().await.insert(token.clone(), artifact);
        token
    }

    /// Looks up an artifact by token.
    pub async fn resolve(&self, token: &str) -> Option<StoredArtifact> {
        self.entries.lock().await.get(token).cloned()
    }

    /// Removes the entry and deletes its backing file.
    ///
    /// Returns false when the token is unknown; deleting twice is safe, and
    /// an already-missing backing file only logs.
    pub async fn evict(&self, token: &str) -> bool {
        let removed = self.entries.lock().await.remove(token);
        match removed {
            Some(artifact) => {
                if let Err(e) = fs::remove_file(&artifact.path).await {
                    warn!("failed to delete {}: {}", artifact.path.display(), e);
                }
                debug!("evicted artifact {}", token);
                true
            }
            None => false,
        }
    }

    /// Evicts every artifact older than `max_age`; zero evicts everything.
    ///
    /// Deletion failures are logged and do not abort the sweep. Returns the
    /// number of entries removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let expired: Vec<StoredArtifact> = {
            let mut entries = self.entries.lock().await;
            let tokens: Vec<String> = entries
                .values()
                .filter(|artifact| artifact.age() >= max_age)
                .map(|artifact| artifact.token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect()
        };

        for artifact in &expired {
            if let Err(e) = fs::remove_file(&artifact.path).await {
                warn!(
                    "sweep could not delete {}: {}",
                    artifact.path.display(),
                    e
                );
            }
        }

        if !expired.is_empty() {
            info!("swept {} expired artifacts", expired.len());
        }
        expired.len()
    }

    /// Number of registered artifacts.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Test hook: plant an arbitrary entry, bypassing `register`.
    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, artifact: StoredArtifact) {
        self.entries
            .lock()
            .await
            .insert(artifact.token.clone(), artifact);
    }

    /// Test hook: rewind an entry's creation time by `by`.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, token: &str, by: Duration) {
        if let Some(artifact) = self.entries.lock().await.get_mut(token) {
            artifact.created_at = SystemTime::now() - by;
        }
    }
}
