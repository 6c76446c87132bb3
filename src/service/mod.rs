//! Orchestration between the coordinator, the artifact store, and progress
//! listeners.
//!
//! `compress` is the one caller-facing operation: it hands the job to the
//! worker, persists the winning bytes under the managed temp directory, and
//! returns a [`CompressedImage`] whose token is the only handle to the
//! artifact.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;
use tracing::{debug, error};

use crate::coordinator::Coordinator;
use crate::core::{
    CompressedImage, CompressionJob, CompressionOptions, ProgressBroadcaster, ProgressEvent,
};
use crate::registry::FileRegistry;
use crate::utils::{CompressorResult, sanitize_filename};

pub struct CompressorService {
    coordinator: Coordinator,
    registry: Arc<FileRegistry>,
    progress: ProgressBroadcaster,
}

impl CompressorService {
    pub fn new(coordinator: Coordinator, registry: Arc<FileRegistry>) -> Self {
        Self {
            coordinator,
            registry,
            progress: ProgressBroadcaster::new(),
        }
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    /// Compresses `image`, stores the winning artifact, and returns its
    /// token plus statistics.
    pub async fn compress(
        &self,
        image: Vec<u8>,
        filename: String,
        options: CompressionOptions,
    ) -> CompressorResult<CompressedImage> {
        let filename = sanitize_filename(&filename).to_string();
        self.progress
            .broadcast(ProgressEvent::started(&filename))
            .await;

        let original_size = image.len() as u64;
        let job = CompressionJob {
            image,
            filename: filename.clone(),
            options,
        };

        let outcome = match self.coordinator.submit(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("compression failed for {}: {}", filename, e);
                self.progress
                    .broadcast(ProgressEvent::error(&filename, e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let artifact_name = output_filename(&filename, &outcome.best_tool);
        let artifact_path = self.registry.root().join(&artifact_name);
        if let Err(e) = fs::write(&artifact_path, &outcome.compressed).await {
            error!(
                "failed to persist artifact {}: {}",
                artifact_path.display(),
                e
            );
            self.progress
                .broadcast(ProgressEvent::error(&filename, e.to_string()))
                .await;
            return Err(e.into());
        }

        let compressed_size = outcome.compressed.len() as u64;
        let token = self
            .registry
            .register(
                &artifact_path,
                filename.clone(),
                outcome.best_tool.clone(),
                original_size,
                compressed_size,
            )
            .await;
        debug!(
            "{} compressed with {} ({} -> {} bytes, {:.1}%)",
            filename, outcome.best_tool, original_size, compressed_size, outcome.compression_ratio
        );

        let result = CompressedImage {
            token,
            best_tool: outcome.best_tool,
            compression_ratio: outcome.compression_ratio,
            total_duration_ms: outcome.total_duration_ms,
            original_size,
            compressed_size,
            all_results: outcome.all_results,
        };
        self.progress
            .broadcast(ProgressEvent::completed(
                &filename,
                serde_json::json!({
                    "token": &result.token,
                    "bestTool": &result.best_tool,
                    "compressionRatio": result.compression_ratio,
                }),
            ))
            .await;
        Ok(result)
    }

    /// Terminates the worker; in-flight requests are rejected.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}

/// Artifact filename: `{stem}_{tool}_{millis}{ext}`, preserving the
/// original extension so content-type inference keeps working.
fn output_filename(original: &str, tool: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    match original.rfind('.') {
        Some(index) if index > 0 => {
            let (stem, extension) = original.split_at(index);
            format!("{stem}_{tool}_{millis}{extension}")
        }
        _ => format!("{original}_{tool}_{millis}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{duplex, split};

    use crate::core::ProgressStatus;
    use crate::engine::Engine;
    use crate::engine::testing::FixedTool;
    use crate::utils::CompressorError;
    use crate::worker;

    async fn service_with_engine(engine: Engine, registry: Arc<FileRegistry>) -> CompressorService {
        let (host, remote) = duplex(1 << 20);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let _ = worker::serve(remote_read, remote_write, engine).await;
        });
        let coordinator = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        CompressorService::new(coordinator, registry)
    }

    #[tokio::test]
    async fn end_to_end_compression_yields_a_resolvable_token() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::init(dir.path()).await.unwrap());
        let engine = Engine::new(vec![FixedTool::new("mock", vec![7; 50])]);
        let service = service_with_engine(engine, registry.clone()).await;

        let mut events = service.progress().subscribe().await;

        let result = service
            .compress(vec![1; 100], "a.png".into(), CompressionOptions::default())
            .await
            .unwrap();

        assert_eq!(result.best_tool, "mock");
        assert_eq!(result.original_size, 100);
        assert_eq!(result.compressed_size, 50);
        assert_eq!(result.compression_ratio, 50.0);
        assert_eq!(result.all_results.len(), 1);

        // the token resolves to a file holding exactly the worker's bytes
        let artifact = registry.resolve(&result.token).await.unwrap();
        assert_eq!(artifact.original_filename, "a.png");
        assert_eq!(artifact.tool, "mock");
        let bytes = fs::read(&artifact.path).await.unwrap();
        assert_eq!(bytes, vec![7; 50]);
        assert!(artifact.path.starts_with(registry.root()));

        assert_eq!(events.recv().await.unwrap().status, ProgressStatus::Started);
        let completed = events.recv().await.unwrap();
        assert_eq!(completed.status, ProgressStatus::Completed);
        assert_eq!(completed.filename, "a.png");
    }

    #[tokio::test]
    async fn worker_failure_broadcasts_an_error_event() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::init(dir.path()).await.unwrap());
        let service = service_with_engine(Engine::new(Vec::new()), registry.clone()).await;

        let mut events = service.progress().subscribe().await;
        let err = service
            .compress(vec![1; 10], "b.png".into(), CompressionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::Compression(_)));
        assert!(registry.is_empty().await);

        assert_eq!(events.recv().await.unwrap().status, ProgressStatus::Started);
        assert_eq!(events.recv().await.unwrap().status, ProgressStatus::Error);
    }

    #[tokio::test]
    async fn hostile_filenames_cannot_escape_the_temp_directory() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::init(dir.path()).await.unwrap());
        let engine = Engine::with_default_tools();
        let service = service_with_engine(engine, registry.clone()).await;

        let result = service
            .compress(
                vec![1; 10],
                "../../escape.png".into(),
                CompressionOptions::default(),
            )
            .await
            .unwrap();

        let artifact = registry.resolve(&result.token).await.unwrap();
        assert!(artifact.path.starts_with(registry.root()));
        assert_eq!(artifact.original_filename, "escape.png");
    }

    #[test]
    fn output_filenames_keep_the_extension() {
        let name = output_filename("photo.png", "mock");
        assert!(name.starts_with("photo_mock_"));
        assert!(name.ends_with(".png"));

        let bare = output_filename("README", "mock");
        assert!(bare.starts_with("README_mock_"));
        assert!(!bare.contains('.'));

        // a leading dot is not an extension separator
        let dotfile = output_filename(".hidden", "mock");
        assert!(dotfile.starts_with(".hidden_mock_"));
    }
}
