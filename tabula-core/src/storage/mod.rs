//! Storage context, block manager, block cache and handle pool

mod block_manager;
mod cache;
mod handle_pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

pub use block_manager::{BlockLocation, BlockManager};
pub use cache::{BlockCache, BlockCacheKey, CacheStats, PinnedBlock};
pub use handle_pool::{HandlePool, StreamGuard};

use crate::codec::CodecOptions;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::io::{FileSystem, LocalFileSystem, MemoryFileSystem};

/// File extension of segment data files
pub const SEGMENT_FILE_EXTENSION: &str = "tcol";

/// Everything the storage layer needs, passed explicitly instead of living
/// in a process-wide registry: filesystem, block manager, scratch directory
/// and configuration.
#[derive(Debug)]
pub struct StorageContext {
    fs: Arc<dyn FileSystem>,
    blocks: BlockManager,
    scratch_dir: PathBuf,
    config: StorageConfig,
}

/// Shared storage context handle
pub type StorageRef = Arc<StorageContext>;

impl StorageContext {
    /// Storage on the local disk. Scratch files go to `config.scratch_dir`,
    /// or to a fresh directory under the system temp dir.
    pub fn new(config: StorageConfig) -> Result<StorageRef> {
        let scratch_dir = config.scratch_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("tabula-{}", Uuid::new_v4().simple()))
        });
        Self::with_filesystem(Arc::new(LocalFileSystem), scratch_dir, config)
    }

    /// Storage over an arbitrary filesystem
    pub fn with_filesystem(
        fs: Arc<dyn FileSystem>,
        scratch_dir: PathBuf,
        config: StorageConfig,
    ) -> Result<StorageRef> {
        fs.create_dir_all(&scratch_dir)?;
        debug!(scratch = %scratch_dir.display(), "storage context created");
        Ok(Arc::new(Self {
            blocks: BlockManager::new(Arc::clone(&fs), &config),
            fs,
            scratch_dir,
            config,
        }))
    }

    /// Purely in-memory storage, mostly for tests
    pub fn in_memory(config: StorageConfig) -> StorageRef {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        Arc::new(Self {
            blocks: BlockManager::new(Arc::clone(&fs), &config),
            fs,
            scratch_dir: PathBuf::from("/scratch"),
            config,
        })
    }

    /// The filesystem
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// The block manager
    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    /// Storage configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Codec options derived from the configuration
    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions::from(&self.config)
    }

    /// Directory for temporary segment files
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// A fresh, unused segment file path in the scratch directory
    pub fn new_segment_path(&self) -> PathBuf {
        self.scratch_dir
            .join(format!("seg-{}.{}", Uuid::new_v4().simple(), SEGMENT_FILE_EXTENSION))
    }

    /// Segment data files currently in the scratch directory
    pub fn scratch_segment_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .fs
            .list(&self.scratch_dir)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(SEGMENT_FILE_EXTENSION))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_context_creates_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            scratch_dir: Some(dir.path().join("scratch")),
            ..StorageConfig::default()
        };
        let ctx = StorageContext::new(config).unwrap();
        assert!(ctx.scratch_dir().is_dir());
        let a = ctx.new_segment_path();
        let b = ctx.new_segment_path();
        assert_ne!(a, b);
        assert!(a.starts_with(ctx.scratch_dir()));
        assert!(ctx.scratch_segment_files().unwrap().is_empty());
    }
}
