//! Storage configuration

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::Compression;
use crate::error::Result;

/// Configuration for the block codec, block cache and file handle pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum number of elements per block
    pub block_size: usize,

    /// Decoded-bytes budget of the block cache
    pub cache_budget_bytes: usize,

    /// Maximum number of simultaneously open streams
    pub max_open_files: usize,

    /// Payload compression codec
    pub compression: Compression,

    /// Distinct-value count at or below which dictionary encoding is used
    pub dictionary_threshold: usize,

    /// Payloads smaller than this are stored uncompressed
    pub min_compress_bytes: usize,

    /// Directory for temporary segment files; a fresh directory under the
    /// system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_budget_bytes: 256 * 1024 * 1024,
            max_open_files: 64,
            compression: Compression::Lz4,
            dictionary_threshold: 256,
            min_compress_bytes: 512,
            scratch_dir: None,
        }
    }
}

impl StorageConfig {
    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }
}

/// Read any serde-deserializable config from a JSON file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
