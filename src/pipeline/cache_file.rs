//! On-disk pipeline cache.
//!
//! A flat table from pipeline content hash to the driver's cache blob,
//! serialized with bincode. A missing, corrupt or outdated file is treated as
//! an empty cache.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphicsError, GraphicsResult};

/// Bumped whenever the key derivation or the layout below changes.
pub const CACHE_FILE_VERSION: u32 = 1;

/// One persisted pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    pub key: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCacheFile {
    pub version: u32,
    pub entries: Vec<CacheFileEntry>,
}

impl PipelineCacheFile {
    pub fn new(entries: Vec<CacheFileEntry>) -> Self {
        Self {
            version: CACHE_FILE_VERSION,
            entries,
        }
    }

    pub fn encode(&self) -> GraphicsResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| GraphicsError::Io(format!("failed to encode pipeline cache: {e}")))
    }

    /// Decode a cache file, `None` if it is corrupt or from another version.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let decoded: Result<(Self, usize), _> =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard());
        match decoded {
            Ok((file, _)) if file.version == CACHE_FILE_VERSION => Some(file),
            Ok((file, _)) => {
                log::warn!(
                    "Ignoring pipeline cache version {} (expected {CACHE_FILE_VERSION})",
                    file.version
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring corrupt pipeline cache: {e}");
                None
            }
        }
    }

    /// Read `path`. Missing or unreadable files yield `Ok(None)`.
    pub fn read(path: &Path) -> GraphicsResult<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No pipeline cache at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                log::warn!("Cannot read pipeline cache {}: {e}", path.display());
                return Ok(None);
            }
        };
        Ok(Self::decode(&bytes))
    }

    /// Write to a temporary sibling and rename it over `path`.
    pub fn write(&self, path: &Path) -> GraphicsResult<()> {
        let bytes = self.encode()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
