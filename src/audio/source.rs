//! Read-only asset stores and the sequential byte source over one asset

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::AudioError;

/// A packaged, read-only resource store keyed by file name
pub trait AssetStore: Send + Sync {
    /// Open `name` for sequential reading
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AudioError>;
}

/// Assets stored as files below a root directory
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, AudioError> {
        let relative = Path::new(name);
        let escapes = name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AudioError::InvalidAssetName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl AssetStore for DirAssetStore {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AudioError> {
        let path = self.resolve(name)?;
        match File::open(&path) {
            Ok(file) if path.is_file() => Ok(Box::new(file)),
            Ok(_) => Err(AudioError::AssetNotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AudioError::AssetNotFound(name.to_string()))
            }
            Err(e) => Err(AudioError::io(name, e)),
        }
    }
}

/// Assets held in memory, shared between readers without copying
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetStore {
    assets: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        self.assets.write().insert(name.into(), data.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.assets.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assets.read().contains_key(name)
    }
}

impl AssetStore for MemoryAssetStore {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AudioError> {
        let data = self
            .assets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AudioError::AssetNotFound(name.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Sequential reader over one opened asset.
///
/// Owned exclusively by the refill thread of the active session. A read that
/// returns fewer bytes than requested marks the end of the stream.
pub struct AssetByteSource {
    name: String,
    reader: Option<Box<dyn Read + Send>>,
    offset: u64,
    at_eof: bool,
}

impl AssetByteSource {
    pub fn open(store: &dyn AssetStore, name: &str) -> Result<Self, AudioError> {
        let reader = store.open(name)?;
        tracing::debug!(asset = name, "Opened asset");
        Ok(Self {
            name: name.to_string(),
            reader: Some(reader),
            offset: 0,
            at_eof: false,
        })
    }

    /// Fill `buf` as far as the asset allows and return the byte count.
    ///
    /// Keeps reading until `buf` is full or the asset is exhausted, so a
    /// short count always means end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        if self.at_eof {
            return Ok(0);
        }

        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.at_eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(AudioError::io(&self.name, e)),
            }
        }

        self.offset += filled as u64;
        Ok(filled)
    }

    /// Release the underlying reader. Further reads return 0.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(asset = %self.name, offset = self.offset, "Closed asset");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_eof(&self) -> bool {
        self.at_eof
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}

impl Drop for AssetByteSource {
    fn drop(&mut self) {
        self.close();
    }
}
