use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::codec::Codec;
use crate::Result;

/// A single snapshot file, rewritten wholesale on every save.
pub struct SnapshotStore {
    path: PathBuf,
    codec: Codec,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P, codec: Codec) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            codec,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes to a sibling temp file first and renames it over the old
    /// snapshot, so a crash mid-write never leaves a truncated file behind.
    pub async fn save<T: Serialize>(&self, value: &T) -> Result<usize> {
        let bytes = self.codec.encode(value)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        tracing::trace!("Saved {} bytes to {:?}", bytes.len(), self.path);
        Ok(bytes.len())
    }

    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
