mod codec;
mod kv;
mod snapshot;

pub use codec::{Codec, Compression};
pub use kv::KvStore;
pub use snapshot::SnapshotStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),
}
