use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

/// Turns record graphs into bytes and back.
///
/// Values are encoded as JSON and then optionally shrunk with zlib. Both the
/// wire protocol and the snapshot file go through a `Codec`, each with its own
/// compression setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    compression: Compression,
}

impl Codec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(value)?;
        match self.compression {
            Compression::None => Ok(raw),
            Compression::Zlib => compress(&raw),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.compression {
            Compression::None => Ok(serde_json::from_slice(bytes)?),
            Compression::Zlib => {
                let raw = decompress(bytes)?;
                Ok(serde_json::from_slice(&raw)?)
            }
        }
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Compression(e.to_string()))
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    Ok(out)
}
