//! Payload Compression for the compressed tier
//!
//! Compressed payloads are framed so a reader can tell them apart from
//! payloads written uncompressed:
//!
//! ```text
//! "TCZ" | algorithm byte | compressed body
//! ```
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::CompressionManager;
//!
//! let manager = CompressionManager::new();
//!
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data.";
//! let framed = manager.compress(data).unwrap();
//!
//! let restored = manager.decompress_or_raw(&framed, data.len());
//! assert_eq!(restored.as_ref(), data);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const FRAME_MAGIC: &[u8; 3] = b"TCZ";
const FRAME_HEADER_LEN: usize = 4;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Stored as-is inside a frame
    None,
    /// LZ4 block with prepended size
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Fails rather than produce more than `max_len` bytes
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>>;
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason,
        };
        let (declared, body) = match data {
            [a, b, c, d, body @ ..] => (u32::from_le_bytes([*a, *b, *c, *d]), body),
            _ => return Err(failed("missing size prefix".into())),
        };
        // lz4 allocates the declared size up front
        if declared as usize > max_len {
            return Err(failed(format!(
                "declared size {} exceeds limit {}",
                declared, max_len
            )));
        }
        let size = i32::try_from(declared)
            .map_err(|_| failed(format!("declared size {} out of range", declared)))?;
        lz4::block::decompress(body, Some(size)).map_err(|e| failed(e.to_string()))
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Frames and unframes compressed-tier payloads
pub struct CompressionManager {
    enabled: bool,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// LZ4 at the default level
    pub fn new() -> Self {
        Self::with_settings(true, 4)
    }

    pub fn with_settings(enabled: bool, level: i32) -> Self {
        Self {
            enabled,
            lz4: Lz4Compressor::with_level(level),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compress and frame `data`.
    ///
    /// With compression disabled the raw bytes are returned unframed.
    /// Data that does not shrink is framed with [`CompressionAlgorithm::None`].
    pub fn compress(&self, data: &[u8]) -> Result<Bytes> {
        if !self.enabled {
            return Ok(Bytes::copy_from_slice(data));
        }

        let compressed = self.lz4.compress(data)?;
        let (algorithm, body) = if compressed.len() < data.len() {
            (self.lz4.algorithm(), compressed.as_slice())
        } else {
            (CompressionAlgorithm::None, data)
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_slice(FRAME_MAGIC);
        buf.put_u8(algorithm.to_byte());
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Strict unframing; fails on missing frames, bad bodies or output
    /// longer than `max_len`
    pub fn decompress(&self, data: &[u8], max_len: usize) -> Result<Bytes> {
        let (algorithm, body) = split_frame(data).ok_or_else(|| Error::DecompressionFailed {
            algorithm: "framed".into(),
            reason: "missing frame header".into(),
        })?;
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(body)),
            CompressionAlgorithm::Lz4 => Ok(Bytes::from(self.lz4.decompress(body, max_len)?)),
        }
    }

    /// Unframe, treating anything that cannot be decompressed as already-decoded
    /// bytes. Payloads written while compression was disabled carry no frame
    /// and are read back this way.
    pub fn decompress_or_raw(&self, data: &[u8], max_len: usize) -> Bytes {
        if split_frame(data).is_none() {
            debug!(len = data.len(), "payload not framed, reading as uncompressed");
            return Bytes::copy_from_slice(data);
        }
        match self.decompress(data, max_len) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("decompression failed, reading payload as uncompressed: {}", e);
                Bytes::copy_from_slice(data)
            }
        }
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn split_frame(data: &[u8]) -> Option<(CompressionAlgorithm, &[u8])> {
    if data.len() < FRAME_HEADER_LEN || &data[..3] != FRAME_MAGIC {
        return None;
    }
    let algorithm = CompressionAlgorithm::from_byte(data[3])?;
    Some((algorithm, &data[FRAME_HEADER_LEN..]))
}
