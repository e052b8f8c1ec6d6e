//! Payload Encoding
//!
//! Reversible compaction of large payloads before they reach the durable
//! tier. The codec is injectable; LZ4 is the default. Small payloads and
//! payloads the codec cannot shrink are stored as plain JSON.
//!
//! # Example
//!
//! ```
//! use couchecache::cache::compression::{EncodingConfig, PayloadEncoder};
//!
//! let encoder = PayloadEncoder::new(EncodingConfig { threshold_bytes: 16, ..Default::default() });
//!
//! let json = br#"{"items":["a","a","a","a","a","a","a","a","a","a","a","a"]}"#;
//! let stored = encoder.encode(json, true);
//!
//! let restored = encoder.decode(&stored.bytes, stored.codec.as_deref()).unwrap();
//! assert_eq!(restored.as_ref(), json);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Encoding Configuration
// =============================================================================

/// Configuration for the encoding layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Serialized payloads larger than this are encoded
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// Reversible byte-string codec
pub trait Codec: Send + Sync {
    /// Name persisted alongside encoded rows
    fn name(&self) -> &'static str;

    /// Compact data
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Reverse `encode`
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through codec
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block codec (size-prefixed)
#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec {
    level: i32,
}

impl Lz4Codec {
    /// Create with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with a custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::EncodingFailed {
            codec: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecodingFailed {
            codec: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Payload Encoder
// =============================================================================

/// Bytes ready for the durable tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Stored bytes
    pub bytes: Bytes,
    /// Codec used, `None` when the bytes are plain JSON
    pub codec: Option<String>,
}

impl EncodedPayload {
    /// Whether the bytes went through a codec
    pub fn is_encoded(&self) -> bool {
        self.codec.is_some()
    }
}

/// Threshold-driven encoder with fallback to the plain form
#[derive(Clone)]
pub struct PayloadEncoder {
    config: EncodingConfig,
    codec: Arc<dyn Codec>,
}

impl PayloadEncoder {
    /// LZ4 encoder
    pub fn new(config: EncodingConfig) -> Self {
        let codec = Arc::new(Lz4Codec::with_level(config.level));
        Self { config, codec }
    }

    /// Encoder with a custom codec
    pub fn with_codec(config: EncodingConfig, codec: Arc<dyn Codec>) -> Self {
        Self { config, codec }
    }

    /// Encode serialized JSON when it exceeds the threshold.
    ///
    /// Falls back to the plain bytes when `allow` is false, the payload is
    /// small, the codec fails, or the codec output is not smaller.
    pub fn encode(&self, json: &[u8], allow: bool) -> EncodedPayload {
        if !allow || json.len() <= self.config.threshold_bytes {
            return Self::plain(json);
        }

        match self.codec.encode(json) {
            Ok(encoded) if encoded.len() < json.len() => EncodedPayload {
                bytes: Bytes::from(encoded),
                codec: Some(self.codec.name().to_string()),
            },
            Ok(_) => Self::plain(json),
            Err(e) => {
                tracing::warn!("Encoding failed, storing uncompacted payload: {}", e);
                Self::plain(json)
            }
        }
    }

    /// Reverse `encode`. `codec` is the name recorded with the row.
    pub fn decode(&self, bytes: &[u8], codec: Option<&str>) -> Result<Bytes> {
        match codec {
            None => Ok(Bytes::copy_from_slice(bytes)),
            Some(name) if name == self.codec.name() => {
                Ok(Bytes::from(self.codec.decode(bytes)?))
            }
            Some(name) => Err(Error::DecodingFailed {
                codec: name.to_string(),
                reason: format!("configured codec is {}", self.codec.name()),
            }),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &EncodingConfig {
        &self.config
    }

    fn plain(json: &[u8]) -> EncodedPayload {
        EncodedPayload {
            bytes: Bytes::copy_from_slice(json),
            codec: None,
        }
    }
}

impl Default for PayloadEncoder {
    fn default() -> Self {
        Self::new(EncodingConfig::default())
    }
}

impl std::fmt::Debug for PayloadEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadEncoder")
            .field("config", &self.config)
            .field("codec", &self.codec.name())
            .finish()
    }
}
