//! Pluggable block codecs for Avro object container files.
//!
//! Every block payload in a container file is compressed with the codec named
//! in the file header (`avro.codec`). Codecs are looked up by that name in a
//! global registry, so additional algorithms can be plugged in without touching
//! the block reader.
//!
//! ## Built-in Codecs
//!
//! - **null** - identity, always available
//! - **deflate** - raw DEFLATE without zlib framing, via `flate2` (feature: `compression-deflate`)
//! - **snappy** - raw snappy followed by a big-endian CRC32 of the uncompressed
//!   data, via `snap` and `crc32fast` (feature: `compression-snappy`)
//! - **zstandard** (also read as **zstd**) - via `zstd` (feature: `compression-zstd`)
//! - **bzip2** - via `bzip2` (feature: `compression-bzip2`)
//! - **xz** - via `xz2` (feature: `compression-xz`)
//!
//! Decompression is bounded: a codec never returns more than the `limit` it is
//! handed, so a hostile block cannot expand without bound.
//!
//! ## Custom Codecs
//! ```
//! use ironfeed::io::compression::{register_codec, codec_for, ensure_within, BlockCodec};
//! use std::sync::Arc;
//!
//! struct Reversed;
//!
//! impl BlockCodec for Reversed {
//!     fn name(&self) -> &str { "reversed" }
//!
//!     fn decompress(&self, mut payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
//!         ensure_within(payload.len(), limit)?;
//!         payload.reverse();
//!         Ok(payload)
//!     }
//!
//!     fn compress(&self, mut data: Vec<u8>) -> std::io::Result<Vec<u8>> {
//!         data.reverse();
//!         Ok(data)
//!     }
//! }
//!
//! register_codec(Arc::new(Reversed));
//! assert!(codec_for("reversed").is_some());
//! ```

use std::io::{Error, ErrorKind, Read};
use std::sync::{Arc, PoisonError, RwLock};

/// Global codec registry.
static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn BlockCodec>>>> = RwLock::new(None);

fn init_registry() -> Vec<Arc<dyn BlockCodec>> {
    vec![
        Arc::new(NullCodec),
        #[cfg(feature = "compression-deflate")]
        Arc::new(DeflateCodec),
        #[cfg(feature = "compression-snappy")]
        Arc::new(SnappyCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Arc::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Arc::new(XzCodec),
    ]
}

/// Register a custom block codec globally.
///
/// A codec registered under the name of an existing one takes precedence.
pub fn register_codec(codec: Arc<dyn BlockCodec>) {
    let mut lock = CODEC_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(init_registry).push(codec);
}

/// Look up the codec registered under `name` or one of its aliases.
#[must_use]
pub fn codec_for(name: &str) -> Option<Arc<dyn BlockCodec>> {
    let mut lock = CODEC_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(init_registry)
        .iter()
        .rev()
        .find(|c| c.name() == name || c.aliases().contains(&name))
        .cloned()
}

/// Fail with `InvalidData` when `len` decompressed bytes exceed `limit`.
///
/// # Errors
/// `InvalidData` naming the limit.
pub fn ensure_within(len: usize, limit: usize) -> std::io::Result<()> {
    if len > limit {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("block expands beyond the {limit}-byte limit"),
        ));
    }
    Ok(())
}

/// Drain a streaming decoder, stopping as soon as it yields more than `limit` bytes.
///
/// # Errors
/// Decoder failures, or `InvalidData` once the output passes `limit`.
pub fn read_bounded(decoder: impl Read, limit: usize, size_hint: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size_hint.min(limit));
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    ensure_within(out.len(), limit)?;
    Ok(out)
}

/// Names of all registered codecs, in registration order.
#[must_use]
pub fn registered_codecs() -> Vec<String> {
    let mut lock = CODEC_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(init_registry)
        .iter()
        .map(|c| c.name().to_string())
        .collect()
}

/// Compression algorithm for whole block payloads.
///
/// # Thread Safety
/// Implementations are shared through the global registry and called from
/// reader threads concurrently.
pub trait BlockCodec: Send + Sync {
    /// The `avro.codec` header value this codec handles.
    fn name(&self) -> &str;

    /// Other header values that select this codec.
    fn aliases(&self) -> &[&str] {
        &[]
    }

    /// Decompress one block payload into at most `limit` bytes.
    ///
    /// # Errors
    /// Returns `InvalidData` for payloads that do not decode, fail checksums,
    /// or expand beyond `limit`.
    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>>;

    /// Compress one block payload.
    ///
    /// # Errors
    /// Propagates encoder failures.
    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>>;
}

// ============================================================================
// Built-in Codec Implementations
// ============================================================================

struct NullCodec;

impl BlockCodec for NullCodec {
    fn name(&self) -> &str {
        "null"
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        ensure_within(payload.len(), limit)?;
        Ok(payload)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        Ok(data)
    }
}

#[cfg(feature = "compression-deflate")]
struct DeflateCodec;

#[cfg(feature = "compression-deflate")]
impl BlockCodec for DeflateCodec {
    fn name(&self) -> &str {
        "deflate"
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        use flate2::read::DeflateDecoder;
        read_bounded(DeflateDecoder::new(payload.as_slice()), limit, payload.len() * 2)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        use flate2::Compression;
        use flate2::write::DeflateEncoder;
        use std::io::Write;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()
    }
}

#[cfg(feature = "compression-snappy")]
struct SnappyCodec;

#[cfg(feature = "compression-snappy")]
impl BlockCodec for SnappyCodec {
    fn name(&self) -> &str {
        "snappy"
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        let Some(split) = payload.len().checked_sub(4) else {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "snappy block shorter than its checksum",
            ));
        };
        let (body, crc) = payload.split_at(split);
        let len = snap::raw::decompress_len(body).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        ensure_within(len, limit)?;
        let out = snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = crc32fast::hash(&out);
        if expected != actual {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("snappy checksum mismatch: expected {expected:#010x}, got {actual:#010x}"),
            ));
        }
        Ok(out)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        let mut out = snap::raw::Encoder::new()
            .compress_vec(&data)
            .map_err(std::io::Error::other)?;
        out.extend_from_slice(&crc32fast::hash(&data).to_be_bytes());
        Ok(out)
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl BlockCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstandard"
    }

    fn aliases(&self) -> &[&str] {
        &["zstd"]
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        let decoder = zstd::stream::read::Decoder::new(payload.as_slice())?;
        read_bounded(decoder, limit, payload.len() * 2)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        zstd::stream::encode_all(data.as_slice(), 3)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl BlockCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        use bzip2::read::BzDecoder;
        read_bounded(BzDecoder::new(payload.as_slice()), limit, payload.len() * 2)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        use bzip2::Compression;
        use bzip2::write::BzEncoder;
        use std::io::Write;
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl BlockCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn decompress(&self, payload: Vec<u8>, limit: usize) -> std::io::Result<Vec<u8>> {
        use xz2::read::XzDecoder;
        read_bounded(XzDecoder::new(payload.as_slice()), limit, payload.len() * 2)
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        use std::io::Write;
        use xz2::write::XzEncoder;
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&data)?;
        encoder.finish()
    }
}
