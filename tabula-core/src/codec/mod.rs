//! Block codec
//!
//! A block is the physical unit backing part of a segment:
//!
//! ```plain
//! | header | [validity bitmap | encoded present values] (maybe compressed) |
//! ```
//!
//! [`encode`] and [`decode`] are mutual inverses for every [`DataType`]. The
//! value encoding is chosen per block by inspecting the data; see
//! [`Encoding`].

mod encoding;
mod header;
pub mod varint;

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

pub use header::{BlockHeader, BLOCK_FORMAT_VERSION, BLOCK_MAGIC, HEADER_FIXED_LEN};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::value::{DataType, Value};

/// Payload compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    /// Stored raw
    None,
    /// LZ4 block compression
    Lz4,
    /// Zstandard
    Zstd,
}

impl Compression {
    /// Stable header tag
    pub fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    /// Inverse of [`Compression::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Compression::None => data.to_vec(),
            Compression::Lz4 => lz4::block::compress(data, None, false)?,
            Compression::Zstd => zstd::bulk::compress(data, 3)?,
        })
    }

    fn decompress(self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compression::None => data.to_vec(),
            Compression::Lz4 => {
                lz4::block::decompress(data, Some(uncompressed_len as i32))
                    .map_err(|e| Error::corrupt(format!("lz4: {}", e)))?
            }
            Compression::Zstd => zstd::bulk::decompress(data, uncompressed_len)
                .map_err(|e| Error::corrupt(format!("zstd: {}", e)))?,
        };
        if out.len() != uncompressed_len {
            return Err(Error::corrupt(format!(
                "decompressed {} bytes, header says {}",
                out.len(),
                uncompressed_len
            )));
        }
        Ok(out)
    }
}

/// Value encoding strategy of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Fixed-width little-endian (numbers) or length-prefixed (strings, bytes)
    Plain,
    /// First-appearance dictionary plus varint codes
    Dictionary,
    /// Zig-zag varint deltas between consecutive integers
    Delta,
    /// (value, run length) pairs
    RunLength,
    /// Raw f64 data of equally shaped arrays; the shape lives in the header
    Packed,
    /// Each value serialized with bincode and length-prefixed
    Generic,
}

impl Encoding {
    /// Stable header tag
    pub fn tag(self) -> u8 {
        match self {
            Encoding::Plain => 0,
            Encoding::Dictionary => 1,
            Encoding::Delta => 2,
            Encoding::RunLength => 3,
            Encoding::Packed => 4,
            Encoding::Generic => 5,
        }
    }

    /// Inverse of [`Encoding::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Encoding::Plain,
            1 => Encoding::Dictionary,
            2 => Encoding::Delta,
            3 => Encoding::RunLength,
            4 => Encoding::Packed,
            5 => Encoding::Generic,
            _ => return None,
        })
    }
}

/// Knobs for [`encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Compression codec tried on the payload
    pub compression: Compression,
    /// Distinct-value count at or below which dictionary encoding is used
    pub dictionary_threshold: usize,
    /// Payloads smaller than this are not compressed
    pub min_compress_bytes: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for CodecOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            compression: config.compression,
            dictionary_threshold: config.dictionary_threshold,
            min_compress_bytes: config.min_compress_bytes,
        }
    }
}

/// A fully encoded block, header included, ready to be written
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// Parsed header
    pub header: BlockHeader,
    /// Header bytes followed by the stored payload
    pub bytes: Bytes,
}

impl EncodedBlock {
    /// Number of elements in the block
    pub fn num_elements(&self) -> usize {
        self.header.num_elements as usize
    }

    /// Size on disk
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the block holds no bytes (never true for a valid block)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Values decoded from one block
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    /// Declared type recorded in the header
    pub data_type: DataType,
    /// Value encoding that was used
    pub encoding: Encoding,
    /// Values in order
    pub values: Vec<Value>,
}

impl DecodedBlock {
    /// Approximate in-memory footprint, used for cache accounting
    pub fn memory_size(&self) -> usize {
        self.values.iter().map(Value::estimated_size).sum::<usize>() + std::mem::size_of::<Self>()
    }
}

/// Encode one block's worth of values.
///
/// Values must be accepted by `data_type` (missing always is); integers are
/// widened for float blocks.
pub fn encode(values: &[Value], data_type: DataType, options: &CodecOptions) -> Result<EncodedBlock> {
    let num_elements = u32::try_from(values.len())
        .map_err(|_| Error::InvalidArgument(format!("block of {} values is too large", values.len())))?;

    let has_missing = values.iter().any(Value::is_missing);
    let present = values
        .iter()
        .filter(|v| !v.is_missing())
        .map(|v| data_type.coerce(v.clone()))
        .collect::<Result<Vec<_>>>()?;

    let encoded = encoding::encode_values(&present, data_type, options.dictionary_threshold)?;

    let mut raw = Vec::with_capacity(encoded.payload.len() + values.len() / 8 + 1);
    if has_missing {
        raw.extend_from_slice(&validity_bitmap(values));
    }
    raw.extend_from_slice(&encoded.payload);

    let (compression, stored) = match options.compression {
        Compression::None => (Compression::None, raw.clone()),
        _ if raw.len() < options.min_compress_bytes => (Compression::None, raw.clone()),
        codec => {
            let compressed = codec.compress(&raw)?;
            if compressed.len() < raw.len() {
                (codec, compressed)
            } else {
                (Compression::None, raw.clone())
            }
        }
    };

    let too_large = |n: usize| {
        u32::try_from(n).map_err(|_| Error::InvalidArgument(format!("block payload of {} bytes is too large", n)))
    };
    let mut header = BlockHeader {
        data_type,
        encoding: encoded.encoding,
        compression,
        flags: if has_missing { header::FLAG_HAS_MISSING } else { 0 },
        num_elements,
        shape: encoded.shape,
        uncompressed_len: too_large(raw.len())?,
        stored_len: too_large(stored.len())?,
        checksum: 0,
    };
    header.checksum = header.compute_checksum(&stored);

    let mut bytes = Vec::with_capacity(header.block_len());
    header.encode_except_checksum(&mut bytes);
    bytes.put_u32_le(header.checksum);
    bytes.extend_from_slice(&stored);

    Ok(EncodedBlock {
        header,
        bytes: Bytes::from(bytes),
    })
}

/// Decode a block produced by [`encode`], verifying its checksum first
pub fn decode(bytes: &[u8]) -> Result<DecodedBlock> {
    let mut cursor = bytes;
    let header = BlockHeader::decode(&mut cursor)?;
    let stored_len = header.stored_len as usize;
    if cursor.len() != stored_len {
        return Err(Error::corrupt(format!(
            "payload is {} bytes, header says {}",
            cursor.len(),
            stored_len
        )));
    }
    let stored = cursor;

    let actual = header.compute_checksum(stored);
    if actual != header.checksum {
        return Err(Error::corrupt(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            header.checksum, actual
        )));
    }

    let raw = header
        .compression
        .decompress(stored, header.uncompressed_len as usize)?;
    let count = header.num_elements as usize;

    let (validity, payload) = if header.has_missing() {
        let bitmap_len = count.div_ceil(8);
        if raw.len() < bitmap_len {
            return Err(Error::corrupt("truncated validity bitmap"));
        }
        let (bitmap, rest) = raw.split_at(bitmap_len);
        (Some(bitmap), rest)
    } else {
        (None, &raw[..])
    };

    let present_count = match validity {
        Some(bitmap) => (0..count).filter(|&i| bit_set(bitmap, i)).count(),
        None => count,
    };
    let present = encoding::decode_values(
        header.encoding,
        header.data_type,
        &header.shape,
        present_count,
        payload,
    )?;

    if present.len() != present_count {
        return Err(Error::corrupt(format!(
            "decoded {} present values, validity bitmap says {}",
            present.len(),
            present_count
        )));
    }

    let values = match validity {
        None => present,
        Some(bitmap) => {
            let mut present = present.into_iter();
            let mut out = Vec::with_capacity(count);
            for i in 0..count {
                if bit_set(bitmap, i) {
                    out.push(present.next().ok_or_else(|| Error::corrupt("validity bitmap overruns payload"))?);
                } else {
                    out.push(Value::Missing);
                }
            }
            out
        }
    };

    Ok(DecodedBlock {
        data_type: header.data_type,
        encoding: header.encoding,
        values,
    })
}

fn validity_bitmap(values: &[Value]) -> Vec<u8> {
    let mut bitmap = vec![0u8; values.len().div_ceil(8)];
    for (i, v) in values.iter().enumerate() {
        if !v.is_missing() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    bitmap
}

fn bit_set(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}
