//! Block header layout
//!
//! ```plain
//! | magic | version | type | encoding | compression | flags | num_elem |
//! |  4B   |   2B    |  1B  |    1B    |     1B      |  1B   |    4B    |
//!
//! | ndim | dims      | uncompressed_len | stored_len | checksum |
//! |  2B  | 4B * ndim |        4B        |     4B     |    4B    |
//! ```
//!
//! All integers are little endian. The CRC32 covers every header byte
//! before the checksum field plus the stored payload.

use bytes::{Buf, BufMut};
use static_assertions::const_assert_eq;

use super::{Compression, Encoding};
use crate::error::{Error, Result};
use crate::value::DataType;

/// "TBLK"
pub const BLOCK_MAGIC: u32 = 0x4B4C_4254;

/// Block format version written by this build
pub const BLOCK_FORMAT_VERSION: u16 = 1;

/// Header size without the shape dimensions
pub const HEADER_FIXED_LEN: usize = 4 + 2 + 1 + 1 + 1 + 1 + 4 + 2 + 4 + 4 + 4;

const_assert_eq!(HEADER_FIXED_LEN, 28);

/// Header flag: a validity bitmap precedes the values
pub const FLAG_HAS_MISSING: u8 = 0b0000_0001;

/// Decoded block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Declared element type of the block
    pub data_type: DataType,
    /// Value encoding strategy
    pub encoding: Encoding,
    /// Payload compression actually applied
    pub compression: Compression,
    /// Flag bits
    pub flags: u8,
    /// Number of elements, including missing ones
    pub num_elements: u32,
    /// Shared element shape for packed n-dimensional blocks
    pub shape: Vec<u32>,
    /// Payload size before compression
    pub uncompressed_len: u32,
    /// Payload size on disk
    pub stored_len: u32,
    /// CRC32 of header prefix plus stored payload
    pub checksum: u32,
}

impl BlockHeader {
    /// Encoded size of this header
    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_LEN + 4 * self.shape.len()
    }

    /// Total block size on disk
    pub fn block_len(&self) -> usize {
        self.encoded_len() + self.stored_len as usize
    }

    /// Whether a validity bitmap is present
    pub fn has_missing(&self) -> bool {
        self.flags & FLAG_HAS_MISSING != 0
    }

    /// Write every field except the checksum
    pub fn encode_except_checksum(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(BLOCK_MAGIC);
        buf.put_u16_le(BLOCK_FORMAT_VERSION);
        buf.put_u8(self.data_type.tag());
        buf.put_u8(self.encoding.tag());
        buf.put_u8(self.compression.tag());
        buf.put_u8(self.flags);
        buf.put_u32_le(self.num_elements);
        buf.put_u16_le(self.shape.len() as u16);
        for &dim in &self.shape {
            buf.put_u32_le(dim);
        }
        buf.put_u32_le(self.uncompressed_len);
        buf.put_u32_le(self.stored_len);
    }

    /// Compute the checksum over the header prefix and payload
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut prefix = Vec::with_capacity(self.encoded_len());
        self.encode_except_checksum(&mut prefix);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Parse a header from the front of `buf`, advancing it
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_FIXED_LEN {
            return Err(Error::corrupt(format!(
                "expected at least {} header bytes, got {}",
                HEADER_FIXED_LEN,
                buf.remaining()
            )));
        }
        let magic = buf.get_u32_le();
        if magic != BLOCK_MAGIC {
            return Err(Error::corrupt(format!("bad magic {:#010x}", magic)));
        }
        let version = buf.get_u16_le();
        if version != BLOCK_FORMAT_VERSION {
            return Err(Error::UnsupportedFormatVersion {
                what: "block",
                found: u32::from(version),
                supported: u32::from(BLOCK_FORMAT_VERSION),
            });
        }
        let type_tag = buf.get_u8();
        let data_type = DataType::from_tag(type_tag)
            .ok_or_else(|| Error::corrupt(format!("unknown type tag {}", type_tag)))?;
        let encoding_tag = buf.get_u8();
        let encoding = Encoding::from_tag(encoding_tag)
            .ok_or_else(|| Error::corrupt(format!("unknown encoding {}", encoding_tag)))?;
        let compression_tag = buf.get_u8();
        let compression = Compression::from_tag(compression_tag)
            .ok_or_else(|| Error::corrupt(format!("unknown compression {}", compression_tag)))?;
        let flags = buf.get_u8();
        let num_elements = buf.get_u32_le();
        let ndim = buf.get_u16_le() as usize;
        if buf.remaining() < ndim * 4 + 12 {
            return Err(Error::corrupt("truncated block header"));
        }
        let shape = (0..ndim).map(|_| buf.get_u32_le()).collect();
        let uncompressed_len = buf.get_u32_le();
        let stored_len = buf.get_u32_le();
        let checksum = buf.get_u32_le();

        Ok(Self {
            data_type,
            encoding,
            compression,
            flags,
            num_elements,
            shape,
            uncompressed_len,
            stored_len,
            checksum,
        })
    }
}
