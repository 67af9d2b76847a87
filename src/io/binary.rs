//! Avro binary encoding primitives.
//!
//! [`Cursor`] reads zig-zag varints, IEEE floats, and length-prefixed bytes out
//! of a borrowed buffer. [`skip_datum`] walks one value of a schema without
//! materializing it, which is how record boundaries inside a block are found.
//! The walk is lenient: it does not validate UTF-8 or boolean bytes, so those
//! problems surface later as record-level parse errors rather than as corrupt
//! blocks.
//!
//! The boundary walk is pluggable through [`DatumDecoder`].

use crate::schema::Schema;
use std::sync::Arc;
use thiserror::Error;

/// Low-level decoding failure. Callers attach file and record context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("varint overflow at offset {offset}")]
    VarintOverflow { offset: usize },
    #[error("value {value} out of range for int at offset {offset}")]
    IntOverflow { offset: usize, value: i64 },
    #[error("negative length {length} at offset {offset}")]
    NegativeLength { offset: usize, length: i64 },
    #[error("invalid UTF-8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid boolean byte {byte:#04x} at offset {offset}")]
    InvalidBoolean { offset: usize, byte: u8 },
    #[error("union branch {index} out of range ({branches} branches) at offset {offset}")]
    InvalidUnionIndex {
        offset: usize,
        index: i64,
        branches: usize,
    },
    #[error("enum index {index} out of range ({symbols} symbols) at offset {offset}")]
    InvalidEnumIndex {
        offset: usize,
        index: i64,
        symbols: usize,
    },
    #[error("decoder state does not match schema: {0}")]
    Internal(&'static str),
}

/// Read position inside a borrowed byte buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Advance `n` bytes and return them.
    ///
    /// # Errors
    /// [`DecodeError::UnexpectedEof`] if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a zig-zag encoded variable-length `long`.
    ///
    /// # Errors
    /// Fails on truncated input or on more than ten continuation bytes.
    pub fn read_long(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: 1,
            })?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow { offset: start });
            }
        }
        Ok(((value >> 1) as i64) ^ -((value & 1) as i64))
    }

    /// Read an `int`, which shares the `long` encoding but must fit in 32 bits.
    ///
    /// # Errors
    /// Fails on truncated input or an out-of-range value.
    pub fn read_int(&mut self) -> Result<i32, DecodeError> {
        let offset = self.pos;
        let value = self.read_long()?;
        i32::try_from(value).map_err(|_| DecodeError::IntOverflow { offset, value })
    }

    /// Read a length prefix, rejecting negative values.
    ///
    /// # Errors
    /// Fails on truncated input or a negative length.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let length = self.read_long()?;
        usize::try_from(length).map_err(|_| DecodeError::NegativeLength { offset, length })
    }

    /// # Errors
    /// Fails on truncated input or a byte other than 0 or 1.
    pub fn read_boolean(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos;
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(DecodeError::InvalidBoolean { offset, byte }),
        }
    }

    /// # Errors
    /// Fails on truncated input.
    pub fn read_float(&mut self) -> Result<f32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// # Errors
    /// Fails on truncated input.
    pub fn read_double(&mut self) -> Result<f64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(raw))
    }

    /// # Errors
    /// Fails on truncated input or a negative length.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_len()?;
        self.take(len)
    }

    /// # Errors
    /// Fails on truncated input, a negative length, or invalid UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        let offset = self.pos;
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    /// Read the item count of the next array or map block. A negative count is
    /// followed by the block's byte size, which is returned alongside.
    ///
    /// # Errors
    /// Fails on truncated input.
    pub fn read_block_header(&mut self) -> Result<(usize, Option<usize>), DecodeError> {
        let offset = self.pos;
        let count = self.read_long()?;
        if count >= 0 {
            return Ok((count as usize, None));
        }
        let size = self.read_len()?;
        let count = count
            .checked_neg()
            .ok_or(DecodeError::NegativeLength { offset, length: count })?;
        Ok((count as usize, Some(size)))
    }
}

/// Advance `cursor` past one value of `schema`.
///
/// # Errors
/// Fails if the buffer ends early or a length/index is malformed.
pub fn skip_datum(schema: &Schema, cursor: &mut Cursor<'_>) -> Result<(), DecodeError> {
    match schema {
        Schema::Null => Ok(()),
        Schema::Boolean => cursor.take(1).map(drop),
        Schema::Int | Schema::Long => cursor.read_long().map(drop),
        Schema::Float => cursor.take(4).map(drop),
        Schema::Double => cursor.take(8).map(drop),
        Schema::Bytes | Schema::String => cursor.read_bytes().map(drop),
        Schema::Fixed { size, .. } => cursor.take(*size).map(drop),
        Schema::Enum { symbols, .. } => {
            let offset = cursor.position();
            let index = cursor.read_long()?;
            if index < 0 || index as usize >= symbols.len() {
                return Err(DecodeError::InvalidEnumIndex {
                    offset,
                    index,
                    symbols: symbols.len(),
                });
            }
            Ok(())
        }
        Schema::Array(items) => skip_blocks(cursor, |c| skip_datum(items, c)),
        Schema::Map(values) => skip_blocks(cursor, |c| {
            c.read_bytes()?;
            skip_datum(values, c)
        }),
        Schema::Union(branches) => {
            let branch = read_union_index(cursor, branches.len())?;
            skip_datum(&branches[branch], cursor)
        }
        Schema::Record(record) => {
            for field in &record.fields {
                skip_datum(&field.schema, cursor)?;
            }
            Ok(())
        }
    }
}

fn skip_blocks<'a>(
    cursor: &mut Cursor<'a>,
    mut skip_item: impl FnMut(&mut Cursor<'a>) -> Result<(), DecodeError>,
) -> Result<(), DecodeError> {
    loop {
        match cursor.read_block_header()? {
            (0, _) => return Ok(()),
            (_, Some(size)) => {
                cursor.take(size)?;
            }
            (count, None) => {
                for _ in 0..count {
                    skip_item(cursor)?;
                }
            }
        }
    }
}

/// Read a union branch index and check it against the branch count.
///
/// # Errors
/// Fails on truncated input or an out-of-range index.
pub fn read_union_index(cursor: &mut Cursor<'_>, branches: usize) -> Result<usize, DecodeError> {
    let offset = cursor.position();
    let index = cursor.read_long()?;
    if index < 0 || index as usize >= branches {
        return Err(DecodeError::InvalidUnionIndex {
            offset,
            index,
            branches,
        });
    }
    Ok(index as usize)
}

/// Finds record boundaries inside a decompressed block.
///
/// The block reader calls [`skip_datum`](DatumDecoder::skip_datum) once per
/// record; the default implementation walks the writer schema.
pub trait DatumDecoder: Send + Sync {
    /// Return the offset just past the datum that starts at `offset`.
    ///
    /// # Errors
    /// Fails when the bytes at `offset` are not a complete datum.
    fn skip_datum(&self, buf: &[u8], offset: usize) -> Result<usize, DecodeError>;
}

/// [`DatumDecoder`] driven by a schema tree.
#[derive(Debug, Clone)]
pub struct SchemaDecoder {
    schema: Arc<Schema>,
}

impl SchemaDecoder {
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }
}

impl DatumDecoder for SchemaDecoder {
    fn skip_datum(&self, buf: &[u8], offset: usize) -> Result<usize, DecodeError> {
        let mut cursor = Cursor::at(buf, offset);
        skip_datum(&self.schema, &mut cursor)?;
        Ok(cursor.position())
    }
}

// ============================================================================
// Encoding helpers (container headers and test data)
// ============================================================================

/// Append a zig-zag varint.
pub fn encode_long(out: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n & !0x7f != 0 {
        out.push(((n & 0x7f) | 0x80) as u8);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Append a length-prefixed byte string.
pub fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_long(out, bytes.len() as i64);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_long(&mut out, value);
        out
    }

    #[test]
    fn zigzag_matches_reference_encoding() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(-1), [0x01]);
        assert_eq!(encoded(1), [0x02]);
        assert_eq!(encoded(-64), [0x7f]);
        assert_eq!(encoded(64), [0x80, 0x01]);
        for v in [i64::MIN, i64::MAX, -300, 300, 123_456_789] {
            let bytes = encoded(v);
            assert_eq!(Cursor::new(&bytes).read_long().unwrap(), v);
        }
    }

    #[test]
    fn truncated_and_overlong_varints_fail() {
        let mut c = Cursor::new(&[0x80, 0x80]);
        assert!(matches!(
            c.read_long(),
            Err(DecodeError::UnexpectedEof { .. })
        ));
        let overlong = [0xff; 11];
        assert!(matches!(
            Cursor::new(&overlong).read_long(),
            Err(DecodeError::VarintOverflow { .. })
        ));
        let big = encoded(i64::from(i32::MAX) + 1);
        assert!(matches!(
            Cursor::new(&big).read_int(),
            Err(DecodeError::IntOverflow { .. })
        ));
    }

    #[test]
    fn strings_are_validated_but_skipping_is_lenient() {
        let mut bytes = Vec::new();
        encode_bytes(&mut bytes, &[0xff, 0xfe]);
        assert!(matches!(
            Cursor::new(&bytes).read_str(),
            Err(DecodeError::InvalidUtf8 { offset: 0 })
        ));
        let mut c = Cursor::new(&bytes);
        skip_datum(&Schema::String, &mut c).unwrap();
        assert!(c.is_at_end());
    }

    #[test]
    fn skips_blocked_arrays_using_byte_size() {
        // Two-item block written with a negative count and a byte size.
        let mut bytes = Vec::new();
        encode_long(&mut bytes, -2);
        encode_long(&mut bytes, 2);
        encode_long(&mut bytes, 5);
        encode_long(&mut bytes, 7);
        encode_long(&mut bytes, 0);
        let schema = Schema::Array(Box::new(Schema::Long));
        let decoder = SchemaDecoder::new(Arc::new(schema));
        assert_eq!(decoder.skip_datum(&bytes, 0).unwrap(), bytes.len());
    }

    #[test]
    fn union_index_out_of_range() {
        let bytes = encoded(3);
        let schema = Schema::Union(vec![Schema::Null, Schema::Int]);
        let err = skip_datum(&schema, &mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUnionIndex { index: 3, .. }));
    }
}
