//! Avro object container file reader.
//!
//! A container file is a header (magic, metadata map, sync marker) followed by
//! data blocks. Each block is `record count`, `payload size`, the compressed
//! payload, and a repeat of the sync marker. [`BlockReader`] validates that
//! framing, decompresses payloads through the codec registry, and splits every
//! block into per-record byte ranges.

use crate::error::{Error, Result};
use crate::io::binary::{Cursor, DatumDecoder, SchemaDecoder};
use crate::io::compression::{BlockCodec, codec_for};
use crate::schema::Schema;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// `Obj` followed by format version 1.
pub const MAGIC: [u8; 4] = [b'O', b'b', b'j', 1];
pub const SYNC_SIZE: usize = 16;
pub const SCHEMA_KEY: &str = "avro.schema";
pub const CODEC_KEY: &str = "avro.codec";

/// Upper bound on payload bytes reserved ahead of reading.
const MAX_PREALLOC: usize = 64 << 20;

/// Default cap on a block's payload, both as stored and once decompressed.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 256 << 20;

/// One decompressed block with its record boundaries.
#[derive(Debug, Clone)]
pub struct Block {
    index: u64,
    data: Vec<u8>,
    spans: Vec<(usize, usize)>,
}

impl Block {
    /// Zero-based position of the block in its file.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Encoded bytes of record `i`.
    #[must_use]
    pub fn record(&self, i: usize) -> Option<&[u8]> {
        self.spans
            .get(i)
            .map(|&(offset, len)| &self.data[offset..offset + len])
    }

    /// Byte offset of record `i` inside the decompressed payload.
    #[must_use]
    pub fn record_offset(&self, i: usize) -> Option<usize> {
        self.spans.get(i).map(|&(offset, _)| offset)
    }
}

/// Sequential reader over the blocks of one container file.
pub struct BlockReader<R: Read = BufReader<File>> {
    path: Arc<Path>,
    reader: R,
    metadata: BTreeMap<String, Vec<u8>>,
    writer_schema: Arc<Schema>,
    codec: Arc<dyn BlockCodec>,
    sync: [u8; SYNC_SIZE],
    decoder: Arc<dyn DatumDecoder>,
    max_block_size: usize,
    next_index: u64,
    done: bool,
}

impl BlockReader<BufReader<File>> {
    /// Open `path` with a read buffer of `buffer_size` bytes and parse its header.
    ///
    /// # Errors
    /// `Io` if the file cannot be opened; otherwise see [`BlockReader::new`].
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let reader = BufReader::with_capacity(buffer_size.max(1), file);
        Self::new(Arc::from(path), reader)
    }
}

impl<R: Read> BlockReader<R> {
    /// Parse the container header from `reader`.
    ///
    /// # Errors
    /// - `CorruptBlock` for a wrong magic, a malformed metadata map, a missing
    ///   or invalid writer schema, or a truncated sync marker
    /// - `UnsupportedCodec` if `avro.codec` names no registered codec
    pub fn new(path: Arc<Path>, mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic, &path, "file header")?;
        if magic != MAGIC {
            return Err(Error::corrupt(
                &*path,
                format!("invalid magic {magic:02x?}, not an Avro container file"),
            ));
        }

        let metadata = read_metadata(&mut reader, &path)?;

        let schema_json = metadata
            .get(SCHEMA_KEY)
            .ok_or_else(|| Error::corrupt(&*path, "header has no avro.schema entry"))?;
        let schema_json = std::str::from_utf8(schema_json)
            .map_err(|_| Error::corrupt(&*path, "avro.schema is not valid UTF-8"))?;
        let writer_schema = Schema::parse_str(schema_json)
            .map(Arc::new)
            .map_err(|e| Error::corrupt(&*path, format!("bad writer schema: {e}")))?;

        let codec_name = match metadata.get(CODEC_KEY) {
            Some(raw) => String::from_utf8_lossy(raw).into_owned(),
            None => "null".to_string(),
        };
        let codec =
            codec_for(&codec_name).ok_or_else(|| Error::unsupported_codec(&*path, &codec_name))?;

        let mut sync = [0u8; SYNC_SIZE];
        read_exact(&mut reader, &mut sync, &path, "sync marker")?;

        debug!(path = %path.display(), codec = %codec_name, "opened container file");

        Ok(Self {
            decoder: Arc::new(SchemaDecoder::new(Arc::clone(&writer_schema))),
            path,
            reader,
            metadata,
            writer_schema,
            codec,
            sync,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            next_index: 0,
            done: false,
        })
    }

    /// Reject blocks whose stored or decompressed payload exceeds `limit` bytes.
    #[must_use]
    pub fn with_max_block_size(mut self, limit: usize) -> Self {
        self.max_block_size = limit;
        self
    }

    /// Replace the decoder used to find record boundaries.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn DatumDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// Raw header metadata, including `avro.schema` and `avro.codec`.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.metadata
    }

    #[must_use]
    pub fn writer_schema(&self) -> &Arc<Schema> {
        &self.writer_schema
    }

    /// The writer schema exactly as stored in the header.
    #[must_use]
    pub fn writer_schema_json(&self) -> Option<&str> {
        self.metadata
            .get(SCHEMA_KEY)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }

    #[must_use]
    pub fn codec_name(&self) -> &str {
        self.codec.name()
    }

    #[must_use]
    pub fn sync_marker(&self) -> &[u8; SYNC_SIZE] {
        &self.sync
    }

    /// Read, verify, decompress, and frame the next block.
    ///
    /// Returns `Ok(None)` at a clean end of file.
    ///
    /// # Errors
    /// `CorruptBlock` for truncation, a sync mismatch, an undecodable payload,
    /// a payload over the block size limit, or records that do not exactly
    /// fill the payload; `Io` for read failures.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        let index = self.next_index;
        let Some(count) = self.read_header_long(true)? else {
            self.done = true;
            return Ok(None);
        };
        let size = self.read_header_long(false)?.unwrap_or_default();
        let (Ok(count), Ok(size)) = (usize::try_from(count), usize::try_from(size)) else {
            return Err(self.fail(format!(
                "block {index} has negative count {count} or size {size}"
            )));
        };

        if size > self.max_block_size {
            return Err(self.fail(format!(
                "block {index} stores {size} bytes, over the {}-byte limit",
                self.max_block_size
            )));
        }

        let mut payload = Vec::with_capacity(size.min(MAX_PREALLOC));
        let got = (&mut self.reader)
            .take(size as u64)
            .read_to_end(&mut payload)
            .map_err(|e| Error::io(&*self.path, e))?;
        if got != size {
            return Err(self.fail(format!(
                "block {index} truncated: expected {size} payload bytes, found {got}"
            )));
        }

        let mut sync = [0u8; SYNC_SIZE];
        if let Err(e) = read_exact(&mut self.reader, &mut sync, &self.path, "block sync marker") {
            self.done = true;
            return Err(e);
        }
        if sync != self.sync {
            return Err(self.fail(format!("sync marker mismatch after block {index}")));
        }

        let data = match self.codec.decompress(payload, self.max_block_size) {
            Ok(data) => data,
            Err(e) => {
                let message = format!("block {index} failed to decompress with {}: {e}", self.codec.name());
                return Err(self.fail(message));
            }
        };

        let spans = match frame_records(self.decoder.as_ref(), &data, count) {
            Ok(spans) => spans,
            Err(message) => return Err(self.fail(format!("block {index}: {message}"))),
        };

        trace!(path = %self.path.display(), block = index, records = count, "read block");
        self.next_index += 1;
        Ok(Some(Block { index, data, spans }))
    }

    fn fail(&mut self, message: String) -> Error {
        self.done = true;
        Error::corrupt(&*self.path, message)
    }

    /// Read a varint from the stream. At a block boundary (`allow_eof`) a clean
    /// end of file yields `None`.
    fn read_header_long(&mut self, allow_eof: bool) -> Result<Option<i64>> {
        let mut value: u64 = 0;
        let mut shift = 0;
        let mut first = true;
        loop {
            let mut byte = [0u8; 1];
            match self.reader.read(&mut byte) {
                Ok(0) if first && allow_eof => return Ok(None),
                Ok(0) => return Err(self.fail("unexpected end of file in block header".into())),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(&*self.path, e)),
            }
            first = false;
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(Some(((value >> 1) as i64) ^ -((value & 1) as i64)));
            }
            shift += 7;
            if shift > 63 {
                return Err(self.fail("varint overflow in block header".into()));
            }
        }
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

/// Split a decompressed payload into `count` records.
fn frame_records(
    decoder: &dyn DatumDecoder,
    data: &[u8],
    count: usize,
) -> std::result::Result<Vec<(usize, usize)>, String> {
    let mut spans = Vec::with_capacity(count.min(data.len()));
    let mut offset = 0;
    for i in 0..count {
        let end = decoder
            .skip_datum(data, offset)
            .map_err(|e| format!("record {i} of {count} does not decode: {e}"))?;
        spans.push((offset, end - offset));
        offset = end;
    }
    if offset != data.len() {
        return Err(format!(
            "{count} records end at byte {offset} but payload has {} bytes",
            data.len()
        ));
    }
    Ok(spans)
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8], path: &Path, what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::corrupt(path, format!("truncated {what}"))
        } else {
            Error::io(path, e)
        }
    })
}

/// Parse the header metadata map (`map<bytes>`).
fn read_metadata(reader: &mut impl Read, path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    // The map is small; read it through a byte-at-a-time cursor over the stream.
    let mut metadata = BTreeMap::new();
    loop {
        let count = read_stream_long(reader, path)?;
        if count == 0 {
            return Ok(metadata);
        }
        if count < 0 {
            // Negative counts are followed by the block size in bytes.
            read_stream_long(reader, path)?;
        }
        for _ in 0..count.unsigned_abs() {
            let key = read_stream_bytes(reader, path)?;
            let value = read_stream_bytes(reader, path)?;
            let key = String::from_utf8(key)
                .map_err(|_| Error::corrupt(path, "metadata key is not valid UTF-8"))?;
            metadata.insert(key, value);
        }
    }
}

fn read_stream_long(reader: &mut impl Read, path: &Path) -> Result<i64> {
    let mut raw = Vec::with_capacity(10);
    loop {
        let mut byte = [0u8; 1];
        read_exact(reader, &mut byte, path, "file header")?;
        raw.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if raw.len() >= 10 {
            return Err(Error::corrupt(path, "varint overflow in file header"));
        }
    }
    Cursor::new(&raw)
        .read_long()
        .map_err(|e| Error::corrupt(path, e.to_string()))
}

fn read_stream_bytes(reader: &mut impl Read, path: &Path) -> Result<Vec<u8>> {
    let len = read_stream_long(reader, path)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::corrupt(path, format!("negative length {len} in file header")))?;
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC));
    let got = reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| Error::io(path, e))?;
    if got != len {
        return Err(Error::corrupt(path, "truncated file header"));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind as Kind;
    use crate::io::binary::{encode_bytes, encode_long};

    const SCHEMA: &str = r#"{"type":"record","name":"r","fields":[{"name":"x","type":"long"}]}"#;
    const SYNC: [u8; SYNC_SIZE] = *b"0123456789abcdef";

    fn header(codec: Option<&str>) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        let entries = if codec.is_some() { 2 } else { 1 };
        encode_long(&mut out, entries);
        encode_bytes(&mut out, SCHEMA_KEY.as_bytes());
        encode_bytes(&mut out, SCHEMA.as_bytes());
        if let Some(codec) = codec {
            encode_bytes(&mut out, CODEC_KEY.as_bytes());
            encode_bytes(&mut out, codec.as_bytes());
        }
        encode_long(&mut out, 0);
        out.extend_from_slice(&SYNC);
        out
    }

    fn block(out: &mut Vec<u8>, values: &[i64]) {
        let mut payload = Vec::new();
        for v in values {
            encode_long(&mut payload, *v);
        }
        encode_long(out, values.len() as i64);
        encode_long(out, payload.len() as i64);
        out.extend_from_slice(&payload);
        out.extend_from_slice(&SYNC);
    }

    fn reader(bytes: Vec<u8>) -> Result<BlockReader<std::io::Cursor<Vec<u8>>>> {
        BlockReader::new(Arc::from(Path::new("mem.avro")), std::io::Cursor::new(bytes))
    }

    #[test]
    fn frames_records_across_blocks() {
        let mut bytes = header(None);
        block(&mut bytes, &[1, -2, 300]);
        block(&mut bytes, &[4]);
        let mut r = reader(bytes).unwrap();
        assert_eq!(r.codec_name(), "null");
        assert_eq!(r.writer_schema_json(), Some(SCHEMA));
        let first = r.next_block().unwrap().unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(first.len(), 3);
        assert_eq!(first.record(2).unwrap(), &[0xd8, 0x04]);
        assert_eq!(first.record_offset(1), Some(1));
        let second = r.next_block().unwrap().unwrap();
        assert_eq!(second.index(), 1);
        assert!(r.next_block().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = b"garbage!".to_vec();
        bytes.extend(header(None));
        let err = reader(bytes).err().unwrap();
        assert_eq!(err.kind(), Kind::CorruptBlock);
        assert_eq!(err.path(), Some(Path::new("mem.avro")));
    }

    #[test]
    fn rejects_unknown_codec() {
        let err = reader(header(Some("lzma-unknown"))).err().unwrap();
        assert_eq!(err.kind(), Kind::UnsupportedCodec);
    }

    #[test]
    fn detects_sync_mismatch_and_stops() {
        let mut bytes = header(None);
        block(&mut bytes, &[1]);
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let mut r = reader(bytes).unwrap();
        let err = r.next_block().unwrap_err();
        assert_eq!(err.kind(), Kind::CorruptBlock);
        assert!(err.to_string().contains("sync"));
        assert!(r.next().is_none());
    }

    #[test]
    fn detects_record_count_that_overruns_payload() {
        let mut bytes = header(None);
        let mut payload = Vec::new();
        encode_long(&mut payload, 7);
        encode_long(&mut bytes, 2);
        encode_long(&mut bytes, payload.len() as i64);
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&SYNC);
        let err = reader(bytes).unwrap().next_block().unwrap_err();
        assert_eq!(err.kind(), Kind::CorruptBlock);
    }

    #[test]
    fn rejects_blocks_over_the_size_limit() {
        let mut bytes = header(None);
        block(&mut bytes, &[1, 2, 3]);
        let mut r = reader(bytes.clone()).unwrap().with_max_block_size(2);
        let err = r.next_block().unwrap_err();
        assert_eq!(err.kind(), Kind::CorruptBlock);
        assert!(err.to_string().contains("limit"), "{err}");
        assert!(r.next().is_none());

        let mut r = reader(bytes).unwrap().with_max_block_size(3);
        assert_eq!(r.next_block().unwrap().unwrap().len(), 3);
    }

    #[test]
    fn detects_truncated_payload() {
        let mut bytes = header(None);
        block(&mut bytes, &[1, 2, 3]);
        bytes.truncate(bytes.len() - SYNC_SIZE - 1);
        let err = reader(bytes).unwrap().next_block().unwrap_err();
        assert_eq!(err.kind(), Kind::CorruptBlock);
    }
}
