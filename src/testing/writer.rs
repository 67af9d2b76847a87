//! A minimal Object Container File writer for tests and fixtures.

use crate::io::binary::{encode_bytes, encode_long};
use crate::io::compression::{BlockCodec, codec_for};
use crate::io::container::{CODEC_KEY, MAGIC, SCHEMA_KEY, SYNC_SIZE};
use anyhow::{Context, Result, anyhow};
use apache_avro::types::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Records per block when [`AvroFileWriter::block_records`] is not called.
pub const DEFAULT_BLOCK_RECORDS: usize = 100;

/// Writes records into one container file, cutting a block every
/// `block_records` appends.
///
/// # Example
///
/// ```no_run
/// use apache_avro::types::Value;
/// use ironfeed::testing::AvroFileWriter;
///
/// # fn main() -> anyhow::Result<()> {
/// let schema = r#"{"type":"record","name":"R","fields":[{"name":"v","type":"long"}]}"#;
/// let mut writer = AvroFileWriter::create("out.avro", schema, "deflate")?.block_records(10);
/// for i in 0..25 {
///     writer.append(Value::Record(vec![("v".into(), Value::Long(i))]))?;
/// }
/// let written = writer.finish()?;
/// assert_eq!(written.block_offsets.len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct AvroFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    schema: apache_avro::Schema,
    codec: Arc<dyn BlockCodec>,
    sync: [u8; SYNC_SIZE],
    block_records: usize,
    pending: Vec<u8>,
    pending_count: usize,
    written: u64,
    records: u64,
    block_offsets: Vec<u64>,
}

/// Layout of a finished file, for tests that damage specific blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub records: u64,
    /// Byte offset of each block's record-count field.
    pub block_offsets: Vec<u64>,
    /// Byte offset of the first block (the end of the header).
    pub header_len: u64,
    pub sync: [u8; SYNC_SIZE],
}

impl AvroFileWriter {
    /// Create `path` and write the header for `schema_json` and `codec`.
    /// The header records `codec` exactly as given, so aliases are preserved.
    ///
    /// # Errors
    /// Fails if the schema does not parse, the codec is not registered, or the
    /// file cannot be written.
    pub fn create(path: impl AsRef<Path>, schema_json: &str, codec: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let schema = apache_avro::Schema::parse_str(schema_json)
            .with_context(|| format!("parsing writer schema for {}", path.display()))?;
        let codec_name = codec;
        let codec = codec_for(codec_name).ok_or_else(|| anyhow!("codec `{codec_name}` is not registered"))?;
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let sync: [u8; SYNC_SIZE] = rand::random();

        let mut header = MAGIC.to_vec();
        encode_long(&mut header, 2);
        encode_bytes(&mut header, SCHEMA_KEY.as_bytes());
        encode_bytes(&mut header, schema_json.as_bytes());
        encode_bytes(&mut header, CODEC_KEY.as_bytes());
        encode_bytes(&mut header, codec_name.as_bytes());
        encode_long(&mut header, 0);
        header.extend_from_slice(&sync);

        let mut out = BufWriter::new(file);
        out.write_all(&header)?;
        Ok(Self {
            path,
            out,
            schema,
            codec,
            sync,
            block_records: DEFAULT_BLOCK_RECORDS,
            pending: Vec::new(),
            pending_count: 0,
            written: header.len() as u64,
            records: 0,
            block_offsets: Vec::new(),
        })
    }

    #[must_use]
    pub fn block_records(mut self, n: usize) -> Self {
        self.block_records = n.max(1);
        self
    }

    /// Encode `value` against the writer schema and append it.
    ///
    /// # Errors
    /// Fails if `value` does not match the schema or the block cannot be written.
    pub fn append(&mut self, value: Value) -> Result<()> {
        let datum = apache_avro::to_avro_datum(&self.schema, value).context("encoding record")?;
        self.append_raw(&datum)
    }

    /// Append pre-encoded datum bytes verbatim.
    ///
    /// # Errors
    /// Fails if a full block cannot be written.
    pub fn append_raw(&mut self, datum: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(datum);
        self.pending_count += 1;
        self.records += 1;
        if self.pending_count >= self.block_records {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Write the pending records as one block. No-op when nothing is pending.
    ///
    /// # Errors
    /// Fails on compression or write errors.
    pub fn flush_block(&mut self) -> Result<()> {
        if self.pending_count == 0 {
            return Ok(());
        }
        let payload = self
            .codec
            .compress(std::mem::take(&mut self.pending))
            .with_context(|| format!("compressing block for {}", self.path.display()))?;
        let mut frame = Vec::with_capacity(payload.len() + 2 * 10 + SYNC_SIZE);
        encode_long(&mut frame, i64::try_from(self.pending_count)?);
        encode_long(&mut frame, i64::try_from(payload.len())?);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&self.sync);

        self.out.write_all(&frame)?;
        self.block_offsets.push(self.written);
        self.written += frame.len() as u64;
        self.pending_count = 0;
        Ok(())
    }

    /// Flush the last block and close the file.
    ///
    /// # Errors
    /// Fails on compression or write errors.
    pub fn finish(mut self) -> Result<WrittenFile> {
        self.flush_block()?;
        self.out.flush()?;
        let header_len = self.block_offsets.first().copied().unwrap_or(self.written);
        Ok(WrittenFile {
            path: self.path,
            records: self.records,
            block_offsets: self.block_offsets,
            header_len,
            sync: self.sync,
        })
    }
}
