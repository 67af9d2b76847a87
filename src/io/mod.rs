//! Reading Avro Object Container Files: file discovery, block framing,
//! decompression, binary primitives and cross-file interleaving.

pub mod binary;
pub mod compression;
pub mod container;
pub mod glob;
pub mod interleave;

pub use compression::{BlockCodec, codec_for, register_codec, registered_codecs};
pub use container::{Block, BlockReader};
pub use glob::{FileShardIterator, ShardPolicy, WorkerShard, expand_glob, expand_patterns};
pub use interleave::{InterleavePolicy, RawRecord, RecordStream};
