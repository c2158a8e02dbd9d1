//! Block chunking for fixed-window language model training.
//!
//! This crate provides:
//! - [`Batch`]: tokenized examples keyed by field name
//! - [`BlockChunker`]: concatenates every field and re-slices it into
//!   uniform-length blocks
//! - [`ChunkedBatch`]: the resulting blocks plus a `labels` field that
//!   shares its blocks with `input_ids`
//! - [`ChunkStats`]: how many tokens a chunking pass kept and dropped

#![warn(missing_docs)]

pub mod batch;
pub mod chunker;

pub use batch::*;
pub use chunker::*;
