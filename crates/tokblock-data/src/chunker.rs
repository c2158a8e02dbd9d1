//! Concatenate-and-chunk preprocessing.
//!
//! Language model pretraining and continued pretraining want every training
//! example to be exactly `block_size` tokens long. Rather than padding,
//! [`BlockChunker`] joins all examples of a batch into one stream per field
//! and cuts that stream into consecutive blocks:
//!
//! ```text
//! examples:  [1 2 3][4 5]              block_size = 2
//! stream:    [1 2 3 4 5]
//! blocks:    [1 2][3 4]                5 is dropped
//! ```
//!
//! # Algorithm
//!
//! 1. Flatten every field, preserving example order
//! 2. Check that all fields flatten to the same length (`labels` excepted)
//! 3. Truncate that length down to a multiple of `block_size`
//! 4. Slice every field at the same boundaries
//! 5. Add `labels`, sharing its blocks with `input_ids`
//!
//! A batch holding fewer than `block_size` tokens yields no blocks at all.
//! That is not an error: short batches are dropped, not padded.

use crate::batch::{concatenate, stream_len, Batch, Block, ChunkedBatch};
use std::collections::BTreeMap;
use tokblock_core::{validate_block_size, ChunkerConfig, Result, TokblockError, INPUT_IDS, LABELS};

/// Statistics about one chunking pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Number of examples in `input_ids`.
    pub num_examples: usize,
    /// Tokens per field before truncation.
    pub total_tokens: usize,
    /// Tokens per field that ended up in a block.
    pub kept_tokens: usize,
    /// Tokens per field discarded by truncation.
    pub dropped_tokens: usize,
    /// Blocks per field.
    pub num_blocks: usize,
    /// Block length used.
    pub block_size: usize,
}

impl ChunkStats {
    /// Fraction of tokens kept (1.0 for an empty batch).
    pub fn efficiency(&self) -> f64 {
        if self.total_tokens == 0 {
            return 1.0;
        }
        self.kept_tokens as f64 / self.total_tokens as f64
    }

    /// Pretty print stats.
    pub fn summary(&self) -> String {
        format!(
            "Chunking: {} examples → {} blocks of {}, {} tokens dropped ({:.1}% kept)",
            self.num_examples,
            self.num_blocks,
            self.block_size,
            self.dropped_tokens,
            self.efficiency() * 100.0
        )
    }
}

/// Splits concatenated token streams into fixed-length blocks.
///
/// The chunker is stateless; one instance can serve any number of threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChunker {
    block_size: usize,
}

impl BlockChunker {
    /// Create a chunker producing blocks of `block_size` tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TokblockError::Config`] when `block_size` is zero.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(TokblockError::Config(
                "block_size must be a positive integer, got 0".to_string(),
            ));
        }
        Ok(Self { block_size })
    }

    /// Create a chunker from configuration.
    pub fn from_config(config: &ChunkerConfig) -> Result<Self> {
        Self::new(config.validate()?)
    }

    /// Create a chunker from a signed block size, as found in config files.
    pub fn from_signed(block_size: i64) -> Result<Self> {
        Self::new(validate_block_size(block_size)?)
    }

    /// The block length.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Chunk a batch.
    ///
    /// # Errors
    ///
    /// - [`TokblockError::MissingField`] when `input_ids` is absent
    /// - [`TokblockError::ShapeMismatch`] when fields flatten to different lengths
    pub fn chunk(&self, batch: &Batch) -> Result<ChunkedBatch> {
        self.chunk_with_stats(batch).map(|(chunked, _)| chunked)
    }

    /// Chunk a batch and return stats.
    pub fn chunk_with_stats(&self, batch: &Batch) -> Result<(ChunkedBatch, ChunkStats)> {
        if !batch.contains(INPUT_IDS) {
            return Err(TokblockError::MissingField(INPUT_IDS.to_string()));
        }

        let total_length = self.check_lengths(batch)?;
        let num_blocks = if total_length < self.block_size {
            0
        } else {
            total_length / self.block_size
        };
        let kept = num_blocks * self.block_size;

        if num_blocks == 0 {
            tracing::debug!(
                total_length,
                block_size = self.block_size,
                "Batch shorter than one block, dropping all tokens"
            );
        }

        if batch.contains(LABELS) {
            tracing::debug!("Replacing existing labels field with a copy of input_ids");
        }

        let mut fields = BTreeMap::new();
        for (name, examples) in batch.iter().filter(|(name, _)| *name != LABELS) {
            let stream = concatenate(examples);
            let blocks: Vec<Block> = stream[..kept]
                .chunks_exact(self.block_size)
                .map(Block::from_slice)
                .collect();
            fields.insert(name.to_string(), blocks);
        }

        // Container copy: a new Vec holding handles to the same blocks.
        let labels = fields.get(INPUT_IDS).cloned().unwrap_or_default();
        fields.insert(LABELS.to_string(), labels);

        let stats = ChunkStats {
            num_examples: batch.num_examples(INPUT_IDS).unwrap_or(0),
            total_tokens: total_length,
            kept_tokens: kept,
            dropped_tokens: total_length - kept,
            num_blocks,
            block_size: self.block_size,
        };
        tracing::debug!("{}", stats.summary());

        Ok((ChunkedBatch::from_fields(fields), stats))
    }

    /// Concatenated length shared by every field.
    ///
    /// The first field in iteration order is the reference. An incoming
    /// `labels` field is overwritten, so its length is not checked.
    fn check_lengths(&self, batch: &Batch) -> Result<usize> {
        let mut fields = batch.iter().filter(|(name, _)| *name != LABELS);
        let Some((_, first)) = fields.next() else {
            return Ok(0);
        };
        let expected = stream_len(first);

        for (name, examples) in fields {
            let actual = stream_len(examples);
            if actual != expected {
                return Err(TokblockError::ShapeMismatch {
                    field: name.to_string(),
                    expected,
                    actual,
                });
            }
        }

        Ok(expected)
    }
}

/// Chunk `batch` into blocks of `block_size` tokens.
///
/// Shorthand for `BlockChunker::new(block_size)?.chunk(batch)`.
pub fn chunk(batch: &Batch, block_size: usize) -> Result<ChunkedBatch> {
    BlockChunker::new(block_size)?.chunk(batch)
}
