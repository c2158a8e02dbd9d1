//! Batch containers.
//!
//! A [`Batch`] is what the tokenizer hands us: per field, one token sequence
//! per example. A [`ChunkedBatch`] is what the chunker returns: per field, a
//! sequence of fixed-length [`Block`]s.
//!
//! Blocks are shared handles. Cloning a `Block` (or a `Vec<Block>`) copies the
//! handle, not the tokens, so the `labels` field of a chunked batch refers to
//! the very same blocks as `input_ids`:
//!
//! ```text
//! input_ids: [ Block#0 ][ Block#1 ]
//!                 │          │
//! labels:    [ Block#0 ][ Block#1 ]   <- distinct Vec, same blocks
//! ```
//!
//! Replacing an element of one field's `Vec` leaves the other untouched, while
//! [`Block::set`] and [`Block::update`] are observed through every handle. Use
//! [`Block::deep_copy`] to detach a block.

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokblock_core::{TokenId, INPUT_IDS, LABELS};

/// Tokenized examples keyed by field name.
///
/// Fields iterate in lexicographic order of their names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    fields: BTreeMap<String, Vec<Vec<TokenId>>>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, examples: Vec<Vec<TokenId>>) -> Self {
        self.insert(name, examples);
        self
    }

    /// Insert a field, returning the examples it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        examples: Vec<Vec<TokenId>>,
    ) -> Option<Vec<Vec<TokenId>>> {
        self.fields.insert(name.into(), examples)
    }

    /// Get the examples of a field.
    pub fn get(&self, name: &str) -> Option<&[Vec<TokenId>]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Whether the batch has a field with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Field names in iteration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Iterate over `(name, examples)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<TokenId>])> {
        self.fields
            .iter()
            .map(|(name, examples)| (name.as_str(), examples.as_slice()))
    }

    /// Number of fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Whether the batch has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of examples in a field.
    pub fn num_examples(&self, name: &str) -> Option<usize> {
        self.fields.get(name).map(Vec::len)
    }

    /// Total number of tokens in a field across all examples.
    pub fn concatenated_len(&self, name: &str) -> Option<usize> {
        self.fields.get(name).map(|examples| stream_len(examples))
    }

    /// Flatten a field into one stream, preserving example order.
    pub fn concatenated(&self, name: &str) -> Option<Vec<TokenId>> {
        self.fields.get(name).map(|examples| concatenate(examples))
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<Vec<TokenId>>)> for Batch {
    fn from_iter<I: IntoIterator<Item = (K, Vec<Vec<TokenId>>)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, examples)| (name.into(), examples))
                .collect(),
        }
    }
}

pub(crate) fn stream_len(examples: &[Vec<TokenId>]) -> usize {
    examples.iter().map(Vec::len).sum()
}

pub(crate) fn concatenate(examples: &[Vec<TokenId>]) -> Vec<TokenId> {
    let mut stream = Vec::with_capacity(stream_len(examples));
    for example in examples {
        stream.extend_from_slice(example);
    }
    stream
}

/// A fixed-length slice of a concatenated token stream.
///
/// `Block` is a reference-counted handle: `clone` shares the underlying
/// tokens.
#[derive(Clone)]
pub struct Block {
    tokens: Arc<RwLock<Vec<TokenId>>>,
}

impl Block {
    /// Create a block owning `tokens`.
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(tokens)),
        }
    }

    /// Create a block from a slice of a stream.
    pub fn from_slice(tokens: &[TokenId]) -> Self {
        Self::new(tokens.to_vec())
    }

    /// Number of tokens in the block.
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the block holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }

    /// Token at `index`.
    pub fn get(&self, index: usize) -> Option<TokenId> {
        self.tokens.read().get(index).copied()
    }

    /// Overwrite the token at `index` in place, returning the previous value.
    ///
    /// Visible through every handle to this block. Returns `None` and leaves
    /// the block untouched when `index` is out of range.
    pub fn set(&self, index: usize, token: TokenId) -> Option<TokenId> {
        let mut tokens = self.tokens.write();
        let slot = tokens.get_mut(index)?;
        Some(std::mem::replace(slot, token))
    }

    /// Mutate the tokens in place.
    ///
    /// The block length is fixed; only the values can change.
    pub fn update<R>(&self, f: impl FnOnce(&mut [TokenId]) -> R) -> R {
        let mut tokens = self.tokens.write();
        f(tokens.as_mut_slice())
    }

    /// Run `f` with read access to the tokens.
    pub fn with_tokens<R>(&self, f: impl FnOnce(&[TokenId]) -> R) -> R {
        let tokens = self.tokens.read();
        f(tokens.as_slice())
    }

    /// Snapshot of the tokens.
    pub fn to_vec(&self) -> Vec<TokenId> {
        self.tokens.read().clone()
    }

    /// A new block with the same content and its own storage.
    pub fn deep_copy(&self) -> Self {
        Self::new(self.to_vec())
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tokens, &other.tokens)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Block").field(&*self.tokens.read()).finish()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        // Same storage must not take the lock twice.
        self.ptr_eq(other) || *self.tokens.read() == *other.tokens.read()
    }
}

impl Eq for Block {}

impl PartialEq<[TokenId]> for Block {
    fn eq(&self, other: &[TokenId]) -> bool {
        self.tokens.read().as_slice() == other
    }
}

impl PartialEq<Vec<TokenId>> for Block {
    fn eq(&self, other: &Vec<TokenId>) -> bool {
        PartialEq::<[TokenId]>::eq(self, other.as_slice())
    }
}

impl From<Vec<TokenId>> for Block {
    fn from(tokens: Vec<TokenId>) -> Self {
        Self::new(tokens)
    }
}

impl Serialize for Block {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.tokens.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<TokenId>::deserialize(deserializer).map(Self::new)
    }
}

/// Fixed-length blocks keyed by field name, including `labels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkedBatch {
    fields: BTreeMap<String, Vec<Block>>,
}

impl ChunkedBatch {
    pub(crate) fn from_fields(fields: BTreeMap<String, Vec<Block>>) -> Self {
        Self { fields }
    }

    /// Blocks of a field.
    pub fn get(&self, name: &str) -> Option<&[Block]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Mutable access to a field's block sequence.
    ///
    /// Replacing or removing elements here only affects this field; the
    /// blocks themselves may still be shared with other fields.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<Block>> {
        self.fields.get_mut(name)
    }

    /// Blocks of `input_ids`.
    pub fn input_ids(&self) -> &[Block] {
        self.get(INPUT_IDS).unwrap_or(&[])
    }

    /// Blocks of `labels`.
    pub fn labels(&self) -> &[Block] {
        self.get(LABELS).unwrap_or(&[])
    }

    /// Field names in iteration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Iterate over `(name, blocks)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Block])> {
        self.fields
            .iter()
            .map(|(name, blocks)| (name.as_str(), blocks.as_slice()))
    }

    /// Number of fields, `labels` included.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Number of blocks per field.
    pub fn num_blocks(&self) -> usize {
        self.input_ids().len()
    }

    /// Whether no blocks were produced.
    pub fn is_empty(&self) -> bool {
        self.num_blocks() == 0
    }

    /// Snapshot every field as plain nested vectors.
    pub fn to_vecs(&self) -> BTreeMap<String, Vec<Vec<TokenId>>> {
        self.fields
            .iter()
            .map(|(name, blocks)| (name.clone(), blocks.iter().map(Block::to_vec).collect()))
            .collect()
    }

    /// Consume the batch, returning its fields.
    pub fn into_fields(self) -> BTreeMap<String, Vec<Block>> {
        self.fields
    }
}
