//! Common type definitions.

use serde::{Deserialize, Serialize};

/// Value of one position in a tokenized field.
///
/// Signed so that label fields can carry [`IGNORE_INDEX`]. Every field of a
/// batch shares this type, since `labels` blocks alias `input_ids` blocks.
pub type TokenId = i64;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: TokenId = -100;

/// Name of the token id field every batch must carry.
pub const INPUT_IDS: &str = "input_ids";

/// Name of the synthesized supervision-target field.
pub const LABELS: &str = "labels";

/// Name of the attention mask field produced by most tokenizers.
pub const ATTENTION_MASK: &str = "attention_mask";

/// Accelerator allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Memory currently occupied by live tensors, in bytes.
    pub allocated_bytes: u64,
    /// Memory held by the caching allocator, in bytes.
    pub reserved_bytes: u64,
}

impl AllocatorStats {
    /// Reserved memory not backing any live tensor.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.reserved_bytes.saturating_sub(self.allocated_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_bytes() {
        let stats = AllocatorStats {
            allocated_bytes: 1024,
            reserved_bytes: 4096,
        };
        assert_eq!(stats.cached_bytes(), 3072);

        // Backends can report allocated > reserved transiently
        let odd = AllocatorStats {
            allocated_bytes: 10,
            reserved_bytes: 5,
        };
        assert_eq!(odd.cached_bytes(), 0);
    }
}
