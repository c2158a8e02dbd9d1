//! Device memory reclamation for tokblock pipelines.
//!
//! Training pipelines often load several models in turn (a reference model for
//! distillation, a reward model, the student). Between loads the previous
//! model's device memory has to be handed back to the accelerator allocator.
//! This crate provides:
//!
//! - [`AllocatorBackend`]: the seam to a concrete accelerator allocator
//! - [`DeviceAllocator`]: the process-wide allocator handle
//! - [`PipelineHandle`]: optional component slots (model, tokenizer, ...)
//! - [`release`]: best-effort offload, clear every slot, request cache release
//! - [`ReclaimGuard`]: request a release when a scope ends
//!
//! Nothing here locks. Calls that touch the allocator must be serialized
//! against model execution by the caller.

#![warn(missing_docs)]

pub mod allocator;
pub mod reclaim;

pub use allocator::*;
pub use reclaim::*;
