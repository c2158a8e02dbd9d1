//! Core types, errors, and configuration for tokblock.
//!
//! This crate provides the foundational pieces shared by the tokblock
//! crates:
//!
//! - Error handling infrastructure
//! - Configuration types for block chunking and memory reclamation
//! - Common type definitions (token ids, field names, allocator stats)

#![warn(missing_docs)]

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Result, TokblockError};
    pub use crate::types::*;
}
