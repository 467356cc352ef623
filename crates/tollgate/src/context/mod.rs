//! Working-memory management: usage metering, compression level selection
//! and checkpoints.
//!
//! 1. **[`usage`]**: [`UsageMeter`] estimates a usage ratio from text.
//! 2. **[`compression`]**: [`CompressionManager`] picks the compression level
//!    once per threshold crossing (0.50 / 0.70 / 0.80 / 0.85 / 0.90 / 0.95).
//! 3. **[`checkpoint`]**: [`Checkpoint`] records written before every
//!    compression, and the [`Compressor`] capability that performs it.

pub mod checkpoint;
pub mod compression;
pub mod usage;

pub use checkpoint::{Checkpoint, Compressor};
pub use compression::{CompressionAction, CompressionLevel, CompressionManager, CompressionState};
pub use usage::{UsageEstimate, UsageMeter};
