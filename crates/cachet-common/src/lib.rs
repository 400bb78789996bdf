//! # cachet-common
//!
//! Shared utilities and types for the Cachet ecosystem.
//!
//! This crate provides common functionality used across all Cachet crates:
//! - Fixed-width bit vectors for cache-way masks and CPU affinity sets
//! - Pool policy configuration structs
//! - Common error types

#![warn(missing_docs)]

pub mod bitmap;
pub mod error;
pub mod policy;

pub use bitmap::{AFFINITY_BITS, AFFINITY_WORDS, Bitmap};
pub use error::{CachetError, CachetResult};
pub use policy::{CachePool, CachetConfig, InfraGroup, MbaMode, OsGroup, RdtConfig};
