//! # Cutline Storage
//!
//! Reference-counted bookkeeping for state shared between incremental
//! checkpoints.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Shared state registry for incremental checkpoints
pub mod incremental;

pub use incremental::{
    SharedStateError, SharedStateRegistry, SharedStateRegistryKey, StreamStateHandle,
};
