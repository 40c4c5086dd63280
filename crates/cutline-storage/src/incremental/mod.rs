//! Incremental checkpoints reuse state files across snapshots. A file
//! uploaded for checkpoint 5 may still be referenced by checkpoints 6, 7
//! and 8; it may only be deleted once the last of them is subsumed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐ register_all / unregister_all ┌─────────────────────┐
//! │ Checkpoint           │ ─────────────────────────────▶ │ SharedStateRegistry │
//! │ coordinator          │                                │  key → (handle, rc) │
//! └──────────────────────┘                                └──────────┬──────────┘
//!                                                                    │ rc == 0 or
//!                                                                    │ duplicate
//!                                                                    ▼
//!                                                         ┌─────────────────────┐
//!                                                         │ DisposalExecutor    │
//!                                                         │  (off the lock)     │
//!                                                         └─────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`handle`]: State handles, registry keys and key-group ranges
//! - [`composite`]: Composite snapshot handles that contribute shared state
//! - [`registry`]: The reference-counting registry
//! - [`disposal`]: Executors that discard state off the registry lock
//! - [`error`]: Error types

pub mod composite;
pub mod disposal;
pub mod error;
pub mod handle;
pub mod registry;

pub use composite::{CompositeStateHandle, IncrementalKeyedStateHandle, OperatorSubtaskState};
pub use disposal::{DirectExecutor, DisposalExecutor, DisposalTask, TokioDisposalExecutor};
pub use error::SharedStateError;
pub use handle::{
    ByteStreamStateHandle, FileStateHandle, KeyGroupRange, PlaceholderStreamStateHandle,
    SharedStateRegistryKey, StreamStateHandle,
};
pub use registry::{RegistrationResult, SharedStateRegistration, SharedStateRegistry};
