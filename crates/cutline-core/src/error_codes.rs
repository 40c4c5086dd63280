//! Cutline structured error code registry.
//!
//! Every protocol-violation error in Cutline carries a stable `CUT-NNNN`
//! code that is:
//! - Present in the error message (grep-able in logs)
//! - Present in the source code (grep-able in code)
//! - Stable across versions (codes are never reused)
//!
//! # Code Ranges
//!
//! | Range | Category |
//! |-------|----------|
//! | `CUT-4xxx` | Record decoding |
//! | `CUT-5xxx` | Input gate / channel I/O |
//! | `CUT-61xx` | Barrier alignment |
//! | `CUT-62xx` | Shared state registry |
//!
//! The registry codes are consumed by `cutline-storage`; this module is the
//! canonical registry for the whole workspace.

// ── Record decoding (CUT-4xxx) ──

/// A record could not be decoded from its framed bytes.
pub const RECORD_DECODE_FAILED: &str = "CUT-4001";
/// A length prefix announced a record larger than the configured maximum.
pub const RECORD_TOO_LARGE: &str = "CUT-4002";

// ── Input gate (CUT-5xxx) ──

/// The input gate failed to deliver the next buffer or event.
pub const GATE_FAILURE: &str = "CUT-5001";
/// An event arrived for a channel that already reported end of partition.
pub const GATE_CHANNEL_CLOSED: &str = "CUT-5002";

// ── Barrier alignment (CUT-61xx) ──

/// A barrier or event referenced a channel index outside `0..num_channels`.
pub const CHANNEL_OUT_OF_RANGE: &str = "CUT-6101";
/// A channel delivered the barrier of the in-flight alignment twice.
pub const DUPLICATE_BARRIER: &str = "CUT-6102";
/// An alignment buffer or gate was built with zero channels.
pub const INVALID_CHANNEL_COUNT: &str = "CUT-6103";

// ── Shared state registry (CUT-62xx) ──

/// `unregister_reference` was called for a key that is not registered.
pub const SHARED_STATE_NOT_REGISTERED: &str = "CUT-6201";
/// The registry was used after it was closed.
pub const REGISTRY_CLOSED: &str = "CUT-6202";
